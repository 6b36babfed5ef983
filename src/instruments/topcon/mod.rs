//! Topcon total station drivers.

pub mod gts_300_series;
