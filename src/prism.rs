//! Prism offset model.
//!
//! Offset direction is always FROM the point TO the prism, as viewed from
//! the occupied station. The sign conventions are fixed:
//!
//! | offset    | positive          | negative           |
//! |-----------|-------------------|--------------------|
//! | vertical  | Up                | Down               |
//! | latitude  | North             | South              |
//! | longitude | East              | West               |
//! | radial    | Away              | Toward             |
//! | tangent   | Right             | Left               |
//! | wedge     | Clockwise         | Counter-Clockwise  |
//!
//! Callers set offsets as a magnitude plus a direction word; the model
//! stores the signed value and applies the whole stack to each raw
//! measurement.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyError};
use crate::geodesy::{self, Point};
use crate::instruments::RawMeasurement;

/// The six prism offset components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OffsetComponent {
    Vertical,
    Latitude,
    Longitude,
    Radial,
    Tangent,
    Wedge,
}

impl OffsetComponent {
    /// Display name used in validation messages and readable output.
    pub fn name(self) -> &'static str {
        match self {
            OffsetComponent::Vertical => "Vertical",
            OffsetComponent::Latitude => "Latitude",
            OffsetComponent::Longitude => "Longitude",
            OffsetComponent::Radial => "Radial",
            OffsetComponent::Tangent => "Tangent",
            OffsetComponent::Wedge => "Wedge",
        }
    }

    /// The direction words for the positive and negative sign.
    pub fn directions(self) -> (&'static str, &'static str) {
        match self {
            OffsetComponent::Vertical => ("Up", "Down"),
            OffsetComponent::Latitude => ("North", "South"),
            OffsetComponent::Longitude => ("East", "West"),
            OffsetComponent::Radial => ("Away", "Toward"),
            OffsetComponent::Tangent => ("Right", "Left"),
            OffsetComponent::Wedge => ("Clockwise", "Counter-Clockwise"),
        }
    }
}

/// A requested change to one offset component: magnitude plus direction word.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OffsetUpdate {
    pub component: OffsetComponent,
    pub magnitude: f64,
    pub direction: String,
}

/// One component of the readable offset decomposition.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ReadableOffset {
    pub component: &'static str,
    pub magnitude: f64,
    pub direction: &'static str,
}

/// The six signed prism offsets, in meters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PrismOffsets {
    pub vertical_distance: f64,
    pub latitude_distance: f64,
    pub longitude_distance: f64,
    pub radial_distance: f64,
    pub tangent_distance: f64,
    pub wedge_distance: f64,
}

impl PrismOffsets {
    /// Validates and stores one offset: the direction word picks the sign.
    pub fn set(&mut self, component: OffsetComponent, magnitude: f64, direction: &str) -> Result<()> {
        let signed = validate_offset(component, magnitude, direction)?;
        *self.slot(component) = signed;
        Ok(())
    }

    /// Applies a batch of updates all-or-nothing: every update is validated
    /// first and problems are aggregated in order, so a bad direction word
    /// on one component does not half-apply the rest.
    pub fn apply_updates(&mut self, updates: &[OffsetUpdate]) -> Result<()> {
        let mut staged = *self;
        let mut problems = Vec::new();
        for update in updates {
            match validate_offset(update.component, update.magnitude, &update.direction) {
                Ok(signed) => *staged.slot(update.component) = signed,
                Err(err) => problems.extend(err.problems()),
            }
        }
        if problems.is_empty() {
            *self = staged;
            Ok(())
        } else {
            Err(SurveyError::Validation(problems))
        }
    }

    /// The offsets in human-readable form: magnitude plus direction word,
    /// with zero components omitted.
    pub fn readable(&self) -> Vec<ReadableOffset> {
        ALL_COMPONENTS
            .iter()
            .filter_map(|&component| {
                let value = *PrismOffsets::slot_ref(self, component);
                if value == 0.0 {
                    return None;
                }
                let (positive, negative) = component.directions();
                Some(ReadableOffset {
                    component: component.name(),
                    magnitude: value.abs(),
                    direction: if value > 0.0 { positive } else { negative },
                })
            })
            .collect()
    }

    /// Applies the occupied station coordinates, instrument height, and the
    /// full prism offset stack to a raw measurement (which assumes the
    /// instrument sits at the origin). Returns the georeferenced point,
    /// rounded to millimeters.
    ///
    /// The tangent and wedge rotations are folded in as difference vectors
    /// against the raw delta, so they compose with the radial and absolute
    /// offsets applied before them.
    pub fn apply(&self, raw: &RawMeasurement, occupied: Point, instrument_height: f64) -> Point {
        let mut n = raw.delta_n + occupied.n;
        let mut e = raw.delta_e + occupied.e;
        let mut z = raw.delta_z + occupied.z;
        z += instrument_height;
        z += self.vertical_distance;
        n += self.latitude_distance;
        e += self.longitude_distance;
        let (radial_n, radial_e) = geodesy::radial_offset(raw.delta_n, raw.delta_e, self.radial_distance);
        n += radial_n;
        e += radial_e;
        let (tangent_n, tangent_e) =
            geodesy::tangent_offset(raw.delta_n, raw.delta_e, self.tangent_distance);
        n += tangent_n;
        e += tangent_e;
        let (wedge_n, wedge_e) = geodesy::wedge_offset(raw.delta_n, raw.delta_e, self.wedge_distance);
        n += wedge_n;
        e += wedge_e;
        Point {
            n: geodesy::round_mm(n),
            e: geodesy::round_mm(e),
            z: geodesy::round_mm(z),
        }
    }

    fn slot(&mut self, component: OffsetComponent) -> &mut f64 {
        match component {
            OffsetComponent::Vertical => &mut self.vertical_distance,
            OffsetComponent::Latitude => &mut self.latitude_distance,
            OffsetComponent::Longitude => &mut self.longitude_distance,
            OffsetComponent::Radial => &mut self.radial_distance,
            OffsetComponent::Tangent => &mut self.tangent_distance,
            OffsetComponent::Wedge => &mut self.wedge_distance,
        }
    }

    fn slot_ref(&self, component: OffsetComponent) -> &f64 {
        match component {
            OffsetComponent::Vertical => &self.vertical_distance,
            OffsetComponent::Latitude => &self.latitude_distance,
            OffsetComponent::Longitude => &self.longitude_distance,
            OffsetComponent::Radial => &self.radial_distance,
            OffsetComponent::Tangent => &self.tangent_distance,
            OffsetComponent::Wedge => &self.wedge_distance,
        }
    }
}

const ALL_COMPONENTS: [OffsetComponent; 6] = [
    OffsetComponent::Vertical,
    OffsetComponent::Latitude,
    OffsetComponent::Longitude,
    OffsetComponent::Radial,
    OffsetComponent::Tangent,
    OffsetComponent::Wedge,
];

fn validate_offset(component: OffsetComponent, magnitude: f64, direction: &str) -> Result<f64> {
    let mut problems = Vec::new();
    if !magnitude.is_finite() {
        problems.push(format!(
            "The {} Offset distance entered ({magnitude}) is not numerical.",
            component.name()
        ));
    }
    let (positive, negative) = component.directions();
    let signed = if direction.eq_ignore_ascii_case(positive) {
        magnitude.abs()
    } else if direction.eq_ignore_ascii_case(negative) {
        -magnitude.abs()
    } else {
        problems.push(format!(
            "The {} Offset direction entered ({direction}) was invalid. It must be {positive} or {negative}.",
            component.name()
        ));
        0.0
    };
    if problems.is_empty() {
        Ok(signed)
    } else {
        Err(SurveyError::Validation(problems))
    }
}
