//! Survey session orchestration.
//!
//! [`SurveyEngine`] is the context object that owns every piece of mutable
//! survey state (instrument handle, store handle, prism offsets,
//! atmospheric conditions, and the cached session/grouping/staged-shot
//! ids) and sequences the field workflow:
//!
//! ```text
//! NoSession --start_with_{azimuth,backsight,resection}--> SessionActive
//! SessionActive --start_new_grouping--> GroupingActive (nested)
//! GroupingActive --take_shot--> staged shot --save_last_shot--> committed
//! ```
//!
//! Operations are rejected with a `State` error outside their required
//! state. Any validation or hardware failure aborts the whole operation
//! before anything is persisted. On construction the engine re-hydrates
//! its cached ids from the store's current-session/current-grouping
//! pointers, so a process restart resumes where the field crew left off.
//!
//! Callers must serialize access to the engine (one command reaches the
//! instrument at a time); the one safe concurrent entry point is
//! cancellation via [`SurveyEngine::instrument_handle`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::config::Settings;
use crate::error::{Result, SurveyError};
use crate::geodesy::{self, Point};
use crate::instruments::{MeasurementOutcome, RawMeasurement, TotalStation};
use crate::prism::{OffsetComponent, OffsetUpdate, PrismOffsets, ReadableOffset};
use crate::stations::{self, CoordinateInput};
use crate::store::{
    GeometryKind, GroupingRecord, NewGrouping, NewSession, NewShot, Station, SurveyStore,
};

/// Reserved subclassification: committing a shot in such a grouping also
/// promotes the computed point into a reusable station, closing the loop
/// so measured points become control points.
pub const SURVEY_STATION_SUBCLASS: &str = "Survey Station";

/// Result of an operation that embeds a cancelable measurement.
///
/// `Canceled` is success-shaped: the operator abandoned the measurement,
/// nothing was persisted, and the engine state is unchanged.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Canceled,
}

/// A measured shot staged for commit. The deltas carry the atmospheric
/// correction; the point carries the full offset pipeline.
#[derive(Clone, Debug, PartialEq)]
pub struct StagedShot {
    pub delta: RawMeasurement,
    pub point: Point,
    pub recorded: DateTime<Utc>,
}

/// Arguments for the two-call resection start flow.
#[derive(Clone, Debug)]
pub struct ResectionStart {
    pub label: String,
    pub surveyor: String,
    pub sites_id: i64,
    /// Name for the station created at the computed occupied point.
    pub station_name: String,
    /// Left-hand backsight as seen from the occupied point.
    pub left_station_id: i64,
    /// Right-hand backsight as seen from the occupied point.
    pub right_station_id: i64,
    pub instrument_height: f64,
    pub prism_height: f64,
}

/// First-call state cached between the two resection measurements.
struct PendingResection {
    start: ResectionStart,
    left: Station,
    right: Station,
    first_delta: RawMeasurement,
}

pub struct SurveyEngine {
    instrument: Arc<dyn TotalStation>,
    store: Arc<dyn SurveyStore>,
    backsight_error_limit_cm: f64,
    prism: PrismOffsets,
    pressure_mmhg: f64,
    temperature_c: f64,
    session_id: Option<i64>,
    occupied: Option<Station>,
    instrument_height: f64,
    grouping: Option<GroupingRecord>,
    staged_shot: Option<StagedShot>,
    resection: Option<PendingResection>,
}

impl SurveyEngine {
    /// Builds the engine and re-hydrates persisted state: prism offsets,
    /// atmospheric conditions, and, when the store's pointers say a
    /// session or grouping is still open, the occupied point, instrument
    /// height, and grouping. Cached ids are never assumed absent just
    /// because the process restarted.
    pub fn new(
        instrument: Arc<dyn TotalStation>,
        store: Arc<dyn SurveyStore>,
        settings: &Settings,
    ) -> Result<Self> {
        let state = store.saved_state()?;
        let mut engine = Self {
            instrument,
            store,
            backsight_error_limit_cm: settings.backsight.error_limit_cm,
            prism: state.prism,
            pressure_mmhg: state.pressure_mmhg,
            temperature_c: state.temperature_c,
            session_id: None,
            occupied: None,
            instrument_height: 0.0,
            grouping: None,
            staged_shot: None,
            resection: None,
        };
        if let Some(session_id) = state.current_session {
            engine.hydrate_session(session_id, state.current_grouping)?;
        } else {
            // Fresh start: seed the conditions from configuration.
            engine.pressure_mmhg = settings.atmosphere.pressure_mmhg;
            engine.temperature_c = settings.atmosphere.temperature_c;
            engine
                .store
                .save_atmosphere(engine.pressure_mmhg, engine.temperature_c)?;
        }
        Ok(engine)
    }

    fn hydrate_session(&mut self, session_id: i64, grouping_id: Option<i64>) -> Result<()> {
        let session = self.store.session(session_id)?.ok_or_else(|| {
            SurveyError::Persistence(format!(
                "Current session {session_id} was not found in the store."
            ))
        })?;
        let occupied = self
            .store
            .station_by_id(session.stations_id_occupied)?
            .ok_or_else(|| {
                SurveyError::Persistence(format!(
                    "Occupied station {} was not found in the store.",
                    session.stations_id_occupied
                ))
            })?;
        if let Some(grouping_id) = grouping_id {
            self.grouping = Some(self.store.grouping(grouping_id)?.ok_or_else(|| {
                SurveyError::Persistence(format!(
                    "Current grouping {grouping_id} was not found in the store."
                ))
            })?);
        }
        self.session_id = Some(session_id);
        self.instrument_height = session.instrument_height;
        self.occupied = Some(occupied);
        info!("Re-hydrated open session {session_id} from the store");
        Ok(())
    }

    /// Handle for canceling an in-flight measurement without waiting for
    /// the engine lock.
    pub fn instrument_handle(&self) -> Arc<dyn TotalStation> {
        self.instrument.clone()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.session_id
    }

    pub fn grouping_id(&self) -> Option<i64> {
        self.grouping.as_ref().map(|g| g.id)
    }

    pub fn occupied_point(&self) -> Option<Point> {
        self.occupied.as_ref().map(Station::point)
    }

    pub fn instrument_height(&self) -> f64 {
        self.instrument_height
    }

    pub fn staged_shot(&self) -> Option<&StagedShot> {
        self.staged_shot.as_ref()
    }

    pub fn prism_offsets(&self) -> &PrismOffsets {
        &self.prism
    }

    pub fn readable_prism_offsets(&self) -> Vec<ReadableOffset> {
        self.prism.readable()
    }

    /// Validates and applies prism offset updates, then persists the new
    /// offsets so they survive a restart.
    pub fn set_prism_offsets(&mut self, updates: &[OffsetUpdate]) -> Result<()> {
        self.prism.apply_updates(updates)?;
        self.store.save_prism_offsets(&self.prism)?;
        info!("Prism offsets are now {:?}", self.prism);
        Ok(())
    }

    pub fn atmospheric_conditions(&self) -> (f64, f64) {
        (self.pressure_mmhg, self.temperature_c)
    }

    pub fn set_atmospheric_conditions(
        &mut self,
        pressure_mmhg: f64,
        temperature_c: f64,
    ) -> Result<()> {
        let problems = validate_atmosphere(pressure_mmhg, temperature_c);
        if !problems.is_empty() {
            return Err(SurveyError::Validation(problems));
        }
        self.store.save_atmosphere(pressure_mmhg, temperature_c)?;
        self.pressure_mmhg = pressure_mmhg;
        self.temperature_c = temperature_c;
        info!("Atmospheric conditions set to {pressure_mmhg}mmHg at {temperature_c}°C");
        Ok(())
    }

    /// Starts a session by sighting a landmark of known azimuth.
    #[allow(clippy::too_many_arguments)]
    pub async fn start_with_azimuth(
        &mut self,
        label: &str,
        surveyor: &str,
        sites_id: i64,
        occupied_station_id: i64,
        instrument_height: f64,
        degrees: u32,
        minutes: u32,
        seconds: u32,
    ) -> Result<i64> {
        let problems = stations::validate_instrument_height(instrument_height);
        if !problems.is_empty() {
            return Err(SurveyError::Validation(problems));
        }
        let occupied = self.require_station(sites_id, occupied_station_id)?;
        self.end_open_session()?;
        self.instrument.set_azimuth(degrees, minutes, seconds).await?;
        let azimuth = geodesy::Dms {
            degrees,
            minutes,
            seconds,
        };
        let session_id = self.persist_session(
            NewSession {
                label: label.to_string(),
                surveyor: surveyor.to_string(),
                stations_id_occupied: occupied.id,
                stations_id_backsight: None,
                azimuth: azimuth.to_string(),
                instrument_height,
                pressure_mmhg: self.pressure_mmhg,
                temperature_c: self.temperature_c,
            },
            occupied,
            instrument_height,
        )?;
        info!("Session {session_id} started with azimuth {azimuth}");
        Ok(session_id)
    }

    /// Starts a session by measuring a backsight to a known station. The
    /// instrument height is derived from the measured vertical delta, and
    /// the measured horizontal distance must agree with the two stations'
    /// coordinates within the configured limit.
    pub async fn start_with_backsight(
        &mut self,
        label: &str,
        surveyor: &str,
        sites_id: i64,
        occupied_station_id: i64,
        backsight_station_id: i64,
        prism_height: f64,
    ) -> Result<Outcome<i64>> {
        let mut problems = Vec::new();
        if occupied_station_id == backsight_station_id {
            problems.push(format!(
                "The Occupied Point and Backsight Station are the same (id = {occupied_station_id})."
            ));
        }
        if !prism_height.is_finite() || prism_height < 0.0 {
            problems.push(format!("An invalid prism height ({prism_height}m) was entered."));
        }
        if !problems.is_empty() {
            return Err(SurveyError::Validation(problems));
        }
        let occupied = self.require_station(sites_id, occupied_station_id)?;
        let backsight = self.require_station(sites_id, backsight_station_id)?;
        self.end_open_session()?;

        // The prism sits on the backsight station: surveyed points are the
        // ground under the prism.
        self.prism
            .set(OffsetComponent::Vertical, prism_height, "Down")?;
        self.store.save_prism_offsets(&self.prism)?;

        let dms = geodesy::to_dms(geodesy::azimuth(occupied.point(), backsight.point()));
        self.instrument
            .set_azimuth(dms.degrees, dms.minutes, dms.seconds)
            .await?;
        let delta = match self.instrument.take_measurement().await? {
            MeasurementOutcome::Canceled => return Ok(Outcome::Canceled),
            MeasurementOutcome::Measured(delta) => delta,
        };

        let variance = geodesy::backsight_variance(
            occupied.point(),
            backsight.point(),
            delta.delta_n,
            delta.delta_e,
        );
        if variance >= self.backsight_error_limit_cm {
            return Err(SurveyError::validation(format!(
                "The measured distance between the Occupied Point and the Backsight Station is off by {variance}cm, which exceeds the limit of {}cm.",
                self.backsight_error_limit_cm
            )));
        }
        let instrument_height = geodesy::round_mm(
            (occupied.elevation - backsight.elevation) + (delta.delta_z - prism_height),
        );
        let problems = stations::validate_instrument_height(instrument_height);
        if !problems.is_empty() {
            return Err(SurveyError::Validation(problems));
        }

        let session_id = self.persist_session(
            NewSession {
                label: label.to_string(),
                surveyor: surveyor.to_string(),
                stations_id_occupied: occupied.id,
                stations_id_backsight: Some(backsight.id),
                azimuth: dms.to_string(),
                instrument_height,
                pressure_mmhg: self.pressure_mmhg,
                temperature_c: self.temperature_c,
            },
            occupied,
            instrument_height,
        )?;
        info!(
            "Session {session_id} started with a backsight; instrument height {instrument_height}m"
        );
        Ok(Outcome::Completed(session_id))
    }

    /// First call of the resection flow: validates the inputs and measures
    /// the left-hand backsight, caching the shot. Any previously cached
    /// first shot is discarded.
    pub async fn start_resection(&mut self, start: &ResectionStart) -> Result<Outcome<()>> {
        let mut problems = stations::validate_instrument_height(start.instrument_height);
        if start.left_station_id == start.right_station_id {
            problems.push(format!(
                "The left and right backsight stations are the same (id = {}).",
                start.left_station_id
            ));
        }
        if !start.prism_height.is_finite() || start.prism_height < 0.0 {
            problems.push(format!(
                "An invalid prism height ({}m) was entered.",
                start.prism_height
            ));
        }
        if start.station_name.trim().is_empty() {
            problems.push("No station name was given.".to_string());
        }
        if !problems.is_empty() {
            return Err(SurveyError::Validation(problems));
        }
        let left = self.require_station(start.sites_id, start.left_station_id)?;
        let right = self.require_station(start.sites_id, start.right_station_id)?;
        self.end_open_session()?;
        self.resection = None;

        self.prism
            .set(OffsetComponent::Vertical, start.prism_height, "Down")?;
        self.store.save_prism_offsets(&self.prism)?;

        let first_delta = match self.instrument.take_measurement().await? {
            MeasurementOutcome::Canceled => return Ok(Outcome::Canceled),
            MeasurementOutcome::Measured(delta) => delta,
        };
        self.resection = Some(PendingResection {
            start: start.clone(),
            left,
            right,
            first_delta,
        });
        info!("Resection started: left backsight measured");
        Ok(Outcome::Completed(()))
    }

    /// Second call of the resection flow: measures the right-hand
    /// backsight, checks the elevation agreement of the two sightings,
    /// computes the occupied point, saves it as a new station, orients the
    /// instrument toward the right backsight, and opens the session.
    ///
    /// A canceled measurement keeps the cached first shot so the operator
    /// can re-aim and retry; an inconsistent pair discards it.
    pub async fn complete_resection(&mut self) -> Result<Outcome<i64>> {
        if self.resection.is_none() {
            return Err(SurveyError::State(
                "There is no resection in progress.".to_string(),
            ));
        }
        let second_delta = match self.instrument.take_measurement().await? {
            MeasurementOutcome::Canceled => return Ok(Outcome::Canceled),
            MeasurementOutcome::Measured(delta) => delta,
        };
        let Some(pending) = self.resection.take() else {
            return Err(SurveyError::State(
                "There is no resection in progress.".to_string(),
            ));
        };

        // Each sighting independently estimates the occupied elevation.
        let z_left = pending.left.elevation - pending.first_delta.delta_z
            - pending.start.instrument_height
            + pending.start.prism_height;
        let z_right = pending.right.elevation - second_delta.delta_z
            - pending.start.instrument_height
            + pending.start.prism_height;
        let variance = ((z_left - z_right).abs() * 100.0 * 10.0).round() / 10.0;
        if variance >= self.backsight_error_limit_cm {
            return Err(SurveyError::validation(format!(
                "The occupied point's elevation differs by {variance}cm between the two backsight shots, which exceeds the limit of {}cm.",
                self.backsight_error_limit_cm
            )));
        }

        let r_left = pending.first_delta.delta_n.hypot(pending.first_delta.delta_e);
        let r_right = second_delta.delta_n.hypot(second_delta.delta_e);
        let (occupied_n, occupied_e) =
            geodesy::resection(pending.left.point(), pending.right.point(), r_left, r_right);
        let occupied_z = geodesy::round_mm((z_left + z_right) / 2.0);

        let station_id = stations::save_station(
            self.store.as_ref(),
            pending.start.sites_id,
            &pending.start.station_name,
            &CoordinateInput::Site {
                northing: occupied_n,
                easting: occupied_e,
                elevation: occupied_z,
            },
            Some("Occupied point established by resection."),
        )?;
        let occupied = self.store.station_by_id(station_id)?.ok_or_else(|| {
            SurveyError::Persistence(format!(
                "Station {station_id} disappeared after it was saved."
            ))
        })?;

        let dms = geodesy::to_dms(geodesy::azimuth(occupied.point(), pending.right.point()));
        self.instrument
            .set_azimuth(dms.degrees, dms.minutes, dms.seconds)
            .await?;

        let session_id = self.persist_session(
            NewSession {
                label: pending.start.label.clone(),
                surveyor: pending.start.surveyor.clone(),
                stations_id_occupied: station_id,
                stations_id_backsight: Some(pending.right.id),
                azimuth: dms.to_string(),
                instrument_height: pending.start.instrument_height,
                pressure_mmhg: self.pressure_mmhg,
                temperature_c: self.temperature_c,
            },
            occupied,
            pending.start.instrument_height,
        )?;
        info!(
            "Session {session_id} started by resection at ({occupied_n}, {occupied_e}, {occupied_z})"
        );
        Ok(Outcome::Completed(session_id))
    }

    /// Discards any cached first-shot state from an interactive resection.
    pub fn abort_resection(&mut self) {
        if self.resection.take().is_some() {
            info!("Resection aborted; cached backsight shot discarded");
        }
    }

    /// Opens a new grouping in the active session. An open grouping is
    /// ended first.
    pub fn start_new_grouping(
        &mut self,
        geometry: GeometryKind,
        class: &str,
        subclass: &str,
        label: &str,
        description: Option<&str>,
    ) -> Result<i64> {
        let Some(session_id) = self.session_id else {
            return Err(SurveyError::State(
                "There is no currently active surveying session.".to_string(),
            ));
        };
        if self.grouping.is_some() {
            self.end_current_grouping()?;
        }
        let grouping_id = self.store.insert_grouping(&NewGrouping {
            sessions_id: session_id,
            geometry,
            class: class.trim().to_string(),
            subclass: subclass.trim().to_string(),
            label: label.trim().to_string(),
            description: description
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        })?;
        self.store.set_current_grouping(Some(grouping_id))?;
        self.grouping = Some(self.store.grouping(grouping_id)?.ok_or_else(|| {
            SurveyError::Persistence(format!(
                "Grouping {grouping_id} disappeared after it was saved."
            ))
        })?);
        info!("Grouping {grouping_id} started");
        Ok(grouping_id)
    }

    /// Ends the active grouping, discarding any staged shot taken in it.
    pub fn end_current_grouping(&mut self) -> Result<()> {
        let Some(grouping) = self.grouping.take() else {
            return Err(SurveyError::State(
                "There is no currently active grouping.".to_string(),
            ));
        };
        if let Err(e) = self.store.set_current_grouping(None) {
            // Put the cache back so the engine and store keep agreeing.
            self.grouping = Some(grouping);
            return Err(e);
        }
        self.staged_shot = None;
        info!("Grouping {} ended", grouping.id);
        Ok(())
    }

    /// Measures a point and stages it against the active grouping,
    /// applying the atmospheric correction and the full prism offset
    /// pipeline. Overwrites any previously staged (unsaved) shot; a
    /// canceled measurement leaves everything untouched.
    pub async fn take_shot(&mut self) -> Result<Outcome<StagedShot>> {
        if self.grouping.is_none() {
            return Err(SurveyError::State(
                "A grouping must be started before taking shots.".to_string(),
            ));
        }
        let occupied = self.occupied.as_ref().map(Station::point).ok_or_else(|| {
            SurveyError::State("There is no currently active surveying session.".to_string())
        })?;
        let delta = match self.instrument.take_measurement().await? {
            MeasurementOutcome::Canceled => return Ok(Outcome::Canceled),
            MeasurementOutcome::Measured(delta) => delta,
        };
        let (delta_n, delta_e, delta_z) = geodesy::atmospheric_correction(
            delta.delta_n,
            delta.delta_e,
            delta.delta_z,
            self.pressure_mmhg,
            self.temperature_c,
        );
        let corrected = RawMeasurement {
            delta_n,
            delta_e,
            delta_z,
        };
        let point = self.prism.apply(&corrected, occupied, self.instrument_height);
        let staged = StagedShot {
            delta: corrected,
            point,
            recorded: Utc::now(),
        };
        self.staged_shot = Some(staged.clone());
        info!(
            "Shot staged at ({}, {}, {})",
            point.n, point.e, point.z
        );
        Ok(Outcome::Completed(staged))
    }

    /// Commits the staged shot against the active grouping with a snapshot
    /// of the prism offsets in force. An isolated-point grouping is ended
    /// automatically, and a shot in a `"Survey Station"`-subclassified
    /// grouping is promoted into a new station.
    pub fn save_last_shot(&mut self, label: Option<&str>) -> Result<i64> {
        let Some(grouping) = self.grouping.clone() else {
            return Err(SurveyError::State(
                "A grouping must be started before saving shots.".to_string(),
            ));
        };
        let Some(staged) = self.staged_shot.clone() else {
            return Err(SurveyError::State(
                "There is no staged shot to save.".to_string(),
            ));
        };
        let label = label.map(str::trim).filter(|l| !l.is_empty());
        let shot_id = self.store.insert_shot(&NewShot {
            groupings_id: grouping.id,
            label: label.map(str::to_string),
            delta: staged.delta,
            point: staged.point,
            prism: self.prism,
            recorded: staged.recorded,
        })?;
        self.staged_shot = None;
        info!("Shot {shot_id} saved to grouping {}", grouping.id);

        if grouping.geometry == GeometryKind::IsolatedPoint {
            self.end_current_grouping()?;
        }
        if grouping.subclass == SURVEY_STATION_SUBCLASS {
            let occupied = self.occupied.as_ref().ok_or_else(|| {
                SurveyError::State("There is no currently active surveying session.".to_string())
            })?;
            let station_name = label.unwrap_or(&grouping.label);
            let station_id = stations::save_station(
                self.store.as_ref(),
                occupied.sites_id,
                station_name,
                &CoordinateInput::Site {
                    northing: staged.point.n,
                    easting: staged.point.e,
                    elevation: staged.point.z,
                },
                Some(&format!("Set by shot {shot_id}.")),
            )?;
            info!("Shot {shot_id} promoted to station {station_id} ({station_name})");
        }
        Ok(shot_id)
    }

    /// Ends the active session. The grouping must be ended first.
    pub fn end_current_session(&mut self) -> Result<()> {
        if self.grouping.is_some() {
            return Err(SurveyError::State(
                "End the current grouping before ending the session.".to_string(),
            ));
        }
        let Some(session_id) = self.session_id else {
            return Err(SurveyError::State(
                "There is no currently active surveying session.".to_string(),
            ));
        };
        self.store.end_session(session_id)?;
        self.store.set_current_session(None)?;
        self.session_id = None;
        self.occupied = None;
        self.instrument_height = 0.0;
        self.staged_shot = None;
        info!("Session {session_id} ended");
        Ok(())
    }

    /// All three start operations replace an open session; a still-open
    /// grouping blocks that before any hardware command is sent.
    fn end_open_session(&mut self) -> Result<()> {
        if self.session_id.is_none() {
            return Ok(());
        }
        if self.grouping.is_some() {
            return Err(SurveyError::State(
                "End the current grouping before starting a new session.".to_string(),
            ));
        }
        warn!("A session was still open; ending it before starting the new one");
        self.end_current_session()
    }

    fn persist_session(
        &mut self,
        session: NewSession,
        occupied: Station,
        instrument_height: f64,
    ) -> Result<i64> {
        let session_id = self.store.insert_session(&session)?;
        self.store.set_current_session(Some(session_id))?;
        self.session_id = Some(session_id);
        self.occupied = Some(occupied);
        self.instrument_height = instrument_height;
        self.staged_shot = None;
        Ok(session_id)
    }

    fn require_station(&self, sites_id: i64, id: i64) -> Result<Station> {
        self.store.station(sites_id, id)?.ok_or_else(|| {
            SurveyError::validation(format!("Station id {id} was not found at this site."))
        })
    }
}

/// Plausibility check on atmospheric conditions; generous enough for any
/// field site, tight enough to reject unit mistakes (hPa, °F).
pub(crate) fn validate_atmosphere(pressure_mmhg: f64, temperature_c: f64) -> Vec<String> {
    let mut problems = Vec::new();
    if !(400.0..=900.0).contains(&pressure_mmhg) {
        problems.push(format!(
            "The air pressure entered ({pressure_mmhg}mmHg) is outside the plausible range (400 to 900mmHg)."
        ));
    }
    if !(-40.0..=60.0).contains(&temperature_c) {
        problems.push(format!(
            "The air temperature entered ({temperature_c}°C) is outside the plausible range (-40 to 60°C)."
        ));
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::demo::DemoTotalStation;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn engine_with_station() -> (SurveyEngine, Arc<MemoryStore>, i64, i64) {
        let store = Arc::new(MemoryStore::new());
        let site = store.add_site("Test Site");
        let station = store
            .insert_station(&crate::store::NewStation {
                sites_id: site,
                name: "Datum".to_string(),
                northing: 1000.0,
                easting: 2000.0,
                elevation: 10.0,
                utmzone: None,
                latitude: None,
                longitude: None,
                description: None,
            })
            .unwrap();
        let settings = Settings::new(None).unwrap();
        let instrument = Arc::new(DemoTotalStation::with_delay(Duration::from_millis(1)));
        let engine = SurveyEngine::new(instrument, store.clone(), &settings).unwrap();
        (engine, store, site, station)
    }

    #[tokio::test]
    async fn workflow_state_errors() {
        let (mut engine, _store, site, station) = engine_with_station();

        // No session yet.
        let err = engine
            .start_new_grouping(GeometryKind::PointCloud, "Topo", "Ground", "Surface", None)
            .unwrap_err();
        assert!(matches!(err, SurveyError::State(_)));
        assert!(matches!(engine.take_shot().await.unwrap_err(), SurveyError::State(_)));
        assert!(matches!(engine.end_current_session().unwrap_err(), SurveyError::State(_)));

        engine
            .start_with_azimuth("Day 1", "R. Chen", site, station, 1.5, 90, 0, 0)
            .await
            .unwrap();

        // Session but no grouping.
        assert!(matches!(engine.take_shot().await.unwrap_err(), SurveyError::State(_)));
        assert!(matches!(
            engine.save_last_shot(None).unwrap_err(),
            SurveyError::State(_)
        ));

        engine
            .start_new_grouping(GeometryKind::PointCloud, "Topo", "Ground", "Surface", None)
            .unwrap();

        // Grouping open: session cannot end, a new session cannot start.
        assert!(matches!(engine.end_current_session().unwrap_err(), SurveyError::State(_)));
        let err = engine
            .start_with_azimuth("Day 2", "R. Chen", site, station, 1.5, 0, 0, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, SurveyError::State(_)));

        // Grouping open but nothing staged: save still refuses.
        assert!(matches!(
            engine.save_last_shot(None).unwrap_err(),
            SurveyError::State(_)
        ));

        engine.end_current_grouping().unwrap();
        engine.end_current_session().unwrap();
        assert_eq!(engine.session_id(), None);
    }

    #[tokio::test]
    async fn session_persists_and_rehydrates() {
        let (mut engine, store, site, station) = engine_with_station();
        let session_id = engine
            .start_with_azimuth("Day 1", "R. Chen", site, station, 1.4, 122, 30, 15)
            .await
            .unwrap();
        let grouping_id = engine
            .start_new_grouping(GeometryKind::OpenPolygon, "Wall", "Footing", "W-1", None)
            .unwrap();

        let record = store.session(session_id).unwrap().unwrap();
        assert_eq!(record.azimuth, "122° 30' 15\"");
        assert_eq!(record.instrument_height, 1.4);
        assert!(record.ended.is_none());

        // A second engine on the same store resumes the open session.
        let settings = Settings::new(None).unwrap();
        let instrument = Arc::new(DemoTotalStation::with_delay(Duration::from_millis(1)));
        let resumed = SurveyEngine::new(instrument, store.clone(), &settings).unwrap();
        assert_eq!(resumed.session_id(), Some(session_id));
        assert_eq!(resumed.grouping_id(), Some(grouping_id));
        assert_eq!(resumed.occupied_point(), Some(Point::new(1000.0, 2000.0, 10.0)));
        assert_eq!(resumed.instrument_height(), 1.4);
    }

    #[tokio::test]
    async fn instrument_height_is_validated_before_hardware() {
        let (mut engine, _store, site, station) = engine_with_station();
        let err = engine
            .start_with_azimuth("Day 1", "R. Chen", site, station, 2.4, 0, 0, 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unrealistically high"));
        assert_eq!(engine.session_id(), None);
    }

    #[tokio::test]
    async fn backsight_rejects_same_station() {
        let (mut engine, _store, site, station) = engine_with_station();
        let err = engine
            .start_with_backsight("Day 1", "R. Chen", site, station, station, 1.3)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Occupied Point and Backsight Station are the same"));
    }

    #[test]
    fn prism_offsets_persist_through_the_store() {
        let (mut engine, store, _site, _station) = engine_with_station();
        engine
            .set_prism_offsets(&[OffsetUpdate {
                component: OffsetComponent::Vertical,
                magnitude: 0.3,
                direction: "Down".to_string(),
            }])
            .unwrap();
        assert_eq!(engine.prism_offsets().vertical_distance, -0.3);
        assert_eq!(store.saved_state().unwrap().prism.vertical_distance, -0.3);
        assert_eq!(engine.readable_prism_offsets().len(), 1);
    }

    #[test]
    fn atmosphere_is_validated_and_persisted() {
        let (mut engine, store, _site, _station) = engine_with_station();
        let err = engine.set_atmospheric_conditions(1013.0, 120.0).unwrap_err();
        assert_eq!(err.problems().len(), 2);
        engine.set_atmospheric_conditions(640.0, 28.0).unwrap();
        assert_eq!(engine.atmospheric_conditions(), (640.0, 28.0));
        let state = store.saved_state().unwrap();
        assert_eq!(state.pressure_mmhg, 640.0);
        assert_eq!(state.temperature_c, 28.0);
    }

    #[tokio::test]
    async fn abort_resection_without_one_is_a_no_op() {
        let (mut engine, _store, _site, _station) = engine_with_station();
        engine.abort_resection();
        // Nothing pending: completing still reports the state error.
        let err = engine.complete_resection().await.unwrap_err();
        assert!(matches!(err, SurveyError::State(_)));
    }

    #[test]
    fn atmosphere_plausibility_ranges() {
        assert!(validate_atmosphere(760.0, 15.0).is_empty());
        assert!(validate_atmosphere(400.0, -40.0).is_empty());
        assert_eq!(validate_atmosphere(399.9, 61.0).len(), 2);
        assert_eq!(validate_atmosphere(f64::NAN, 15.0).len(), 1);
    }
}
