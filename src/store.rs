//! Persistence gateway for survey data.
//!
//! The workflow engine treats persistence as an abstract row store behind
//! the [`SurveyStore`] trait: typed inserts and lookups for stations,
//! sessions, groupings, and shots, plus the saved-state pointers (current
//! session, current grouping, prism offsets, atmospheric conditions) used
//! to re-hydrate the engine after a restart. No SQL or schema lives in
//! this crate; a database-backed implementation supplies it elsewhere.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and demo
//! deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyError};
use crate::geodesy::Point;
use crate::instruments::RawMeasurement;
use crate::prism::PrismOffsets;

/// A known control point at a site.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Station {
    pub id: i64,
    pub sites_id: i64,
    pub name: String,
    pub northing: f64,
    pub easting: f64,
    pub elevation: f64,
    pub utmzone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub description: Option<String>,
}

impl Station {
    /// The station's grid coordinates as a point.
    pub fn point(&self) -> Point {
        Point::new(self.northing, self.easting, self.elevation)
    }
}

/// A station row awaiting an id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewStation {
    pub sites_id: i64,
    pub name: String,
    pub northing: f64,
    pub easting: f64,
    pub elevation: f64,
    pub utmzone: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub description: Option<String>,
}

/// A surveying session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: i64,
    pub label: String,
    pub surveyor: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub stations_id_occupied: i64,
    pub stations_id_backsight: Option<i64>,
    /// Formatted angle string, e.g. `122° 3' 30"`.
    pub azimuth: String,
    pub instrument_height: f64,
    pub pressure_mmhg: f64,
    pub temperature_c: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewSession {
    pub label: String,
    pub surveyor: String,
    pub stations_id_occupied: i64,
    pub stations_id_backsight: Option<i64>,
    pub azimuth: String,
    pub instrument_height: f64,
    pub pressure_mmhg: f64,
    pub temperature_c: f64,
}

/// Geometry of a grouping's shots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryKind {
    IsolatedPoint,
    PointCloud,
    OpenPolygon,
    ClosedPolygon,
}

/// A labeled batch of shots sharing geometry and classification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupingRecord {
    pub id: i64,
    pub sessions_id: i64,
    pub geometry: GeometryKind,
    pub class: String,
    pub subclass: String,
    pub label: String,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewGrouping {
    pub sessions_id: i64,
    pub geometry: GeometryKind,
    pub class: String,
    pub subclass: String,
    pub label: String,
    pub description: Option<String>,
}

/// A committed shot: the corrected instrument deltas, the georeferenced
/// point, and a snapshot of the prism offsets in force when it was taken.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShotRecord {
    pub id: i64,
    pub groupings_id: i64,
    pub label: Option<String>,
    pub delta: RawMeasurement,
    pub point: Point,
    pub prism: PrismOffsets,
    pub recorded: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewShot {
    pub groupings_id: i64,
    pub label: Option<String>,
    pub delta: RawMeasurement,
    pub point: Point,
    pub prism: PrismOffsets,
    pub recorded: DateTime<Utc>,
}

/// Engine state persisted across restarts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedState {
    pub prism: PrismOffsets,
    pub pressure_mmhg: f64,
    pub temperature_c: f64,
    pub current_session: Option<i64>,
    pub current_grouping: Option<i64>,
}

impl Default for SavedState {
    /// A blank store starts at the instrument's 0 ppm reference
    /// conditions (760 mmHg at 15 °C) with all offsets zero.
    fn default() -> Self {
        SavedState {
            prism: PrismOffsets::default(),
            pressure_mmhg: 760.0,
            temperature_c: 15.0,
            current_session: None,
            current_grouping: None,
        }
    }
}

/// The row store consumed by the workflow engine.
///
/// Reads may run concurrently; writes that move the current-session or
/// current-grouping pointers are expected to be atomic with respect to
/// each other.
pub trait SurveyStore: Send + Sync {
    fn saved_state(&self) -> Result<SavedState>;
    fn save_prism_offsets(&self, offsets: &PrismOffsets) -> Result<()>;
    fn save_atmosphere(&self, pressure_mmhg: f64, temperature_c: f64) -> Result<()>;
    fn set_current_session(&self, id: Option<i64>) -> Result<()>;
    fn set_current_grouping(&self, id: Option<i64>) -> Result<()>;

    fn site_name(&self, id: i64) -> Result<Option<String>>;
    fn station(&self, sites_id: i64, id: i64) -> Result<Option<Station>>;
    fn station_by_id(&self, id: i64) -> Result<Option<Station>>;
    fn station_name_exists(&self, sites_id: i64, name: &str) -> Result<bool>;
    /// True when an existing station at the site lies within `tolerance`
    /// meters (in both northing and easting) of the given coordinates.
    fn station_within(
        &self,
        sites_id: i64,
        northing: f64,
        easting: f64,
        tolerance: f64,
    ) -> Result<bool>;
    fn insert_station(&self, station: &NewStation) -> Result<i64>;

    fn insert_session(&self, session: &NewSession) -> Result<i64>;
    fn session(&self, id: i64) -> Result<Option<SessionRecord>>;
    fn end_session(&self, id: i64) -> Result<()>;

    fn insert_grouping(&self, grouping: &NewGrouping) -> Result<i64>;
    fn grouping(&self, id: i64) -> Result<Option<GroupingRecord>>;

    fn insert_shot(&self, shot: &NewShot) -> Result<i64>;
    fn shot(&self, id: i64) -> Result<Option<ShotRecord>>;
}

/// In-process [`SurveyStore`] for tests and demo deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    next_id: i64,
    sites: HashMap<i64, String>,
    stations: Vec<Station>,
    sessions: Vec<SessionRecord>,
    groupings: Vec<GroupingRecord>,
    shots: Vec<ShotRecord>,
    state: SavedState,
}

impl Inner {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a site and returns its id.
    pub fn add_site(&self, name: &str) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.sites.insert(id, name.to_string());
        id
    }

    // A poisoned lock means a panic mid-write; the store's data can no
    // longer be trusted either way, so propagate the panic.
    #[allow(clippy::unwrap_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

impl SurveyStore for MemoryStore {
    fn saved_state(&self) -> Result<SavedState> {
        Ok(self.lock().state.clone())
    }

    fn save_prism_offsets(&self, offsets: &PrismOffsets) -> Result<()> {
        self.lock().state.prism = *offsets;
        Ok(())
    }

    fn save_atmosphere(&self, pressure_mmhg: f64, temperature_c: f64) -> Result<()> {
        let mut inner = self.lock();
        inner.state.pressure_mmhg = pressure_mmhg;
        inner.state.temperature_c = temperature_c;
        Ok(())
    }

    fn set_current_session(&self, id: Option<i64>) -> Result<()> {
        self.lock().state.current_session = id;
        Ok(())
    }

    fn set_current_grouping(&self, id: Option<i64>) -> Result<()> {
        self.lock().state.current_grouping = id;
        Ok(())
    }

    fn site_name(&self, id: i64) -> Result<Option<String>> {
        Ok(self.lock().sites.get(&id).cloned())
    }

    fn station(&self, sites_id: i64, id: i64) -> Result<Option<Station>> {
        Ok(self
            .lock()
            .stations
            .iter()
            .find(|s| s.sites_id == sites_id && s.id == id)
            .cloned())
    }

    fn station_by_id(&self, id: i64) -> Result<Option<Station>> {
        Ok(self.lock().stations.iter().find(|s| s.id == id).cloned())
    }

    fn station_name_exists(&self, sites_id: i64, name: &str) -> Result<bool> {
        Ok(self
            .lock()
            .stations
            .iter()
            .any(|s| s.sites_id == sites_id && s.name.eq_ignore_ascii_case(name)))
    }

    fn station_within(
        &self,
        sites_id: i64,
        northing: f64,
        easting: f64,
        tolerance: f64,
    ) -> Result<bool> {
        Ok(self.lock().stations.iter().any(|s| {
            s.sites_id == sites_id
                && (s.northing - northing).abs() <= tolerance
                && (s.easting - easting).abs() <= tolerance
        }))
    }

    fn insert_station(&self, station: &NewStation) -> Result<i64> {
        let mut inner = self.lock();
        if !inner.sites.contains_key(&station.sites_id) {
            return Err(SurveyError::Persistence(format!(
                "There is no site with id {}.",
                station.sites_id
            )));
        }
        let id = inner.next_id();
        inner.stations.push(Station {
            id,
            sites_id: station.sites_id,
            name: station.name.clone(),
            northing: station.northing,
            easting: station.easting,
            elevation: station.elevation,
            utmzone: station.utmzone.clone(),
            latitude: station.latitude,
            longitude: station.longitude,
            description: station.description.clone(),
        });
        Ok(id)
    }

    fn insert_session(&self, session: &NewSession) -> Result<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.sessions.push(SessionRecord {
            id,
            label: session.label.clone(),
            surveyor: session.surveyor.clone(),
            started: Utc::now(),
            ended: None,
            stations_id_occupied: session.stations_id_occupied,
            stations_id_backsight: session.stations_id_backsight,
            azimuth: session.azimuth.clone(),
            instrument_height: session.instrument_height,
            pressure_mmhg: session.pressure_mmhg,
            temperature_c: session.temperature_c,
        });
        Ok(id)
    }

    fn session(&self, id: i64) -> Result<Option<SessionRecord>> {
        Ok(self.lock().sessions.iter().find(|s| s.id == id).cloned())
    }

    fn end_session(&self, id: i64) -> Result<()> {
        let mut inner = self.lock();
        match inner.sessions.iter_mut().find(|s| s.id == id) {
            Some(session) => {
                session.ended = Some(Utc::now());
                Ok(())
            }
            None => Err(SurveyError::Persistence(format!(
                "Session {id} was not found."
            ))),
        }
    }

    fn insert_grouping(&self, grouping: &NewGrouping) -> Result<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.groupings.push(GroupingRecord {
            id,
            sessions_id: grouping.sessions_id,
            geometry: grouping.geometry,
            class: grouping.class.clone(),
            subclass: grouping.subclass.clone(),
            label: grouping.label.clone(),
            description: grouping.description.clone(),
        });
        Ok(id)
    }

    fn grouping(&self, id: i64) -> Result<Option<GroupingRecord>> {
        Ok(self.lock().groupings.iter().find(|g| g.id == id).cloned())
    }

    fn insert_shot(&self, shot: &NewShot) -> Result<i64> {
        let mut inner = self.lock();
        let id = inner.next_id();
        inner.shots.push(ShotRecord {
            id,
            groupings_id: shot.groupings_id,
            label: shot.label.clone(),
            delta: shot.delta,
            point: shot.point,
            prism: shot.prism,
            recorded: shot.recorded,
        });
        Ok(id)
    }

    fn shot(&self, id: i64) -> Result<Option<ShotRecord>> {
        Ok(self.lock().shots.iter().find(|s| s.id == id).cloned())
    }
}
