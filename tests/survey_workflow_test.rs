//! End-to-end workflow tests: engine + store + instrument wired together.
//!
//! Deterministic numbers come from a scripted instrument; the demo
//! simulator covers the cancellation path.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stakeout::config::Settings;
use stakeout::geodesy::Point;
use stakeout::instruments::demo::DemoTotalStation;
use stakeout::instruments::{MeasurementOutcome, RawMeasurement, TotalStation};
use stakeout::session::{Outcome, ResectionStart, SurveyEngine, SURVEY_STATION_SUBCLASS};
use stakeout::store::{GeometryKind, MemoryStore, NewStation, SurveyStore};
use stakeout::SurveyError;

/// Instrument double that replays measurement outcomes in order.
struct ScriptedStation {
    outcomes: Mutex<VecDeque<MeasurementOutcome>>,
}

impl ScriptedStation {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            outcomes: Mutex::new(VecDeque::new()),
        })
    }

    fn push_measurement(&self, delta_n: f64, delta_e: f64, delta_z: f64) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(MeasurementOutcome::Measured(RawMeasurement {
                delta_n,
                delta_e,
                delta_z,
            }));
    }

    fn push_canceled(&self) {
        self.outcomes
            .lock()
            .unwrap()
            .push_back(MeasurementOutcome::Canceled);
    }
}

#[async_trait::async_trait]
impl TotalStation for ScriptedStation {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn set_mode_hr(&self) -> stakeout::Result<()> {
        Ok(())
    }

    async fn set_azimuth(&self, _degrees: u32, _minutes: u32, _seconds: u32) -> stakeout::Result<()> {
        Ok(())
    }

    async fn take_measurement(&self) -> stakeout::Result<MeasurementOutcome> {
        self.outcomes.lock().unwrap().pop_front().ok_or_else(|| {
            SurveyError::Communication("A communication error occurred.".to_string())
        })
    }

    fn cancel_measurement(&self) {}
}

fn seeded_store() -> (Arc<MemoryStore>, i64, i64, i64) {
    let store = Arc::new(MemoryStore::new());
    let site = store.add_site("North Trench");
    let datum = store
        .insert_station(&NewStation {
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
    let benchmark = store
        .insert_station(&NewStation {
            sites_id: site,
            name: "BM-1".to_string(),
            northing: 1100.0,
            easting: 2000.0,
            elevation: 12.0,
            utmzone: None,
            latitude: None,
            longitude: None,
            description: None,
        })
        .unwrap();
    (store, site, datum, benchmark)
}

fn engine(
    instrument: Arc<dyn TotalStation>,
    store: Arc<MemoryStore>,
) -> SurveyEngine {
    let settings = Settings::new(None).unwrap();
    SurveyEngine::new(instrument, store, &settings).unwrap()
}

#[tokio::test]
async fn shots_compute_georeferenced_points() {
    let (store, site, datum, _) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    engine
        .start_with_azimuth("Day 1", "R. Chen", site, datum, 1.5, 45, 0, 0)
        .await
        .unwrap();
    engine
        .start_new_grouping(GeometryKind::PointCloud, "Topo", "Ground", "Surface", None)
        .unwrap();

    // Occupied (1000, 2000, 10), height 1.5 m, all offsets zero: a raw
    // delta of (10, 10, 0) lands at (1010, 2010, 11.5).
    station.push_measurement(10.0, 10.0, 0.0);
    let staged = match engine.take_shot().await.unwrap() {
        Outcome::Completed(staged) => staged,
        Outcome::Canceled => unreachable!("nothing canceled this shot"),
    };
    assert_eq!(staged.point, Point::new(1010.0, 2010.0, 11.5));

    let shot_id = engine.save_last_shot(Some("Surface 1")).unwrap();
    let shot = store.shot(shot_id).unwrap().unwrap();
    assert_eq!(shot.point, Point::new(1010.0, 2010.0, 11.5));
    assert_eq!(shot.label.as_deref(), Some("Surface 1"));
    assert_eq!(shot.prism, *engine.prism_offsets());
    // A point-cloud grouping stays open after a save.
    assert!(engine.grouping_id().is_some());
    // Saving again without a new staged shot is a state error.
    assert!(matches!(
        engine.save_last_shot(None).unwrap_err(),
        SurveyError::State(_)
    ));
}

#[tokio::test]
async fn canceled_shot_leaves_state_untouched() {
    let (store, site, datum, _) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store);

    engine
        .start_with_azimuth("Day 1", "R. Chen", site, datum, 1.5, 0, 0, 0)
        .await
        .unwrap();
    engine
        .start_new_grouping(GeometryKind::PointCloud, "Topo", "Ground", "Surface", None)
        .unwrap();

    station.push_measurement(10.0, 10.0, 0.0);
    let first = match engine.take_shot().await.unwrap() {
        Outcome::Completed(staged) => staged,
        Outcome::Canceled => unreachable!(),
    };

    station.push_canceled();
    assert_eq!(engine.take_shot().await.unwrap(), Outcome::Canceled);
    // The previously staged shot is still there, unchanged.
    assert_eq!(engine.staged_shot(), Some(&first));
}

#[tokio::test]
async fn demo_instrument_cancel_round_trip() {
    let (store, site, datum, _) = seeded_store();
    let instrument = Arc::new(DemoTotalStation::with_delay(Duration::from_secs(30)));
    let mut engine = engine(instrument, store);

    engine
        .start_with_azimuth("Day 1", "R. Chen", site, datum, 1.5, 0, 0, 0)
        .await
        .unwrap();
    engine
        .start_new_grouping(GeometryKind::PointCloud, "Topo", "Ground", "Surface", None)
        .unwrap();

    // Cancel from a second task while the measurement is in flight, via
    // the handle that does not need the engine lock.
    let handle = engine.instrument_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel_measurement();
    });
    let outcome = engine.take_shot().await.unwrap();
    assert_eq!(outcome, Outcome::Canceled);
    assert!(engine.staged_shot().is_none());
}

#[tokio::test]
async fn isolated_point_survey_station_shot_becomes_a_station() {
    let (store, site, datum, _) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    engine
        .start_with_azimuth("Day 1", "R. Chen", site, datum, 1.5, 0, 0, 0)
        .await
        .unwrap();
    engine
        .start_new_grouping(
            GeometryKind::IsolatedPoint,
            "Control",
            SURVEY_STATION_SUBCLASS,
            "New control point",
            None,
        )
        .unwrap();

    station.push_measurement(5.0, 5.0, 0.0);
    match engine.take_shot().await.unwrap() {
        Outcome::Completed(staged) => assert_eq!(staged.point, Point::new(1005.0, 2005.0, 11.5)),
        Outcome::Canceled => unreachable!(),
    }
    engine.save_last_shot(Some("SS-1")).unwrap();

    // Isolated point: the grouping ended itself.
    assert_eq!(engine.grouping_id(), None);
    // Survey Station subclass: the computed point is now a reusable station.
    assert!(store.station_name_exists(site, "SS-1").unwrap());
    assert!(store.station_within(site, 1005.0, 2005.0, 0.01).unwrap());
}

#[tokio::test]
async fn backsight_start_derives_instrument_height() {
    let (store, site, datum, benchmark) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    // Backsight is 100 m due north, 2 m above the occupied point. The
    // measured distance agrees to a centimeter; the vertical delta puts
    // the instrument 1.5 m above its station.
    station.push_measurement(100.01, 0.0, 4.8);
    let session_id = match engine
        .start_with_backsight("Day 2", "R. Chen", site, datum, benchmark, 1.3)
        .await
        .unwrap()
    {
        Outcome::Completed(id) => id,
        Outcome::Canceled => unreachable!(),
    };

    let record = store.session(session_id).unwrap().unwrap();
    assert_eq!(record.azimuth, "0° 0' 0\"");
    assert_eq!(record.stations_id_backsight, Some(benchmark));
    // ih = (10 - 12) + (4.8 - 1.3) = 1.5
    assert_eq!(record.instrument_height, 1.5);
    assert_eq!(engine.instrument_height(), 1.5);
    // The prism height was folded into the vertical offset.
    assert_eq!(engine.prism_offsets().vertical_distance, -1.3);
}

#[tokio::test]
async fn backsight_variance_over_limit_aborts_without_persisting() {
    let (store, site, datum, benchmark) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    // Half a meter short of the expected 100 m: 50 cm variance against a
    // 3 cm limit.
    station.push_measurement(99.5, 0.0, 4.8);
    let err = engine
        .start_with_backsight("Day 2", "R. Chen", site, datum, benchmark, 1.3)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("exceeds the limit"));
    assert_eq!(engine.session_id(), None);
    assert_eq!(store.saved_state().unwrap().current_session, None);
}

#[tokio::test]
async fn resection_establishes_the_occupied_station() {
    let (store, site, _, _) = seeded_store();
    let left_id = store
        .insert_station(&NewStation {
            sites_id: site,
            name: "West Anchor".to_string(),
            northing: 1000.0,
            easting: 1000.0,
            elevation: 20.0,
            utmzone: None,
            latitude: None,
            longitude: None,
            description: None,
        })
        .unwrap();
    let right_id = store
        .insert_station(&NewStation {
            sites_id: site,
            name: "East Anchor".to_string(),
            northing: 1000.0,
            easting: 1100.0,
            elevation: 22.0,
            utmzone: None,
            latitude: None,
            longitude: None,
            description: None,
        })
        .unwrap();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    let start = ResectionStart {
        label: "Day 3".to_string(),
        surveyor: "R. Chen".to_string(),
        sites_id: site,
        station_name: "R-1".to_string(),
        left_station_id: left_id,
        right_station_id: right_id,
        instrument_height: 1.5,
        prism_height: 1.3,
    };

    // True occupied point: (900, 1050, 100), south of the baseline.
    // delta_z = station_z - occupied_z - ih + ph for each sighting.
    station.push_measurement(100.0, -50.0, -80.2);
    assert_eq!(
        engine.start_resection(&start).await.unwrap(),
        Outcome::Completed(())
    );

    // A canceled second sighting keeps the cached first shot.
    station.push_canceled();
    assert_eq!(engine.complete_resection().await.unwrap(), Outcome::Canceled);

    station.push_measurement(100.0, 50.0, -78.2);
    let session_id = match engine.complete_resection().await.unwrap() {
        Outcome::Completed(id) => id,
        Outcome::Canceled => unreachable!(),
    };

    assert_eq!(engine.session_id(), Some(session_id));
    assert_eq!(engine.occupied_point(), Some(Point::new(900.0, 1050.0, 100.0)));
    assert!(store.station_name_exists(site, "R-1").unwrap());
    let record = store.session(session_id).unwrap().unwrap();
    assert_eq!(record.stations_id_backsight, Some(right_id));
}

#[tokio::test]
async fn resection_elevation_disagreement_aborts() {
    let (store, site, datum, benchmark) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    let start = ResectionStart {
        label: "Day 3".to_string(),
        surveyor: "R. Chen".to_string(),
        sites_id: site,
        station_name: "R-2".to_string(),
        left_station_id: datum,
        right_station_id: benchmark,
        instrument_height: 1.5,
        prism_height: 1.3,
    };

    station.push_measurement(50.0, 0.0, -10.0);
    engine.start_resection(&start).await.unwrap();
    // Elevation estimate differs by a meter between the sightings.
    station.push_measurement(50.0, 0.0, -7.0);
    let err = engine.complete_resection().await.unwrap_err();
    assert!(err.to_string().contains("elevation differs"));
    // The inconsistent pair was discarded: the flow must restart.
    assert!(matches!(
        engine.complete_resection().await.unwrap_err(),
        SurveyError::State(_)
    ));
    assert_eq!(engine.session_id(), None);
}

#[tokio::test]
async fn abort_resection_discards_the_cached_shot() {
    let (store, site, datum, benchmark) = seeded_store();
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store);

    let start = ResectionStart {
        label: "Day 3".to_string(),
        surveyor: "R. Chen".to_string(),
        sites_id: site,
        station_name: "R-3".to_string(),
        left_station_id: datum,
        right_station_id: benchmark,
        instrument_height: 1.5,
        prism_height: 1.3,
    };
    station.push_measurement(50.0, 0.0, -10.0);
    engine.start_resection(&start).await.unwrap();
    engine.abort_resection();
    assert!(matches!(
        engine.complete_resection().await.unwrap_err(),
        SurveyError::State(_)
    ));
}

#[tokio::test]
async fn hardware_failure_surfaces_without_staging_anything() {
    let (store, site, datum, _) = seeded_store();
    // Empty script: the first measurement request fails like a dead wire.
    let station = ScriptedStation::new();
    let mut engine = engine(station.clone(), store.clone());

    engine
        .start_with_azimuth("Day 1", "R. Chen", site, datum, 1.5, 0, 0, 0)
        .await
        .unwrap();
    engine
        .start_new_grouping(GeometryKind::PointCloud, "Topo", "Ground", "Surface", None)
        .unwrap();
    let err = engine.take_shot().await.unwrap_err();
    assert!(matches!(err, SurveyError::Communication(_)));
    assert!(engine.staged_shot().is_none());
}
