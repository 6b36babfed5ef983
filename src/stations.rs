//! Station creation and validation.
//!
//! A station can be entered in any of three coordinate systems; the missing
//! representation is computed on save, and uniqueness (name, and 0.1 m
//! coordinate proximity) is enforced within the site.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SurveyError};
use crate::geodesy;
use crate::store::{NewStation, SurveyStore};

/// Coordinates for a new station, in one of the supported input systems.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum CoordinateInput {
    /// Arbitrary site grid: northing/easting/elevation in meters.
    Site {
        northing: f64,
        easting: f64,
        elevation: f64,
    },
    /// UTM grid coordinates plus a zone such as `"31T"`.
    Utm {
        northing: f64,
        easting: f64,
        elevation: f64,
        utmzone: String,
    },
    /// Geographic coordinates in decimal degrees.
    LatLon {
        latitude: f64,
        longitude: f64,
        elevation: f64,
    },
}

/// Validates the coordinates, converts the missing representation, checks
/// uniqueness within the site, and saves the station. Returns the new
/// station's id.
pub fn save_station(
    store: &dyn SurveyStore,
    sites_id: i64,
    name: &str,
    coordinates: &CoordinateInput,
    description: Option<&str>,
) -> Result<i64> {
    let resolved = resolve_coordinates(coordinates)?;

    let sitename = store
        .site_name(sites_id)?
        .ok_or_else(|| SurveyError::validation(format!("There is no site with id {sites_id}.")))?;
    let name = name.trim();
    let mut problems = Vec::new();
    if name.is_empty() {
        problems.push("No station name was given.".to_string());
    }
    if store.station_name_exists(sites_id, name)? {
        problems.push(format!(
            "The station name “{name}” is not unique at site “{sitename}.”"
        ));
    }
    if store.station_within(sites_id, resolved.northing, resolved.easting, 0.1)? {
        problems.push(format!(
            "The station coordinates are not unique at site “{sitename}.”"
        ));
    }
    if !problems.is_empty() {
        return Err(SurveyError::Validation(problems));
    }

    store.insert_station(&NewStation {
        sites_id,
        name: name.to_string(),
        northing: resolved.northing,
        easting: resolved.easting,
        elevation: resolved.elevation,
        utmzone: resolved.utmzone,
        latitude: resolved.latitude,
        longitude: resolved.longitude,
        description: description
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
    })
}

struct ResolvedCoordinates {
    northing: f64,
    easting: f64,
    elevation: f64,
    utmzone: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
}

fn resolve_coordinates(coordinates: &CoordinateInput) -> Result<ResolvedCoordinates> {
    let mut problems = Vec::new();
    let elevation = match coordinates {
        CoordinateInput::Site { elevation, .. }
        | CoordinateInput::Utm { elevation, .. }
        | CoordinateInput::LatLon { elevation, .. } => *elevation,
    };
    if !elevation.is_finite() {
        problems.push(format!("Non-numeric elevation given ({elevation})."));
    }

    match coordinates {
        CoordinateInput::Site {
            northing, easting, ..
        } => {
            if !northing.is_finite() {
                problems.push(format!("Non-numeric northing given ({northing})."));
            }
            if !easting.is_finite() {
                problems.push(format!("Non-numeric easting given ({easting})."));
            }
            if !problems.is_empty() {
                return Err(SurveyError::Validation(problems));
            }
            // Latitude, longitude, and UTM zone are neither needed nor
            // derivable for a local site grid.
            Ok(ResolvedCoordinates {
                northing: *northing,
                easting: *easting,
                elevation,
                utmzone: None,
                latitude: None,
                longitude: None,
            })
        }
        CoordinateInput::Utm {
            northing,
            easting,
            utmzone,
            ..
        } => {
            let zone = match parse_utm_zone(utmzone) {
                Ok(zone) => Some(zone),
                Err(err) => {
                    problems.extend(err.problems());
                    None
                }
            };
            let Some((zone_number, zone_letter)) = zone else {
                return Err(SurveyError::Validation(problems));
            };
            match geodesy::utm_to_latlon(*northing, *easting, zone_number, zone_letter) {
                Ok((latitude, longitude)) => {
                    if problems.is_empty() {
                        Ok(ResolvedCoordinates {
                            northing: *northing,
                            easting: *easting,
                            elevation,
                            utmzone: Some(utmzone.to_uppercase()),
                            latitude: Some(latitude),
                            longitude: Some(longitude),
                        })
                    } else {
                        Err(SurveyError::Validation(problems))
                    }
                }
                Err(err) => {
                    problems.extend(err.problems());
                    Err(SurveyError::Validation(problems))
                }
            }
        }
        CoordinateInput::LatLon {
            latitude,
            longitude,
            ..
        } => {
            if !(0.0..=90.0).contains(latitude) {
                problems.push("Latitude given is out of range (0–90°).".to_string());
            }
            if !(-180.0..=180.0).contains(longitude) {
                problems.push("Longitude given is out of range (±180°).".to_string());
            }
            if !problems.is_empty() {
                return Err(SurveyError::Validation(problems));
            }
            let (northing, easting, utmzone) = geodesy::latlon_to_utm(*latitude, *longitude)?;
            Ok(ResolvedCoordinates {
                northing,
                easting,
                elevation,
                utmzone: Some(utmzone),
                latitude: Some(*latitude),
                longitude: Some(*longitude),
            })
        }
    }
}

/// Splits a zone designator such as `"31T"` into number and band letter.
fn parse_utm_zone(utmzone: &str) -> Result<(u8, char)> {
    let utmzone = utmzone.trim().to_uppercase();
    if utmzone.is_empty() {
        return Err(SurveyError::validation("UTM Zone not given."));
    }
    let (number_part, letter_part) = utmzone.split_at(utmzone.len() - 1);
    let zone_number: u8 = number_part.parse().map_err(|_| {
        SurveyError::validation(format!("Non-numeric UTM Zone number given ({utmzone})."))
    })?;
    let zone_letter = letter_part.chars().next().unwrap_or_default();
    Ok((zone_number, zone_letter))
}

/// Sanity check on the instrument height above the occupied point.
/// Returns problem descriptions rather than an error so callers can fold
/// them into a larger validation pass.
pub(crate) fn validate_instrument_height(height: f64) -> Vec<String> {
    let mut problems = Vec::new();
    if !height.is_finite() {
        problems.push(format!("Instrument height entered ({height}m) is not numeric."));
    } else if height < 0.0 {
        problems.push(format!("Instrument height entered ({height}m) is negative."));
    } else if height >= 2.0 {
        problems.push(format!(
            "Instrument height entered ({height}m) is unrealistically high."
        ));
    }
    problems
}
