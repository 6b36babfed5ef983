//! Geodetic calculations and conversions for surveying data.
//!
//! Everything in this module is pure arithmetic on coordinates: azimuths,
//! backsight variance, two-circle resection, prism-offset geometry, the
//! atmospheric refraction correction, and the WGS84 transverse-Mercator
//! UTM ↔ latitude/longitude conversion. No I/O, no shared state.
//!
//! Coordinates are grid northing/easting/elevation in meters. Angles are
//! decimal degrees measured clockwise from grid north unless a function
//! says otherwise. Meter outputs are rounded to the nearest millimeter.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SurveyError};

/// A georeferenced point: northing/easting/elevation in meters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub n: f64,
    pub e: f64,
    pub z: f64,
}

impl Point {
    pub fn new(n: f64, e: f64, z: f64) -> Self {
        Point { n, e, z }
    }
}

/// Rounds a meter value to the nearest millimeter.
pub fn round_mm(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Returns the azimuth in decimal degrees from point `a` to point `b`,
/// normalized into [0, 360).
pub fn azimuth(a: Point, b: Point) -> f64 {
    let delta_n = b.n - a.n;
    let delta_e = b.e - a.e;
    let bearing = delta_e.atan2(delta_n).to_degrees();
    if bearing < 0.0 {
        bearing + 360.0
    } else {
        bearing
    }
}

/// An angle decomposed into whole degrees, minutes, and seconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dms {
    pub degrees: u32,
    pub minutes: u32,
    pub seconds: u32,
}

impl fmt::Display for Dms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}° {}' {}\"", self.degrees, self.minutes, self.seconds)
    }
}

/// Decomposes a decimal azimuth into degrees/minutes/seconds.
///
/// Rounding of the seconds is carried upward (59′ 60″ becomes the next
/// whole degree) so the result always satisfies the instrument's angle
/// range checks.
pub fn to_dms(azimuth: f64) -> Dms {
    let azimuth = azimuth.rem_euclid(360.0);
    let mut degrees = azimuth.trunc() as u32;
    let mut minutes = ((azimuth - degrees as f64) * 60.0).trunc() as u32;
    let mut seconds = (((azimuth - degrees as f64) * 60.0 - minutes as f64) * 60.0).round() as u32;
    if seconds == 60 {
        seconds = 0;
        minutes += 1;
    }
    if minutes == 60 {
        minutes = 0;
        degrees += 1;
    }
    if degrees == 360 {
        degrees = 0;
    }
    Dms {
        degrees,
        minutes,
        seconds,
    }
}

/// Calculates the variance in centimeters between the expected backsight
/// distance (occupied station to backsight station) and the horizontal
/// distance actually measured by the instrument.
pub fn backsight_variance(occupied: Point, backsight: Point, delta_n: f64, delta_e: f64) -> f64 {
    let expected = (occupied.n - backsight.n).hypot(occupied.e - backsight.e);
    let measured = delta_n.hypot(delta_e);
    ((expected - measured).abs() * 100.0 * 10.0).round() / 10.0
}

/// Calculates the northing and easting of an unknown occupied point from
/// measured distances to two known stations, by intersecting the two
/// circles centered on those stations.
///
/// Calling contract: `left` must be the left-hand backsight and `right`
/// the right-hand backsight *as seen from the occupied point*. The caller
/// supplies that ordering; it is not detected here, and swapping the two
/// returns the mirror-image solution on the far side of the baseline.
/// `r_left` and `r_right` are the measured horizontal distances to the
/// respective stations.
///
/// When the three points are nearly colinear the perpendicular leg's
/// radicand can go non-positive from measurement noise; its absolute value
/// is used rather than failing, collapsing the solution onto the baseline.
pub fn resection(left: Point, right: Point, r_left: f64, r_right: f64) -> (f64, f64) {
    // Intersection of two circles, after the construction at
    // http://paulbourke.net/geometry/circlesphere/
    let d = (right.n - left.n).hypot(right.e - left.e);
    // Length of the baseline segment from `left` to the foot of the
    // perpendicular dropped from the occupied point.
    let a = (r_left.powi(2) - r_right.powi(2) + d.powi(2)) / (2.0 * d);
    let h = (r_left.powi(2) - a.powi(2)).abs().sqrt();
    // The foot of that perpendicular.
    let foot_n = left.n + a * (right.n - left.n) / d;
    let foot_e = left.e + a * (right.e - left.e) / d;
    let occupied_n = round_mm(foot_n - h * (right.e - left.e) / d);
    let occupied_e = round_mm(foot_e + h * (right.n - left.n) / d);
    (occupied_n, occupied_e)
}

/// Applies the atmospheric refraction correction to raw instrument deltas,
/// given air pressure in mmHg and air temperature in °C.
///
/// The instrument is assumed to be set to 0 ppm (760 mmHg at 15 °C).
pub fn atmospheric_correction(
    delta_n: f64,
    delta_e: f64,
    delta_z: f64,
    pressure_mmhg: f64,
    temperature_c: f64,
) -> (f64, f64, f64) {
    let p = pressure_mmhg * 106.036;
    let t = temperature_c + 273.15;
    let ka = (279.66 - (p / t)) * 1e-6;
    (
        round_mm(delta_n * (1.0 + ka)),
        round_mm(delta_e * (1.0 + ka)),
        round_mm(delta_z * (1.0 + ka)),
    )
}

/// Northing/easting change due to a toward/away radial prism offset.
///
/// The offset slides the point along the sight line; positive is away from
/// the instrument.
pub fn radial_offset(delta_n: f64, delta_e: f64, offset: f64) -> (f64, f64) {
    if offset == 0.0 {
        return (0.0, 0.0);
    }
    let horizontal_distance = delta_n.hypot(delta_e);
    if horizontal_distance == 0.0 {
        // A plumb shot has no horizontal direction to slide along.
        return (0.0, 0.0);
    }
    let proportion = offset / horizontal_distance;
    (delta_n * proportion, delta_e * proportion)
}

/// Northing/easting change due to a left/right prism offset tangent to the
/// circle's radius at the prism.
///
/// The law of cosines on the triangle (distance to prism, distance to
/// point, offset) gives the rotation angle; the point lies at the longer
/// hypotenuse distance along the rotated azimuth. The change is returned
/// relative to the raw delta so it composes with the other offsets.
pub fn tangent_offset(delta_n: f64, delta_e: f64, offset: f64) -> (f64, f64) {
    if offset == 0.0 {
        return (0.0, 0.0);
    }
    let distance_to_prism = delta_n.hypot(delta_e);
    if distance_to_prism == 0.0 {
        return (0.0, 0.0);
    }
    let distance_to_point = distance_to_prism.hypot(offset);
    let mut offset_angle = ((distance_to_prism.powi(2) + distance_to_point.powi(2)
        - offset.powi(2))
        / (2.0 * distance_to_prism * distance_to_point))
        .acos()
        .to_degrees();
    if offset < 0.0 {
        offset_angle = -offset_angle;
    }
    let azimuth_to_prism = azimuth(Point::default(), Point::new(delta_n, delta_e, 0.0));
    let azimuth_to_point = normalize_azimuth(azimuth_to_prism + offset_angle);
    let n_diff = distance_to_point * azimuth_to_point.to_radians().cos() - delta_n;
    let e_diff = distance_to_point * azimuth_to_point.to_radians().sin() - delta_e;
    (n_diff, e_diff)
}

/// Northing/easting change due to a clockwise/counter-clockwise wedge
/// prism offset on the circle's radius.
///
/// Same construction as [`tangent_offset`], but the point stays at the
/// prism's range: it revolves about the instrument instead of moving off
/// the arc.
pub fn wedge_offset(delta_n: f64, delta_e: f64, offset: f64) -> (f64, f64) {
    if offset == 0.0 {
        return (0.0, 0.0);
    }
    let distance_to_prism = delta_n.hypot(delta_e);
    if distance_to_prism == 0.0 {
        return (0.0, 0.0);
    }
    let mut offset_angle = (((2.0 * distance_to_prism.powi(2)) - offset.powi(2))
        / (2.0 * distance_to_prism.powi(2)))
    .acos()
    .to_degrees();
    if offset < 0.0 {
        offset_angle = -offset_angle;
    }
    let azimuth_to_prism = azimuth(Point::default(), Point::new(delta_n, delta_e, 0.0));
    let azimuth_to_point = normalize_azimuth(azimuth_to_prism + offset_angle);
    let n_diff = distance_to_prism * azimuth_to_point.to_radians().cos() - delta_n;
    let e_diff = distance_to_prism * azimuth_to_point.to_radians().sin() - delta_e;
    (n_diff, e_diff)
}

/// Corrects an azimuth that an offset rotation moved across due north.
fn normalize_azimuth(azimuth: f64) -> f64 {
    if azimuth < 0.0 {
        azimuth + 360.0
    } else if azimuth >= 360.0 {
        azimuth - 360.0
    } else {
        azimuth
    }
}

// ---------------------------------------------------------------------------
// UTM <-> latitude/longitude (WGS84 transverse Mercator)
// ---------------------------------------------------------------------------

const K0: f64 = 0.9996;
/// WGS84 equatorial radius in meters.
const EQUATORIAL_RADIUS: f64 = 6_378_137.0;
/// WGS84 first eccentricity squared.
const E: f64 = 0.006_694_38;

const ZONE_LETTERS: &[u8] = b"CDEFGHJKLMNPQRSTUVWX";

/// Converts latitude/longitude coordinates (decimal degrees) to UTM.
///
/// Returns `(northing, easting, zone)` with the meter values rounded to
/// millimeters and the zone formatted as number plus latitude-band letter
/// (e.g. `"31T"`).
pub fn latlon_to_utm(latitude: f64, longitude: f64) -> Result<(f64, f64, String)> {
    if !(-80.0..=84.0).contains(&latitude) {
        return Err(SurveyError::validation(format!(
            "Latitude given ({latitude}) is outside the UTM grid (80°S to 84°N)."
        )));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(SurveyError::validation(format!(
            "Longitude given ({longitude}) is out of range (±180°)."
        )));
    }

    let zone_number = zone_number_for(latitude, longitude);
    let zone_letter = zone_letter_for(latitude);

    let lat_rad = latitude.to_radians();
    let lat_sin = lat_rad.sin();
    let lat_cos = lat_rad.cos();
    let lat_tan2 = (lat_sin / lat_cos).powi(2);
    let lat_tan4 = lat_tan2 * lat_tan2;

    let e_p2 = E / (1.0 - E);
    let n = EQUATORIAL_RADIUS / (1.0 - E * lat_sin.powi(2)).sqrt();
    let c = e_p2 * lat_cos.powi(2);

    let central = central_longitude(zone_number).to_radians();
    let a = lat_cos * wrap_angle(longitude.to_radians() - central);
    let a2 = a * a;
    let a3 = a2 * a;
    let a4 = a3 * a;
    let a5 = a4 * a;
    let a6 = a5 * a;

    let m = EQUATORIAL_RADIUS * meridian_arc(lat_rad);

    let easting = K0
        * n
        * (a + a3 / 6.0 * (1.0 - lat_tan2 + c)
            + a5 / 120.0 * (5.0 - 18.0 * lat_tan2 + lat_tan4 + 72.0 * c - 58.0 * e_p2))
        + 500_000.0;
    let mut northing = K0
        * (m + n
            * (lat_sin / lat_cos)
            * (a2 / 2.0
                + a4 / 24.0 * (5.0 - lat_tan2 + 9.0 * c + 4.0 * c.powi(2))
                + a6 / 720.0
                    * (61.0 - 58.0 * lat_tan2 + lat_tan4 + 600.0 * c - 330.0 * e_p2)));
    if latitude < 0.0 {
        northing += 10_000_000.0;
    }

    Ok((
        round_mm(northing),
        round_mm(easting),
        format!("{zone_number}{zone_letter}"),
    ))
}

/// Converts UTM coordinates to latitude/longitude in decimal degrees.
pub fn utm_to_latlon(
    northing: f64,
    easting: f64,
    zone_number: u8,
    zone_letter: char,
) -> Result<(f64, f64)> {
    let mut problems = Vec::new();
    if !(100_000.0..=999_999.0).contains(&easting) {
        problems.push(format!(
            "Easting given ({easting}) is out of range (100000–999999m)."
        ));
    }
    if !(0.0..=10_000_000.0).contains(&northing) {
        problems.push(format!(
            "Northing given ({northing}) is out of range (0–10000000m)."
        ));
    }
    if !(1..=60).contains(&zone_number) {
        problems.push(format!("Invalid UTM Zone number given ({zone_number})."));
    }
    let zone_letter = zone_letter.to_ascii_uppercase();
    if !ZONE_LETTERS.contains(&(zone_letter as u8)) {
        problems.push(format!("Invalid UTM Zone letter given ({zone_letter})."));
    }
    if !problems.is_empty() {
        return Err(SurveyError::Validation(problems));
    }

    let northern = zone_letter >= 'N';
    let x = easting - 500_000.0;
    let y = if northern {
        northing
    } else {
        northing - 10_000_000.0
    };

    let e_p2 = E / (1.0 - E);
    let m1 = 1.0 - E / 4.0 - 3.0 * E.powi(2) / 64.0 - 5.0 * E.powi(3) / 256.0;
    let mu = y / K0 / (EQUATORIAL_RADIUS * m1);

    // Footprint latitude from the rectifying series.
    let sqrt_one_minus_e = (1.0 - E).sqrt();
    let e1 = (1.0 - sqrt_one_minus_e) / (1.0 + sqrt_one_minus_e);
    let p2 = 3.0 / 2.0 * e1 - 27.0 / 32.0 * e1.powi(3) + 269.0 / 512.0 * e1.powi(5);
    let p3 = 21.0 / 16.0 * e1.powi(2) - 55.0 / 32.0 * e1.powi(4);
    let p4 = 151.0 / 96.0 * e1.powi(3) - 417.0 / 128.0 * e1.powi(5);
    let p5 = 1097.0 / 512.0 * e1.powi(4);
    let p_rad = mu
        + p2 * (2.0 * mu).sin()
        + p3 * (4.0 * mu).sin()
        + p4 * (6.0 * mu).sin()
        + p5 * (8.0 * mu).sin();

    let p_sin = p_rad.sin();
    let p_cos = p_rad.cos();
    let p_tan = p_sin / p_cos;
    let t = p_tan.powi(2);
    let t2 = t * t;

    let ep_sin = 1.0 - E * p_sin.powi(2);
    let n1 = EQUATORIAL_RADIUS / ep_sin.sqrt();
    let r1 = EQUATORIAL_RADIUS * (1.0 - E) / ep_sin.powf(1.5);
    let c = e_p2 * p_cos.powi(2);
    let c2 = c * c;

    let d = x / (n1 * K0);
    let d2 = d * d;
    let d3 = d2 * d;
    let d4 = d3 * d;
    let d5 = d4 * d;
    let d6 = d5 * d;

    let latitude = p_rad
        - (n1 * p_tan / r1)
            * (d2 / 2.0 - d4 / 24.0 * (5.0 + 3.0 * t + 10.0 * c - 4.0 * c2 - 9.0 * e_p2)
                + d6 / 720.0
                    * (61.0 + 90.0 * t + 298.0 * c + 45.0 * t2 - 252.0 * e_p2 - 3.0 * c2));
    let longitude = (d - d3 / 6.0 * (1.0 + 2.0 * t + c)
        + d5 / 120.0 * (5.0 - 2.0 * c + 28.0 * t - 3.0 * c2 + 8.0 * e_p2 + 24.0 * t2))
        / p_cos;

    Ok((
        latitude.to_degrees(),
        longitude.to_degrees() + central_longitude(zone_number),
    ))
}

/// Meridian arc length from the equator, in units of the equatorial radius.
fn meridian_arc(lat_rad: f64) -> f64 {
    let m1 = 1.0 - E / 4.0 - 3.0 * E.powi(2) / 64.0 - 5.0 * E.powi(3) / 256.0;
    let m2 = 3.0 * E / 8.0 + 3.0 * E.powi(2) / 32.0 + 45.0 * E.powi(3) / 1024.0;
    let m3 = 15.0 * E.powi(2) / 256.0 + 45.0 * E.powi(3) / 1024.0;
    let m4 = 35.0 * E.powi(3) / 3072.0;
    m1 * lat_rad - m2 * (2.0 * lat_rad).sin() + m3 * (4.0 * lat_rad).sin()
        - m4 * (6.0 * lat_rad).sin()
}

fn central_longitude(zone_number: u8) -> f64 {
    (zone_number as f64 - 1.0) * 6.0 - 180.0 + 3.0
}

/// Wraps an angle in radians into (-π, π].
fn wrap_angle(value: f64) -> f64 {
    (value + std::f64::consts::PI).rem_euclid(2.0 * std::f64::consts::PI) - std::f64::consts::PI
}

fn zone_number_for(latitude: f64, longitude: f64) -> u8 {
    // Norway and Svalbard carve exceptions out of the regular 6° grid.
    if (56.0..64.0).contains(&latitude) && (3.0..12.0).contains(&longitude) {
        return 32;
    }
    if (72.0..=84.0).contains(&latitude) && longitude >= 0.0 {
        if longitude < 9.0 {
            return 31;
        } else if longitude < 21.0 {
            return 33;
        } else if longitude < 33.0 {
            return 35;
        } else if longitude < 42.0 {
            return 37;
        }
    }
    (((longitude + 180.0) / 6.0) as i64 % 60 + 1) as u8
}

fn zone_letter_for(latitude: f64) -> char {
    let index = (((latitude + 80.0) / 8.0) as usize).min(ZONE_LETTERS.len() - 1);
    ZONE_LETTERS[index] as char
}
