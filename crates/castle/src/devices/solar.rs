//! Simulated sun sensor
//!
//! Sun position after the NOAA solar calculator, without refraction
//! correction. Good to a fraction of a degree, which is plenty for
//! daylight rules.

use std::collections::HashMap;

use castle_types::{DatapointState, DeviceStatus};
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Elevation below which it is night (upper limb at the horizon)
const HORIZON: f64 = -0.833;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolarSettings {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunPosition {
    /// Degrees above the horizon
    pub elevation: f64,
    /// Degrees clockwise from north
    pub azimuth: f64,
}

impl SunPosition {
    pub fn is_daylight(&self) -> bool {
        self.elevation > HORIZON
    }
}

pub fn sun_position(at: DateTime<Utc>, latitude: f64, longitude: f64) -> SunPosition {
    let julian_day = at.timestamp_millis() as f64 / 86_400_000.0 + 2_440_587.5;
    let t = (julian_day - 2_451_545.0) / 36_525.0;

    let mean_long = (280.46646 + t * (36_000.76983 + t * 0.000_303_2)).rem_euclid(360.0);
    let mean_anomaly = 357.52911 + t * (35_999.05029 - 0.000_153_7 * t);
    let eccentricity = 0.016_708_634 - t * (0.000_042_037 + 0.000_000_126_7 * t);

    let m = mean_anomaly.to_radians();
    let center = m.sin() * (1.914_602 - t * (0.004_817 + 0.000_014 * t))
        + (2.0 * m).sin() * (0.019_993 - 0.000_101 * t)
        + (3.0 * m).sin() * 0.000_289;
    let omega = (125.04 - 1_934.136 * t).to_radians();
    let apparent_long = (mean_long + center - 0.005_69 - 0.004_78 * omega.sin()).to_radians();

    let mean_obliquity =
        23.0 + (26.0 + (21.448 - t * (46.815 + t * (0.000_59 - t * 0.001_813))) / 60.0) / 60.0;
    let obliquity = (mean_obliquity + 0.002_56 * omega.cos()).to_radians();
    let declination = (obliquity.sin() * apparent_long.sin()).asin();

    let y = (obliquity / 2.0).tan().powi(2);
    let l0 = mean_long.to_radians();
    let equation_of_time = 4.0
        * (y * (2.0 * l0).sin() - 2.0 * eccentricity * m.sin()
            + 4.0 * eccentricity * y * m.sin() * (2.0 * l0).cos()
            - 0.5 * y * y * (4.0 * l0).sin()
            - 1.25 * eccentricity * eccentricity * (2.0 * m).sin())
        .to_degrees();

    let minutes = at.hour() as f64 * 60.0 + at.minute() as f64 + at.second() as f64 / 60.0;
    let solar_time = (minutes + equation_of_time + 4.0 * longitude).rem_euclid(1440.0);
    let mut hour_angle = solar_time / 4.0 - 180.0;
    if hour_angle < -180.0 {
        hour_angle += 360.0;
    }

    let lat = latitude.to_radians();
    let ha = hour_angle.to_radians();
    let cos_zenith = (lat.sin() * declination.sin() + lat.cos() * declination.cos() * ha.cos())
        .clamp(-1.0, 1.0);
    let zenith = cos_zenith.acos();

    let denominator = lat.cos() * zenith.sin();
    let azimuth = if denominator.abs() < 1e-9 {
        if latitude > 0.0 { 180.0 } else { 0.0 }
    } else {
        let cos_az = ((lat.sin() * zenith.cos() - declination.sin()) / denominator).clamp(-1.0, 1.0);
        let az = cos_az.acos().to_degrees();
        if hour_angle > 0.0 {
            (az + 180.0).rem_euclid(360.0)
        } else {
            (540.0 - az).rem_euclid(360.0)
        }
    };

    SunPosition {
        elevation: 90.0 - zenith.to_degrees(),
        azimuth,
    }
}

pub struct SolarDevice {
    settings: SolarSettings,
}

impl SolarDevice {
    pub fn new(settings: SolarSettings) -> Self {
        Self { settings }
    }

    pub async fn fetch(&self) -> DeviceStatus {
        let now = Utc::now();
        let at = now.timestamp_millis();
        let sun = sun_position(now, self.settings.latitude, self.settings.longitude);
        DeviceStatus::responsive(HashMap::from([
            (
                "elevation".to_string(),
                DatapointState::number("elevation", at, sun.elevation),
            ),
            (
                "azimuth".to_string(),
                DatapointState::number("azimuth", at, sun.azimuth),
            ),
            (
                "daylight".to_string(),
                DatapointState::boolean("daylight", at, sun.is_daylight()),
            ),
        ]))
    }
}
