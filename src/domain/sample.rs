//! Location samples and the telemetry wire payload

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// One reading from a location source (WGS84 degrees)
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationSample {
    pub lat: f64,
    pub lon: f64,
    /// Meters
    pub elevation: Option<f64>,
    /// Meters per second
    pub speed: Option<f64>,
    /// Free-text label, e.g. "walking"
    pub activity: Option<String>,
    /// Defaults to publish time when absent
    pub timestamp: Option<DateTime<Utc>>,
}

impl LocationSample {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon, ..Default::default() }
    }

    pub fn with_elevation(mut self, elevation: f64) -> Self {
        self.elevation = Some(elevation);
        self
    }

    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = Some(speed);
        self
    }

    pub fn with_activity(mut self, activity: &str) -> Self {
        self.activity = Some(activity.to_string());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// lat/lon are required and must be finite
    #[inline]
    pub fn has_valid_position(&self) -> bool {
        self.lat.is_finite() && self.lon.is_finite()
    }
}

/// JSON payload published per point
///
/// Optional fields serialize as `null`, never omitted: the key set is
/// fixed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPayload {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub speed: Option<f64>,
    pub activity: Option<String>,
    pub timestamp: String,
}

impl TelemetryPayload {
    /// Build from a sample, normalising optional fields
    ///
    /// `now` is used when the sample carries no timestamp.
    pub fn from_sample(sample: &LocationSample, now: DateTime<Utc>) -> Self {
        Self {
            lat: sample.lat,
            lon: sample.lon,
            elevation: finite(sample.elevation),
            speed: finite(sample.speed),
            activity: sample.activity.clone().filter(|a| !a.is_empty()),
            timestamp: format_timestamp(sample.timestamp.unwrap_or(now)),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

/// RFC 3339 UTC with microsecond precision, e.g. `2026-03-01T08:00:00.123456Z`
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[inline]
fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}
