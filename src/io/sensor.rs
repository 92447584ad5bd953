//! Location sources
//!
//! `SimulatedSensor` walks a slow straight line through central Stockholm.
//! Replace it with a real GNSS/IMU feed by implementing [`SensorSource`].

use crate::domain::sample::LocationSample;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// Producer of location samples
#[async_trait]
pub trait SensorSource: Send {
    /// Wait for the next sample; `None` when the source is exhausted
    async fn next_sample(&mut self) -> Option<LocationSample>;
}

/// Per-tick drift in degrees
const LAT_STEP: f64 = 0.00005;
const LON_STEP: f64 = 0.00007;

/// Fake sensor emitting one sample per interval
pub struct SimulatedSensor {
    ticker: Interval,
    lat: f64,
    lon: f64,
    elevation: f64,
    speed: f64,
    activity: String,
    /// Stop after this many samples (`None` runs forever)
    remaining: Option<u64>,
}

impl SimulatedSensor {
    pub fn new(interval: Duration) -> Self {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            lat: 59.3293,
            lon: 18.0686,
            elevation: 10.0,
            speed: 1.2,
            activity: "walking".to_string(),
            remaining: None,
        }
    }

    /// Limit the feed to `count` samples
    pub fn with_limit(mut self, count: u64) -> Self {
        self.remaining = Some(count);
        self
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    async fn next_sample(&mut self) -> Option<LocationSample> {
        if let Some(remaining) = self.remaining.as_mut() {
            if *remaining == 0 {
                return None;
            }
            *remaining -= 1;
        }

        self.ticker.tick().await;
        let sample = LocationSample::new(self.lat, self.lon)
            .with_elevation(self.elevation)
            .with_speed(self.speed)
            .with_activity(&self.activity);

        self.lat += LAT_STEP;
        self.lon += LON_STEP;
        Some(sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_simulated_sensor_drifts() {
        let mut sensor = SimulatedSensor::new(Duration::from_secs(1));
        let first = sensor.next_sample().await.unwrap();
        let second = sensor.next_sample().await.unwrap();

        assert_eq!(first.lat, 59.3293);
        assert_eq!(first.lon, 18.0686);
        assert_eq!(first.elevation, Some(10.0));
        assert_eq!(first.speed, Some(1.2));
        assert_eq!(first.activity.as_deref(), Some("walking"));
        assert_eq!(first.timestamp, None);
        assert!((second.lat - first.lat - LAT_STEP).abs() < 1e-12);
        assert!((second.lon - first.lon - LON_STEP).abs() < 1e-12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_sensor_respects_interval() {
        let mut sensor = SimulatedSensor::new(Duration::from_millis(500));
        let start = tokio::time::Instant::now();
        for _ in 0..3 {
            sensor.next_sample().await.unwrap();
        }
        // First tick fires immediately
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_sensor_limit() {
        let mut sensor = SimulatedSensor::new(Duration::from_millis(10)).with_limit(2);
        assert!(sensor.next_sample().await.is_some());
        assert!(sensor.next_sample().await.is_some());
        assert!(sensor.next_sample().await.is_none());
    }
}
