//! uOS IoT telemetry client library
//!
//! Publishes location samples to an MQTT broker under a per-client,
//! per-session topic, buffering in a bounded offline queue while the broker
//! is unreachable. Exposed as a library for integration testing.

pub mod domain;
pub mod infra;
pub mod io;
pub mod services;
