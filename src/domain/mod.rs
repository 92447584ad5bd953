//! Domain types - telemetry samples, sessions and topics
//!
//! - `sample` - Location samples and the JSON wire payload
//! - `session` - Session id generation and TTL rotation
//! - `topic` - Topic template validation and resolution

pub mod sample;
pub mod session;
pub mod topic;

pub use sample::{LocationSample, TelemetryPayload};
pub use session::Session;
pub use topic::TopicTemplate;
