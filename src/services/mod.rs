//! Services - publishing logic
//!
//! - `offline_queue` - Bounded drop-oldest buffer for undelivered messages
//! - `publisher` - Live/queued routing and reconnect drain

pub mod offline_queue;
pub mod publisher;

pub use offline_queue::{OfflineQueue, QueuedMessage};
pub use publisher::Publisher;
