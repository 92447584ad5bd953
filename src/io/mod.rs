//! IO modules - external system interfaces
//!
//! - `transport` - Broker transport trait used by the publisher
//! - `mqtt` - rumqttc transport with automatic reconnection
//! - `sensor` - Location sample sources (simulated feed)

pub mod mqtt;
pub mod sensor;
pub mod transport;

// Re-export commonly used types
pub use mqtt::MqttTransport;
pub use sensor::{SensorSource, SimulatedSensor};
pub use transport::{Transport, TransportError};
