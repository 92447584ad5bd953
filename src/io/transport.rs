//! Broker transport abstraction
//!
//! Link state plus a publish call: everything the publisher needs from the
//! broker client.

use async_trait::async_trait;
use rumqttc::QoS;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("publish timed out after {0} ms")]
    Timeout(u64),
    #[error("mqtt client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether the broker connection is currently open
    fn is_connected(&self) -> bool;

    /// Connection state changes; `true` on every (re)connect
    fn connection_events(&self) -> watch::Receiver<bool>;

    /// Hand one message to the broker client (retain is always false)
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>)
        -> Result<(), TransportError>;

    /// Disconnect gracefully, waiting at most `grace` for the client to finish
    async fn disconnect(&self, grace: std::time::Duration) -> Result<(), TransportError>;
}
