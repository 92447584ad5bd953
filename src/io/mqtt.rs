//! MQTT transport over rumqttc
//!
//! The first connection is made synchronously in [`MqttTransport::connect`]
//! and its failure is fatal. After that a background task polls the event
//! loop forever, reconnecting with capped exponential backoff and reporting
//! every connect/disconnect on a watch channel.

use crate::infra::config::Config;
use crate::io::transport::{Transport, TransportError};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Capacity of the client request channel
const REQUEST_CAPACITY: usize = 100;

/// Exponential reconnect delay, doubling from `min` up to `max`
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self { min, max, current: min }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.min;
    }
}

pub struct MqttTransport {
    client: AsyncClient,
    state_rx: watch::Receiver<bool>,
    closing: Arc<AtomicBool>,
    event_loop: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttTransport {
    /// Connect to the configured broker
    ///
    /// Fails when the broker refuses or does not answer within the connect
    /// timeout. On success the reconnecting event loop is running.
    pub async fn connect(config: &Config) -> anyhow::Result<Self> {
        let suffix = Uuid::new_v4().simple().to_string();
        let mqtt_client_id = format!("uos-{}-{}", config.client_id(), &suffix[..8]);

        let mut options =
            MqttOptions::new(mqtt_client_id.clone(), config.mqtt_host(), config.mqtt_port());
        options.set_keep_alive(config.keep_alive());
        options.set_clean_session(true);

        if let Some(username) = config.mqtt_username() {
            options.set_credentials(username, config.mqtt_password().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        match tokio::time::timeout(config.connect_timeout(), wait_for_connack(&mut eventloop))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => anyhow::bail!(
                "MQTT connect to {}:{} failed: {}",
                config.mqtt_host(),
                config.mqtt_port(),
                e
            ),
            Err(_) => anyhow::bail!(
                "MQTT connect to {}:{} timed out after {} ms",
                config.mqtt_host(),
                config.mqtt_port(),
                config.connect_timeout().as_millis()
            ),
        }

        info!(
            host = %config.mqtt_host(),
            port = config.mqtt_port(),
            mqtt_client_id = %mqtt_client_id,
            "mqtt_connected"
        );

        let (state_tx, state_rx) = watch::channel(true);
        let closing = Arc::new(AtomicBool::new(false));
        let backoff = Backoff::new(config.reconnect_min(), config.reconnect_max());
        let handle = tokio::spawn(run_event_loop(eventloop, state_tx, backoff, closing.clone()));

        Ok(Self {
            client,
            state_rx,
            closing,
            event_loop: parking_lot::Mutex::new(Some(handle)),
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn is_connected(&self) -> bool {
        *self.state_rx.borrow()
    }

    fn connection_events(&self) -> watch::Receiver<bool> {
        self.state_rx.clone()
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closing.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.client.publish(topic, qos, false, payload).await?;
        Ok(())
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), TransportError> {
        self.closing.store(true, Ordering::Release);
        let result = self.client.try_disconnect().map_err(TransportError::from);

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            if tokio::time::timeout(grace, handle).await.is_err() {
                warn!(grace_ms = grace.as_millis() as u64, "mqtt_disconnect_grace_elapsed");
                abort.abort();
            }
        }
        result
    }
}

/// Poll until the broker acknowledges the connection
async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

/// Drive the client until disconnect, reconnecting on errors
async fn run_event_loop(
    mut eventloop: EventLoop,
    state_tx: watch::Sender<bool>,
    mut backoff: Backoff,
    closing: Arc<AtomicBool>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                info!("mqtt_reconnected");
                state_tx.send_replace(true);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                // QoS 1 acknowledgement received
                debug!(pkid = ack.pkid, "mqtt_puback");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                info!("mqtt_disconnect_sent");
                state_tx.send_replace(false);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                if closing.load(Ordering::Acquire) {
                    state_tx.send_replace(false);
                    return;
                }
                if state_tx.send_replace(false) {
                    warn!(error = %e, "mqtt_connection_lost");
                }
                let delay = backoff.next_delay();
                warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "mqtt_reconnect_scheduled");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
