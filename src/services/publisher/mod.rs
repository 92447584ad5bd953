//! Telemetry publisher
//!
//! Routes every point either straight to the broker or into the offline
//! queue, and flushes the queue whenever the transport (re)connects.
//!
//! Session and queue sit behind one async mutex. The only network await
//! made while holding it is the transport publish, bounded by the publish
//! timeout, so a stalled broker delays the producer by at most that long.
//!
//! Ordering: live publishes are only attempted once a drain has completed
//! (`online`), so anything produced before or during a reconnect is queued
//! behind the backlog and sent in production order.

#[cfg(test)]
mod tests;

use crate::domain::sample::{LocationSample, TelemetryPayload};
use crate::domain::session::Session;
use crate::domain::topic::TopicTemplate;
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::transport::{Transport, TransportError};
use crate::services::offline_queue::{OfflineQueue, QueuedMessage};
use chrono::Utc;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Delay before retrying a drain that stopped while the link stayed up
const DRAIN_RETRY_INTERVAL: Duration = Duration::from_secs(1);

struct PublisherState {
    session: Session,
    queue: OfflineQueue,
    /// Backlog drained and live publishing allowed
    online: bool,
}

pub struct Publisher {
    state: Mutex<PublisherState>,
    transport: Arc<dyn Transport>,
    topic_template: TopicTemplate,
    qos: QoS,
    publish_timeout: Duration,
    metrics: Arc<Metrics>,
    accepting: AtomicBool,
}

impl Publisher {
    pub fn new(config: &Config, transport: Arc<dyn Transport>, metrics: Arc<Metrics>) -> Self {
        let session = Session::new(config.client_id(), config.session_ttl(), config.session_id());
        info!(
            client_id = %session.client_id(),
            session_id = %session.session_id(),
            pinned = session.is_pinned(),
            "session_started"
        );

        Self {
            state: Mutex::new(PublisherState {
                session,
                queue: OfflineQueue::new(config.max_queue()),
                online: false,
            }),
            transport,
            topic_template: config.topic_template().clone(),
            qos: config.qos(),
            publish_timeout: config.publish_timeout(),
            metrics,
            accepting: AtomicBool::new(true),
        }
    }

    /// Publish one point; never fails from the caller's point of view
    ///
    /// Failed or skipped publishes end up in the offline queue.
    pub async fn publish_point(&self, sample: LocationSample) {
        if !self.accepting.load(Ordering::Acquire) {
            debug!("sample_ignored_closing");
            return;
        }
        self.metrics.record_sample();

        if !sample.has_valid_position() {
            self.metrics.record_sample_rejected();
            warn!(lat = sample.lat, lon = sample.lon, "sample_rejected_invalid_position");
            return;
        }

        let mut state = self.state.lock().await;
        if state.session.maybe_rotate() {
            self.metrics.record_session_rotation();
        }

        let payload = TelemetryPayload::from_sample(&sample, Utc::now());
        let bytes = match payload.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "payload_serialize_failed");
                return;
            }
        };
        let topic =
            self.topic_template.resolve(state.session.client_id(), state.session.session_id());
        let message = QueuedMessage::new(topic, bytes);

        if state.online && self.transport.is_connected() {
            match self.send(&message).await {
                Ok(()) => {
                    self.metrics.record_published();
                    debug!(topic = %message.topic, "telemetry_published");
                    return;
                }
                Err(e) => {
                    // Later points queue behind this one until the watcher drains
                    state.online = false;
                    self.metrics.record_publish_failure();
                    warn!(error = %e, topic = %message.topic, "publish_failed_queueing");
                }
            }
        }

        self.enqueue(&mut state, message);
    }

    /// Connect handler: flush the backlog, then go online
    ///
    /// Returns whether the publisher is online afterwards. A drain that
    /// stops on a publish error leaves the rest queued, oldest first.
    pub async fn on_connect(&self) -> bool {
        let mut state = self.state.lock().await;
        let backlog = state.queue.len();

        let transport = self.transport.as_ref();
        let qos = self.qos;
        let timeout = self.publish_timeout;
        let report = state
            .queue
            .drain(move |message| async move {
                let result = send_message(transport, qos, timeout, &message).await;
                result.map_err(|e| (message, e))
            })
            .await;

        self.metrics.record_drained(report.sent as u64);
        self.metrics.set_queue_depth(state.queue.len());

        match report.halted {
            None => {
                state.online = true;
                if backlog > 0 {
                    info!(drained = report.sent, "offline_queue_drained");
                }
                info!(session_id = %state.session.session_id(), "publisher_online");
                true
            }
            Some(e) => {
                state.online = false;
                self.metrics.record_publish_failure();
                warn!(
                    error = %e,
                    drained = report.sent,
                    remaining = state.queue.len(),
                    "offline_queue_drain_halted"
                );
                false
            }
        }
    }

    /// Disconnect handler: route new points to the queue
    pub async fn on_disconnect(&self) {
        let mut state = self.state.lock().await;
        state.online = false;
        warn!(queued = state.queue.len(), "publisher_offline");
    }

    /// Follow transport connection changes until shutdown
    ///
    /// Also retries the drain while the link is up but the publisher is
    /// offline, after a halted drain or a failed live publish.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.transport.connection_events();

        if *events.borrow_and_update() {
            self.metrics.record_connection();
            self.on_connect().await;
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("publisher_watch_shutdown");
                        return;
                    }
                }
                changed = events.changed() => {
                    if changed.is_err() {
                        debug!("transport_events_closed");
                        return;
                    }
                    let connected = *events.borrow_and_update();
                    if connected {
                        self.metrics.record_connection();
                        self.on_connect().await;
                    } else {
                        self.on_disconnect().await;
                    }
                }
                _ = tokio::time::sleep(DRAIN_RETRY_INTERVAL) => {
                    if self.transport.is_connected() && !self.is_online().await {
                        self.on_connect().await;
                    }
                }
            }
        }
    }

    /// Stop accepting points and disconnect
    ///
    /// Waits up to `grace` for an in-flight publish or drain. Messages still
    /// queued are discarded: the queue is never persisted.
    pub async fn close(&self, grace: Duration) {
        self.accepting.store(false, Ordering::Release);

        match tokio::time::timeout(grace, self.state.lock()).await {
            Ok(mut state) => {
                state.online = false;
                let discarded = state.queue.clear();
                self.metrics.set_queue_depth(0);
                if discarded > 0 {
                    warn!(discarded, "offline_queue_discarded_on_close");
                }
            }
            Err(_) => {
                // Lock still held by an in-flight publish; queue left as is
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    pending = self.metrics.queue_depth(),
                    "publisher_close_grace_elapsed"
                );
            }
        }

        if let Err(e) = self.transport.disconnect(grace).await {
            warn!(error = %e, "transport_disconnect_failed");
        }
        info!("publisher_closed");
    }

    pub async fn queue_len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn session_id(&self) -> String {
        self.state.lock().await.session.session_id().to_string()
    }

    pub async fn is_online(&self) -> bool {
        self.state.lock().await.online
    }

    async fn send(&self, message: &QueuedMessage) -> Result<(), TransportError> {
        send_message(self.transport.as_ref(), self.qos, self.publish_timeout, message).await
    }

    fn enqueue(&self, state: &mut PublisherState, message: QueuedMessage) {
        if let Some(dropped) = state.queue.enqueue(message) {
            self.metrics.record_queue_dropped();
            warn!(
                topic = %dropped.topic,
                capacity = state.queue.capacity(),
                "offline_queue_full_dropped_oldest"
            );
        }
        self.metrics.record_queued();
        self.metrics.set_queue_depth(state.queue.len());
        debug!(queued = state.queue.len(), "telemetry_queued");
    }
}

/// Publish with retain off, bounded by `timeout`
async fn send_message(
    transport: &dyn Transport,
    qos: QoS,
    timeout: Duration,
    message: &QueuedMessage,
) -> Result<(), TransportError> {
    let publish = transport.publish(&message.topic, qos, message.payload.clone());
    match tokio::time::timeout(timeout, publish).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout.as_millis() as u64)),
    }
}
