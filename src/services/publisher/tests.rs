//! Tests for the Publisher

use super::*;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::AtomicUsize;

/// Scripted in-memory transport
struct FakeTransport {
    state_tx: watch::Sender<bool>,
    published: parking_lot::Mutex<Vec<(String, QoS, Vec<u8>)>>,
    /// Number of upcoming publishes that fail
    fail_next: AtomicUsize,
    /// Publishes never complete while set
    stall: AtomicBool,
    disconnects: AtomicUsize,
}

impl FakeTransport {
    fn new(connected: bool) -> Arc<Self> {
        let (state_tx, _) = watch::channel(connected);
        Arc::new(Self {
            state_tx,
            published: parking_lot::Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            stall: AtomicBool::new(false),
            disconnects: AtomicUsize::new(0),
        })
    }

    fn set_connected(&self, connected: bool) {
        self.state_tx.send_replace(connected);
    }

    fn publish_count(&self) -> usize {
        self.published.lock().len()
    }

    fn topics(&self) -> Vec<String> {
        self.published.lock().iter().map(|(t, _, _)| t.clone()).collect()
    }

    fn payloads(&self) -> Vec<Value> {
        self.published.lock().iter().map(|(_, _, p)| serde_json::from_slice(p).unwrap()).collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_connected(&self) -> bool {
        *self.state_tx.borrow()
    }

    fn connection_events(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TransportError::NotConnected);
        }
        self.published.lock().push((topic.to_string(), qos, payload));
        Ok(())
    }

    async fn disconnect(&self, _grace: Duration) -> Result<(), TransportError> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        self.set_connected(false);
        Ok(())
    }
}

fn test_config() -> Config {
    Config::default().with_client_id("usr-1").with_session_id("sess-ab12")
}

fn create_publisher(config: &Config, transport: &Arc<FakeTransport>) -> (Publisher, Arc<Metrics>) {
    let metrics = Arc::new(Metrics::new());
    let transport: Arc<dyn Transport> = transport.clone();
    (Publisher::new(config, transport, metrics.clone()), metrics)
}

fn sample(n: u32) -> LocationSample {
    LocationSample::new(59.0 + f64::from(n) * 0.001, 18.0).with_activity("walking")
}

fn lat_of(payload: &Value) -> f64 {
    payload["lat"].as_f64().unwrap()
}

#[tokio::test]
async fn test_publish_while_disconnected_only_queues() {
    let transport = FakeTransport::new(false);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);

    publisher.publish_point(sample(1)).await;

    assert_eq!(transport.publish_count(), 0);
    assert_eq!(publisher.queue_len().await, 1);
    assert_eq!(metrics.queued_total(), 1);
    assert_eq!(metrics.queue_depth(), 1);
}

#[tokio::test]
async fn test_publish_before_first_drain_queues() {
    // Transport is up but the connect handler has not run yet
    let transport = FakeTransport::new(true);
    let (publisher, _) = create_publisher(&test_config(), &transport);

    publisher.publish_point(sample(1)).await;

    assert_eq!(transport.publish_count(), 0);
    assert_eq!(publisher.queue_len().await, 1);
}

#[tokio::test]
async fn test_publish_while_online_sends_directly() {
    let transport = FakeTransport::new(true);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);
    assert!(publisher.on_connect().await);

    publisher.publish_point(sample(1).with_elevation(12.5)).await;

    assert_eq!(publisher.queue_len().await, 0);
    assert_eq!(metrics.published_total(), 1);
    let published = transport.published.lock().clone();
    assert_eq!(published.len(), 1);
    let (topic, qos, payload) = &published[0];
    assert_eq!(topic, "client/usr-1/session/sess-ab12/");
    assert_eq!(*qos, QoS::AtLeastOnce);
    let json: Value = serde_json::from_slice(payload).unwrap();
    assert_eq!(json["elevation"], 12.5);
    assert_eq!(json["activity"], "walking");
    assert!(json["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn test_nan_and_absent_elevation_are_null() {
    let transport = FakeTransport::new(true);
    let (publisher, _) = create_publisher(&test_config(), &transport);
    publisher.on_connect().await;

    publisher.publish_point(LocationSample::new(1.0, 2.0).with_elevation(f64::NAN)).await;
    publisher.publish_point(LocationSample::new(1.0, 2.0)).await;

    let payloads = transport.payloads();
    assert_eq!(payloads.len(), 2);
    assert!(payloads.iter().all(|p| p["elevation"].is_null()));
}

#[tokio::test]
async fn test_publish_failure_queues_same_message() {
    let transport = FakeTransport::new(true);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);
    publisher.on_connect().await;

    transport.fail_next.store(1, Ordering::SeqCst);
    publisher.publish_point(sample(7)).await;

    assert_eq!(transport.publish_count(), 0);
    assert_eq!(publisher.queue_len().await, 1);
    assert_eq!(metrics.publish_failures(), 1);

    // Next connect drains exactly that message
    publisher.on_connect().await;
    let payloads = transport.payloads();
    assert_eq!(payloads.len(), 1);
    assert_eq!(lat_of(&payloads[0]), sample(7).lat);
}

#[tokio::test(start_paused = true)]
async fn test_publish_timeout_queues() {
    let config = test_config().with_publish_timeout(Duration::from_millis(200));
    let transport = FakeTransport::new(true);
    let (publisher, metrics) = create_publisher(&config, &transport);
    publisher.on_connect().await;

    transport.stall.store(true, Ordering::SeqCst);
    publisher.publish_point(sample(1)).await;

    assert_eq!(publisher.queue_len().await, 1);
    assert_eq!(metrics.publish_failures(), 1);
}

#[tokio::test]
async fn test_drain_on_connect_is_fifo() {
    let transport = FakeTransport::new(false);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);

    for n in 0..5 {
        publisher.publish_point(sample(n)).await;
    }
    assert_eq!(publisher.queue_len().await, 5);

    transport.set_connected(true);
    assert!(publisher.on_connect().await);

    let lats: Vec<f64> = transport.payloads().iter().map(lat_of).collect();
    let expected: Vec<f64> = (0..5).map(|n| sample(n).lat).collect();
    assert_eq!(lats, expected);
    assert_eq!(publisher.queue_len().await, 0);
    assert_eq!(metrics.drained_total(), 5);
    assert!(publisher.is_online().await);
}

#[tokio::test]
async fn test_drain_halt_keeps_remaining_in_order() {
    let transport = FakeTransport::new(false);
    let (publisher, _) = create_publisher(&test_config(), &transport);
    for n in 0..4 {
        publisher.publish_point(sample(n)).await;
    }

    transport.set_connected(true);
    // First drained publish fails
    transport.fail_next.store(1, Ordering::SeqCst);
    assert!(!publisher.on_connect().await);
    assert_eq!(publisher.queue_len().await, 4);
    assert!(!publisher.is_online().await);

    // New points keep queueing behind the backlog while offline
    publisher.publish_point(sample(4)).await;
    assert!(publisher.on_connect().await);

    let lats: Vec<f64> = transport.payloads().iter().map(lat_of).collect();
    let expected: Vec<f64> = (0..5).map(|n| sample(n).lat).collect();
    assert_eq!(lats, expected);
}

#[tokio::test]
async fn test_overflow_drops_oldest() {
    let config = test_config().with_max_queue(3);
    let transport = FakeTransport::new(false);
    let (publisher, metrics) = create_publisher(&config, &transport);

    for n in 0..5 {
        publisher.publish_point(sample(n)).await;
    }
    assert_eq!(publisher.queue_len().await, 3);
    assert_eq!(metrics.queue_dropped(), 2);

    transport.set_connected(true);
    publisher.on_connect().await;
    let lats: Vec<f64> = transport.payloads().iter().map(lat_of).collect();
    let expected: Vec<f64> = (2..5).map(|n| sample(n).lat).collect();
    assert_eq!(lats, expected);
}

#[tokio::test]
async fn test_invalid_position_is_rejected() {
    let transport = FakeTransport::new(false);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);

    publisher.publish_point(LocationSample::new(f64::NAN, 18.0)).await;

    assert_eq!(publisher.queue_len().await, 0);
    assert_eq!(metrics.samples_rejected(), 1);
    assert_eq!(metrics.samples_total(), 1);
}

#[tokio::test]
async fn test_queued_messages_keep_their_session() {
    let config = test_config().with_session_ttl(Some(chrono::Duration::hours(1)));
    let transport = FakeTransport::new(false);
    let (publisher, _) = create_publisher(&config, &transport);

    publisher.publish_point(sample(1)).await;
    // Force rotation on the next publish by rewinding the window start
    {
        let mut state = publisher.state.lock().await;
        let started = state.session.started() - chrono::Duration::hours(2);
        state.session = Session::started_at("usr-1", config.session_ttl(), None, started);
    }
    let rotated_from = publisher.session_id().await;
    publisher.publish_point(sample(2)).await;
    let rotated_to = publisher.session_id().await;
    assert_ne!(rotated_from, rotated_to);

    transport.set_connected(true);
    publisher.on_connect().await;
    assert_eq!(
        transport.topics(),
        vec![
            "client/usr-1/session/sess-ab12/".to_string(),
            format!("client/usr-1/session/{}/", rotated_to),
        ]
    );
}

#[tokio::test]
async fn test_run_drains_on_reconnect() {
    let transport = FakeTransport::new(false);
    let (publisher, _) = create_publisher(&test_config(), &transport);
    let publisher = Arc::new(publisher);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(publisher.clone().run(shutdown_rx));

    publisher.publish_point(sample(1)).await;
    publisher.publish_point(sample(2)).await;
    transport.set_connected(true);

    // Wait for the watcher to run the connect handler
    for _ in 0..100 {
        if publisher.is_online().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(publisher.is_online().await);
    assert_eq!(transport.publish_count(), 2);

    transport.set_connected(false);
    for _ in 0..100 {
        if !publisher.is_online().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!publisher.is_online().await);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_close_stops_accepting_and_disconnects() {
    let transport = FakeTransport::new(false);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);
    publisher.publish_point(sample(1)).await;

    publisher.close(Duration::from_millis(250)).await;
    publisher.publish_point(sample(2)).await;

    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(publisher.queue_len().await, 0);
    assert_eq!(metrics.samples_total(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_live_publish_is_sent_before_newer_points() {
    let transport = FakeTransport::new(true);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);
    let publisher = Arc::new(publisher);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(publisher.clone().run(shutdown_rx));

    for _ in 0..100 {
        if publisher.is_online().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(publisher.is_online().await);

    transport.fail_next.store(1, Ordering::SeqCst);
    publisher.publish_point(sample(1)).await;
    assert!(!publisher.is_online().await);

    // Link stays up: newer points queue behind the failed one
    publisher.publish_point(sample(2)).await;
    publisher.publish_point(sample(3)).await;
    assert_eq!(transport.publish_count(), 0);
    assert_eq!(publisher.queue_len().await, 3);

    tokio::time::sleep(DRAIN_RETRY_INTERVAL * 3).await;

    let lats: Vec<f64> = transport.payloads().iter().map(lat_of).collect();
    let expected: Vec<f64> = (1..4).map(|n| sample(n).lat).collect();
    assert_eq!(lats, expected);
    assert_eq!(publisher.queue_len().await, 0);
    assert!(publisher.is_online().await);
    assert_eq!(metrics.drained_total(), 3);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_close_bounded_by_grace_when_publish_stalls() {
    let transport = FakeTransport::new(true);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);
    let publisher = Arc::new(publisher);
    assert!(publisher.on_connect().await);

    transport.stall.store(true, Ordering::SeqCst);
    let stalled = tokio::spawn({
        let publisher = publisher.clone();
        async move { publisher.publish_point(sample(1)).await }
    });
    // Let the spawned publish take the state lock
    tokio::time::sleep(Duration::from_millis(10)).await;

    let grace = Duration::from_millis(250);
    let start = tokio::time::Instant::now();
    publisher.close(grace).await;
    let elapsed = start.elapsed();

    assert!(elapsed >= grace);
    assert!(elapsed < test_config().publish_timeout());
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(transport.publish_count(), 0);
    assert_eq!(metrics.samples_total(), 1);

    stalled.abort();
}

#[tokio::test(start_paused = true)]
async fn test_close_past_grace_keeps_queue_depth() {
    let transport = FakeTransport::new(false);
    let (publisher, metrics) = create_publisher(&test_config(), &transport);
    let publisher = Arc::new(publisher);
    publisher.publish_point(sample(1)).await;
    publisher.publish_point(sample(2)).await;
    assert_eq!(metrics.queue_depth(), 2);

    transport.set_connected(true);
    transport.stall.store(true, Ordering::SeqCst);
    let draining = tokio::spawn({
        let publisher = publisher.clone();
        async move { publisher.on_connect().await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;

    publisher.close(Duration::from_millis(250)).await;

    // Nothing was cleared, so the gauge still reports the backlog
    assert_eq!(metrics.queue_depth(), 2);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

    draining.abort();
}
