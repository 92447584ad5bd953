//! uOS IoT client - location telemetry publisher
//!
//! Reads samples from a sensor source and publishes them as JSON to
//! `client/{client_id}/session/{session_id}/`, queueing while offline.
//!
//! Module structure:
//! - `domain/` - Samples, payloads, sessions, topics
//! - `io/` - External interfaces (MQTT transport, sensor sources)
//! - `services/` - Publisher and offline queue
//! - `infra/` - Infrastructure (Config, Metrics, Broker)

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;
use uos_iot_client::infra::{Config, Metrics};
use uos_iot_client::io::{MqttTransport, SensorSource, SimulatedSensor, Transport};
use uos_iot_client::services::Publisher;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// uOS IoT client - publishes location telemetry over MQTT
#[derive(Parser, Debug)]
#[command(name = "uos-iot-client", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "CONFIG_FILE")]
    config: Option<String>,

    /// Start an embedded MQTT broker before connecting
    #[arg(long)]
    embedded_broker: bool,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_logging(format: LogFormat) {
    // RUST_LOG overrides, default INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init(),
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "ctrl_c_handler_failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "sigterm_handler_failed");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "uos-iot-client starting");

    let config = Config::load(args.config.as_deref()).context("failed to load configuration")?;

    info!(
        config_file = %config.config_file(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        qos = ?config.qos(),
        client_id = %config.client_id(),
        session_ttl_hours = ?config.session_ttl().map(|ttl| ttl.num_hours()),
        pinned_session = config.session_id().is_some(),
        topic_template = %config.topic_template(),
        publish_interval_ms = config.publish_interval().as_millis() as u64,
        max_queue = config.max_queue(),
        "config_loaded"
    );

    if args.embedded_broker {
        uos_iot_client::infra::broker::start_embedded_broker(&config)?;
    }

    // Create shutdown signal
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let metrics = Arc::new(Metrics::new());

    // Initial connection failure is fatal
    let transport: Arc<dyn Transport> = Arc::new(
        MqttTransport::connect(&config).await.context("initial broker connection failed")?,
    );

    let publisher = Arc::new(Publisher::new(&config, transport, metrics.clone()));

    // Follow connection changes and drain the offline queue on reconnect
    let watcher = tokio::spawn(publisher.clone().run(shutdown_rx.clone()));

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    let mut metrics_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        // First tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => metrics_clone.report().log(),
                _ = metrics_shutdown.changed() => break,
            }
        }
    });

    // Handle shutdown on Ctrl+C / SIGTERM
    let shutdown_signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown_signal_received");
        let _ = shutdown_signal_tx.send(true);
    });

    // Sensor loop - one publish per sample until shutdown
    let mut sensor = SimulatedSensor::new(config.publish_interval());
    info!("sensor_started");
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            sample = sensor.next_sample() => match sample {
                Some(sample) => publisher.publish_point(sample).await,
                None => {
                    info!("sensor_exhausted");
                    break;
                }
            },
        }
    }

    let _ = shutdown_tx.send(true);
    publisher.close(config.shutdown_grace()).await;
    if tokio::time::timeout(config.shutdown_grace(), watcher).await.is_err() {
        warn!("publisher_watch_stop_timeout");
    }

    metrics.report().log();
    info!("uos-iot-client shutdown complete");
    Ok(())
}
