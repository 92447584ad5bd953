//! Embedded MQTT broker for local runs
//!
//! Started with `--embedded-broker` so the client can be exercised without
//! an external Mosquitto/EMQX. Only a plain MQTT v4 listener is opened.

use crate::infra::config::Config as AppConfig;
use anyhow::Context;
use rumqttd::{Broker, Config, ConnectionSettings, RouterConfig, ServerSettings};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Time given to the broker thread to bind its listener
const STARTUP_DELAY: Duration = Duration::from_millis(100);

/// Build the rumqttd configuration for a single v4 listener
fn broker_config(listen: SocketAddr) -> Config {
    let router = RouterConfig {
        max_segment_size: 10 * 1024 * 1024,
        max_segment_count: 10,
        max_connections: 100,
        max_outgoing_packet_count: 200,
        initialized_filters: None,
        ..Default::default()
    };

    let mut servers = HashMap::new();
    servers.insert(
        "v4".to_string(),
        ServerSettings {
            name: "v4".to_string(),
            listen,
            tls: None,
            next_connection_delay_ms: 1,
            connections: ConnectionSettings {
                connection_timeout_ms: 5000,
                max_payload_size: 64 * 1024,
                max_inflight_count: 100,
                auth: None,
                dynamic_filters: false,
                external_auth: None,
            },
        },
    );

    Config {
        id: 0,
        router,
        v4: Some(servers),
        v5: None,
        ws: None,
        prometheus: None,
        metrics: None,
        bridge: None,
        console: None,
        cluster: None,
    }
}

/// Resolve the configured listener address
pub fn listen_address(app_config: &AppConfig) -> anyhow::Result<SocketAddr> {
    let raw = format!("{}:{}", app_config.broker_bind_address(), app_config.broker_port());
    raw.parse().with_context(|| format!("invalid embedded broker address '{}'", raw))
}

/// Start the embedded broker on its own thread
///
/// `Broker::start` blocks, so the broker runs detached for the life of the
/// process. Returns the address it listens on.
pub fn start_embedded_broker(app_config: &AppConfig) -> anyhow::Result<SocketAddr> {
    let listen = listen_address(app_config)?;
    let config = broker_config(listen);

    thread::Builder::new()
        .name("embedded-broker".to_string())
        .spawn(move || {
            let mut broker = Broker::new(config);
            if let Err(e) = broker.start() {
                warn!(error = %e, "broker_start_failed");
            }
        })
        .context("failed to spawn embedded broker thread")?;

    thread::sleep(STARTUP_DELAY);
    info!(listen = %listen, "broker_started");
    Ok(listen)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::{BrokerSection, TomlConfig};

    fn config_with_broker(bind_address: &str, port: u16) -> AppConfig {
        let raw = TomlConfig {
            broker: BrokerSection { bind_address: bind_address.to_string(), port },
            ..Default::default()
        };
        AppConfig::from_toml(raw, "test").unwrap()
    }

    #[test]
    fn test_listen_address_default() {
        let addr = listen_address(&AppConfig::default()).unwrap();
        assert_eq!(addr, "127.0.0.1:1883".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn test_listen_address_invalid() {
        let config = config_with_broker("not-an-ip", 1883);
        assert!(listen_address(&config).is_err());
    }

    #[test]
    fn test_broker_config_single_v4_listener() {
        let listen: SocketAddr = "0.0.0.0:2883".parse().unwrap();
        let config = broker_config(listen);
        let servers = config.v4.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers["v4"].listen, listen);
        assert!(config.v5.is_none());
    }
}
