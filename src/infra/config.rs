//! Configuration loading
//!
//! Sources, later ones win:
//! 1. Built-in defaults (start against a local broker with no setup)
//! 2. Optional TOML file (`--config <path>` or `CONFIG_FILE`)
//! 3. Environment variables (`MQTT_*`, `UOS_*`)
//!
//! Everything is validated here so a bad value fails at startup, never at
//! the first publish.

use crate::domain::topic::{TopicTemplate, DEFAULT_TOPIC_TEMPLATE};
use anyhow::Context;
use rumqttc::QoS;
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Minimum keep-alive accepted by the MQTT client
const MIN_KEEP_ALIVE_SECS: u64 = 5;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttSection {
    /// Host, `host:port`, or `tcp://` / `mqtt://` URL
    pub broker: String,
    /// Overrides any port in `broker`
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keepalive_secs: u64,
    pub connect_timeout_ms: u64,
    pub publish_timeout_ms: u64,
    pub reconnect_min_ms: u64,
    pub reconnect_max_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            broker: "localhost".to_string(),
            port: None,
            username: None,
            password: None,
            qos: 1,
            keepalive_secs: 60,
            connect_timeout_ms: 10_000,
            publish_timeout_ms: 5_000,
            reconnect_min_ms: 1_000,
            reconnect_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Generated as `cli-<12 hex>` when absent
    pub id: Option<String>,
    /// 0 disables rotation
    pub session_ttl_hours: u64,
    /// Pins the session id
    pub session_id: Option<String>,
    pub topic_template: String,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            id: None,
            session_ttl_hours: 26,
            session_id: None,
            topic_template: DEFAULT_TOPIC_TEMPLATE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorSection {
    pub publish_interval_secs: f64,
}

impl Default for SensorSection {
    fn default() -> Self {
        Self { publish_interval_secs: 1.0 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub max_messages: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self { max_messages: 10_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShutdownSection {
    pub grace_ms: u64,
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self { grace_ms: 250 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSection {
    pub interval_secs: u64,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self { interval_secs: 30 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub bind_address: String,
    pub port: u16,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self { bind_address: "127.0.0.1".to_string(), port: 1883 }
    }
}

/// Raw file layout; every section and field is optional
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub mqtt: MqttSection,
    pub client: ClientSection,
    pub sensor: SensorSection,
    pub queue: QueueSection,
    pub shutdown: ShutdownSection,
    pub metrics: MetricsSection,
    pub broker: BrokerSection,
}

impl TomlConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Apply environment overrides through `lookup`
    ///
    /// Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("MQTT_BROKER") {
            self.mqtt.broker = v;
        }
        if let Some(v) = get("MQTT_PORT") {
            self.mqtt.port = Some(parse_env("MQTT_PORT", &v)?);
        }
        if let Some(v) = get("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = get("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = get("MQTT_QOS") {
            self.mqtt.qos = parse_env("MQTT_QOS", &v)?;
        }
        if let Some(v) = get("MQTT_KEEPALIVE") {
            self.mqtt.keepalive_secs = parse_env("MQTT_KEEPALIVE", &v)?;
        }
        if let Some(v) = get("UOS_CLIENT_ID") {
            self.client.id = Some(v);
        }
        if let Some(v) = get("UOS_SESSION_TTL_HOURS") {
            self.client.session_ttl_hours = parse_env("UOS_SESSION_TTL_HOURS", &v)?;
        }
        if let Some(v) = get("UOS_SESSION_ID") {
            self.client.session_id = Some(v);
        }
        if let Some(v) = get("UOS_TOPIC_TEMPLATE") {
            self.client.topic_template = v;
        }
        if let Some(v) = get("UOS_PUBLISH_INTERVAL") {
            self.sensor.publish_interval_secs = parse_env("UOS_PUBLISH_INTERVAL", &v)?;
        }
        if let Some(v) = get("UOS_MAX_QUEUE") {
            self.queue.max_messages = parse_env("UOS_MAX_QUEUE", &v)?;
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse().with_context(|| format!("invalid {}={:?}", key, value))
}

/// Split a broker address into host and optional port
///
/// Accepts `host`, `host:port`, `tcp://host:port` and `mqtt://host:port`.
/// TLS schemes are rejected: certificate handling is not supported.
pub fn parse_broker_address(addr: &str) -> anyhow::Result<(String, Option<u16>)> {
    let addr = addr.trim().trim_end_matches('/');
    let rest = match addr.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => anyhow::bail!("unsupported broker scheme {:?} in {:?}", scheme, addr),
        None => addr,
    };

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .with_context(|| format!("invalid port in broker address {:?}", addr))?;
            (host, Some(port))
        }
        _ => (rest, None),
    };

    if host.is_empty() {
        anyhow::bail!("broker address {:?} has no host", addr);
    }
    Ok((host.to_string(), port))
}

fn parse_qos(qos: u8) -> anyhow::Result<QoS> {
    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => anyhow::bail!("invalid MQTT QoS {}, expected 0, 1 or 2", other),
    }
}

/// Generate a client id (`cli-<12 hex>`)
pub fn generate_client_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("cli-{}", &hex[..12])
}

/// Validated configuration used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    qos: QoS,
    keep_alive: Duration,
    connect_timeout: Duration,
    publish_timeout: Duration,
    reconnect_min: Duration,
    reconnect_max: Duration,
    client_id: String,
    session_ttl: Option<chrono::Duration>,
    session_id: Option<String>,
    topic_template: TopicTemplate,
    publish_interval: Duration,
    max_queue: usize,
    shutdown_grace: Duration,
    metrics_interval_secs: u64,
    broker_bind_address: String,
    broker_port: u16,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            qos: QoS::AtLeastOnce,
            keep_alive: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            publish_timeout: Duration::from_secs(5),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            client_id: generate_client_id(),
            session_ttl: Some(chrono::Duration::hours(26)),
            session_id: None,
            topic_template: TopicTemplate::default(),
            publish_interval: Duration::from_secs(1),
            max_queue: 10_000,
            shutdown_grace: Duration::from_millis(250),
            metrics_interval_secs: 30,
            broker_bind_address: "127.0.0.1".to_string(),
            broker_port: 1883,
            config_file: "default".to_string(),
        }
    }
}

impl Config {
    /// Load defaults, then `path` if given, then the process environment
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        Self::load_with_env(path, |key| env::var(key).ok())
    }

    /// Same as [`Config::load`] with an injectable environment
    pub fn load_with_env<F>(path: Option<&str>, lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut raw = match path {
            Some(path) => TomlConfig::from_file(path)?,
            None => TomlConfig::default(),
        };
        raw.apply_env(lookup)?;
        Self::from_toml(raw, path.unwrap_or("default"))
    }

    /// Validate a raw config
    pub fn from_toml(raw: TomlConfig, source: &str) -> anyhow::Result<Self> {
        let (mqtt_host, url_port) = parse_broker_address(&raw.mqtt.broker)?;
        let mqtt_port = raw.mqtt.port.or(url_port).unwrap_or(1883);
        let qos = parse_qos(raw.mqtt.qos)?;

        if raw.mqtt.keepalive_secs < MIN_KEEP_ALIVE_SECS {
            anyhow::bail!(
                "keep-alive must be at least {} seconds, got {}",
                MIN_KEEP_ALIVE_SECS,
                raw.mqtt.keepalive_secs
            );
        }
        if raw.mqtt.publish_timeout_ms == 0 || raw.mqtt.connect_timeout_ms == 0 {
            anyhow::bail!("connect and publish timeouts must be greater than zero");
        }
        if raw.mqtt.reconnect_min_ms == 0 || raw.mqtt.reconnect_min_ms > raw.mqtt.reconnect_max_ms
        {
            anyhow::bail!(
                "reconnect interval must satisfy 0 < min ({}) <= max ({})",
                raw.mqtt.reconnect_min_ms,
                raw.mqtt.reconnect_max_ms
            );
        }

        let client_id = match raw.client.id {
            Some(id) => id,
            None => generate_client_id(),
        };
        if client_id.is_empty() || client_id.contains(['/', '+', '#']) {
            anyhow::bail!("client id {:?} must be non-empty without '/', '+' or '#'", client_id);
        }
        if let Some(session_id) = raw.client.session_id.as_deref() {
            if session_id.contains(['/', '+', '#']) {
                anyhow::bail!("session id {:?} must not contain '/', '+' or '#'", session_id);
            }
        }

        let topic_template = TopicTemplate::parse(&raw.client.topic_template)?;

        let interval = raw.sensor.publish_interval_secs;
        if !interval.is_finite() || interval <= 0.0 {
            anyhow::bail!("publish interval must be a positive number of seconds, got {}", interval);
        }
        let publish_interval = Duration::try_from_secs_f64(interval)
            .with_context(|| format!("publish interval {} seconds is out of range", interval))?;

        if raw.queue.max_messages == 0 {
            anyhow::bail!("offline queue capacity must be greater than zero");
        }

        let session_ttl = match raw.client.session_ttl_hours {
            0 => None,
            hours => {
                let hours = i64::try_from(hours).context("session TTL out of range")?;
                Some(chrono::Duration::try_hours(hours).context("session TTL out of range")?)
            }
        };

        Ok(Self {
            mqtt_host,
            mqtt_port,
            mqtt_username: raw.mqtt.username,
            mqtt_password: raw.mqtt.password,
            qos,
            keep_alive: Duration::from_secs(raw.mqtt.keepalive_secs),
            connect_timeout: Duration::from_millis(raw.mqtt.connect_timeout_ms),
            publish_timeout: Duration::from_millis(raw.mqtt.publish_timeout_ms),
            reconnect_min: Duration::from_millis(raw.mqtt.reconnect_min_ms),
            reconnect_max: Duration::from_millis(raw.mqtt.reconnect_max_ms),
            client_id,
            session_ttl,
            session_id: raw.client.session_id.filter(|id| !id.is_empty()),
            topic_template,
            publish_interval,
            max_queue: raw.queue.max_messages,
            shutdown_grace: Duration::from_millis(raw.shutdown.grace_ms),
            metrics_interval_secs: raw.metrics.interval_secs.max(1),
            broker_bind_address: raw.broker.bind_address,
            broker_port: raw.broker.port,
            config_file: source.to_string(),
        })
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    pub fn reconnect_min(&self) -> Duration {
        self.reconnect_min
    }

    pub fn reconnect_max(&self) -> Duration {
        self.reconnect_max
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn session_ttl(&self) -> Option<chrono::Duration> {
        self.session_ttl
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn topic_template(&self) -> &TopicTemplate {
        &self.topic_template
    }

    pub fn publish_interval(&self) -> Duration {
        self.publish_interval
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn shutdown_grace(&self) -> Duration {
        self.shutdown_grace
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method to set the client id
    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.client_id = client_id.to_string();
        self
    }

    /// Builder method to pin the session id
    pub fn with_session_id(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    /// Builder method to set the offline queue capacity
    pub fn with_max_queue(mut self, max_queue: usize) -> Self {
        self.max_queue = max_queue.max(1);
        self
    }

    /// Builder method to set the publish timeout
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Builder method to set the session TTL (`None` disables rotation)
    pub fn with_session_ttl(mut self, ttl: Option<chrono::Duration>) -> Self {
        self.session_ttl = ttl;
        self
    }
}
