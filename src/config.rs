use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use tracing::trace;

use crate::util;

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./telemetry.db")
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    pub proxmox: ProxmoxConfig,

    #[serde(default)]
    pub collector: CollectorConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub drain: DrainConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub mqtt: MqttConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub subscriber: SubscriberConfig,

    #[serde(default)]
    pub api: ApiServerConfig,
}

/// Upstream Proxmox VE API
#[derive(Debug, Clone, Deserialize)]
pub struct ProxmoxConfig {
    /// e.g. `https://pve.example.com:8006/api2/json`
    pub base_url: String,

    /// API token in `user@realm!tokenid=secret` form
    pub token: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,

    /// RRD window requested per guest
    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Proxmox ships self-signed certificates by default
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

impl ProxmoxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    #[serde(default = "default_collector_interval")]
    pub interval_secs: u64,

    /// Upper bound on simultaneous `rrddata` requests per poll
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_collector_interval(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default = "default_buffer_path")]
    pub path: PathBuf,

    /// Capacity of the change notifier between cache and buffer writer
    #[serde(default = "default_notifier_capacity")]
    pub notifier_capacity: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: default_buffer_path(),
            notifier_capacity: default_notifier_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DrainConfig {
    #[serde(default = "default_drain_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_drain_interval(),
            batch_size: default_batch_size(),
        }
    }
}

/// Broker connection shared by the publisher and the raw ingest consumer
///
/// Each task opens its own connection with these settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default = "default_mqtt_host")]
    pub host: String,

    #[serde(default = "default_mqtt_port")]
    pub port: u16,

    pub username: Option<String>,
    pub password: Option<String>,

    /// Client ids are `<prefix>-<unix nanos>`
    #[serde(default = "default_client_prefix")]
    pub client_prefix: String,

    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Delay between connection attempts
    #[serde(default = "default_mqtt_retry_delay")]
    pub retry_delay_secs: u64,

    /// How long a publish may wait for its PUBACK
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            client_prefix: default_client_prefix(),
            keep_alive_secs: default_keep_alive(),
            retry_delay_secs: default_mqtt_retry_delay(),
            ack_timeout_secs: default_ack_timeout(),
        }
    }
}

impl MqttConfig {
    /// Reconnect delay, at least one second
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs.max(1))
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_publish_topic")]
    pub topic: String,

    #[serde(default = "default_publish_interval")]
    pub interval_secs: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_publish_topic(),
            interval_secs: default_publish_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriberConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_subscribe_topic")]
    pub topic: String,

    /// Delay before retrying a rejected or failed subscription
    #[serde(default = "default_subscribe_retry_delay")]
    pub retry_delay_secs: u64,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            topic: default_subscribe_topic(),
            retry_delay_secs: default_subscribe_retry_delay(),
        }
    }
}

impl SubscriberConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_addr: default_bind_addr(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_timeframe() -> String {
    "hour".to_string()
}

fn default_collector_interval() -> u64 {
    50 * 60
}

fn default_max_concurrent_fetches() -> usize {
    32
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("./buffer.jsonl")
}

fn default_notifier_capacity() -> usize {
    300
}

fn default_drain_interval() -> u64 {
    2 * 60
}

fn default_batch_size() -> usize {
    3000
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_prefix() -> String {
    "pve-telemetry".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_mqtt_retry_delay() -> u64 {
    5
}

fn default_ack_timeout() -> u64 {
    10
}

fn default_publish_topic() -> String {
    "pve/telemetry".to_string()
}

fn default_publish_interval() -> u64 {
    10
}

fn default_subscribe_topic() -> String {
    "pve/telemetry/raw".to_string()
}

fn default_subscribe_retry_delay() -> u64 {
    10
}

fn default_bind_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 5000))
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Secrets from the environment win over the file
    pub fn apply_env_overrides(&mut self) {
        if let Some(token) = util::get_api_token() {
            self.proxmox.token = Some(token);
        }
        if let Some(password) = util::get_mqtt_password() {
            self.mqtt.password = Some(password);
        }
    }
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let mut config: Config = serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;
    config.apply_env_overrides();
    trace!("loaded config: {config:?}");
    Ok(config)
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}
