use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{DEFAULT_BATCH_SIZE, MONITOR_QUEUE};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub actions: ActionsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Static node metadata. Stands in for the hosting platform's metadata service.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Defaults to the system hostname
    pub instance_id: Option<String>,
    #[serde(default = "default_local_address")]
    pub local_address: String,
    #[serde(default = "default_public_address")]
    pub public_address: String,
    /// Path to the `key=value` user data
    #[serde(default = "default_user_data")]
    pub user_data: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_spool_dir")]
    pub spool_dir: PathBuf,
    #[serde(default = "default_monitor_queue")]
    pub monitor_queue: String,
    /// How long a received message stays hidden before redelivery
    #[serde(default = "default_visibility")]
    pub visibility_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Pause after an empty poll
    #[serde(default = "default_wait")]
    pub wait_secs: u64,
    /// Messages older than this are dropped unprocessed
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_subscribe_interval")]
    pub subscribe_interval_secs: u64,
    /// 0 announces once and never again
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,
    #[serde(default = "default_ttl_multiplier")]
    pub ttl_multiplier: u32,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    #[serde(default = "default_debounce")]
    pub debounce_millis: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionsConfig {
    #[serde(default)]
    pub hosts: HostsActionConfig,
    #[serde(default)]
    pub haproxy: HaproxyActionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostsActionConfig {
    #[serde(default = "default_hosts_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HaproxyActionConfig {
    #[serde(default = "default_haproxy_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
    /// Appended to every generated `server` line
    #[serde(default = "default_server_args")]
    pub server_args: String,
    /// Per-service replacements for `server_args`
    #[serde(default)]
    pub service_args: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// How often a participant re-announces its own services
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Once,
    Every(Duration),
}

fn default_log_level() -> String {
    "discoveryd=info".to_string()
}

fn default_local_address() -> String {
    "127.0.0.1".to_string()
}

fn default_public_address() -> String {
    "0.0.0.0".to_string()
}

fn default_user_data() -> PathBuf {
    PathBuf::from("/etc/ec2-discovery/user-data")
}

fn default_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/ec2-discovery")
}

fn default_monitor_queue() -> String {
    MONITOR_QUEUE.to_string()
}

fn default_visibility() -> u64 {
    30
}

fn default_wait() -> u64 {
    1
}

fn default_max_age() -> u64 {
    60
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_subscribe_interval() -> u64 {
    10
}

fn default_announce_interval() -> u64 {
    3
}

fn default_ttl_multiplier() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    1
}

fn default_debounce() -> u64 {
    1000
}

fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_haproxy_path() -> PathBuf {
    PathBuf::from("/etc/haproxy/haproxy.cfg")
}

fn default_reload_command() -> String {
    "/etc/init.d/haproxy reload".to_string()
}

fn default_server_args() -> String {
    "check inter 1000".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8054".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_id: None,
            local_address: default_local_address(),
            public_address: default_public_address(),
            user_data: default_user_data(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            monitor_queue: default_monitor_queue(),
            visibility_secs: default_visibility(),
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            wait_secs: default_wait(),
            max_age_secs: default_max_age(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            subscribe_interval_secs: default_subscribe_interval(),
            announce_interval_secs: default_announce_interval(),
            ttl_multiplier: default_ttl_multiplier(),
            sweep_interval_secs: default_sweep_interval(),
            debounce_millis: default_debounce(),
        }
    }
}

impl Default for HostsActionConfig {
    fn default() -> Self {
        Self {
            path: default_hosts_path(),
        }
    }
}

impl Default for HaproxyActionConfig {
    fn default() -> Self {
        Self {
            config_path: default_haproxy_path(),
            reload_command: default_reload_command(),
            server_args: default_server_args(),
            service_args: HashMap::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_listen(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            node: NodeConfig::default(),
            queue: QueueConfig::default(),
            listener: ListenerConfig::default(),
            timing: TimingConfig::default(),
            actions: ActionsConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl TimingConfig {
    pub fn announce_cadence(&self) -> Cadence {
        match self.announce_interval_secs {
            0 => Cadence::Once,
            secs => Cadence::Every(Duration::from_secs(secs)),
        }
    }

    /// TTL attached to our own announcements. A few missed beats must not
    /// expire us, so the multiplier never drops below 2. One-shot
    /// announcements never expire.
    pub fn announce_ttl(&self) -> u32 {
        match self.announce_cadence() {
            Cadence::Once => u32::MAX,
            Cadence::Every(interval) => {
                let secs = u32::try_from(interval.as_secs()).unwrap_or(u32::MAX);
                secs.saturating_mul(self.ttl_multiplier.max(2))
            }
        }
    }

    pub fn subscribe_interval(&self) -> Duration {
        Duration::from_secs(self.subscribe_interval_secs.max(1))
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_millis)
    }
}

impl QueueConfig {
    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility_secs)
    }
}

impl ListenerConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_secs(self.wait_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }
}
