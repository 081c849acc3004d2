//! Driver configuration
//!
//! Loaded from a `cqlshard.toml` file, optionally overridden by environment
//! variables (which may come from a `.env` file next to it):
//!
//! - `CQLSHARD_HOSTS` - comma separated seed hosts
//! - `CQLSHARD_PORT` - native protocol port
//! - `CQLSHARD_LOCAL_DC` - datacenter preferred by the DC-aware policy
//! - `CQLSHARD_CONSISTENCY` - default consistency level
//! - `CQLSHARD_COMPRESSION` - `lz4` or `snappy`
//! - `CQLSHARD_USERNAME` / `CQLSHARD_PASSWORD` - password authenticator credentials

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{DriverError, DriverResult};
use crate::frame::{compressor_by_name, Compressor, Consistency, Event};
use crate::metrics::DriverMetrics;
use crate::transport::auth::{Authenticator, PasswordAuthenticator};

pub const CONFIG_FILE_NAME: &str = "cqlshard.toml";

pub const ENV_HOSTS: &str = "CQLSHARD_HOSTS";
pub const ENV_PORT: &str = "CQLSHARD_PORT";
pub const ENV_LOCAL_DC: &str = "CQLSHARD_LOCAL_DC";
pub const ENV_CONSISTENCY: &str = "CQLSHARD_CONSISTENCY";
pub const ENV_COMPRESSION: &str = "CQLSHARD_COMPRESSION";
pub const ENV_USERNAME: &str = "CQLSHARD_USERNAME";
pub const ENV_PASSWORD: &str = "CQLSHARD_PASSWORD";

/// Number of stream ids a v4 connection can use (0..=32767)
pub const MAX_STREAMS: usize = 32768;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed hosts, `host` or `host:port`
    pub hosts: Vec<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub local_dc: Option<String>,
    #[serde(default = "default_consistency")]
    pub consistency: Consistency,
    #[serde(default)]
    pub serial_consistency: Option<Consistency>,
    #[serde(default = "default_page_size")]
    pub page_size: Option<i32>,
    #[serde(default)]
    pub compression: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// 0 disables the per-request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refill_backoff_ms")]
    pub refill_backoff_ms: u64,
    #[serde(default = "default_max_streams")]
    pub max_streams: usize,
    #[serde(default = "default_writer_queue_size")]
    pub writer_queue_size: usize,
    #[serde(default = "default_true")]
    pub token_aware: bool,
    #[serde(default = "default_true")]
    pub dc_aware: bool,
}

fn default_port() -> u16 {
    9042
}

fn default_consistency() -> Consistency {
    Consistency::LocalQuorum
}

fn default_page_size() -> Option<i32> {
    Some(5000)
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_request_timeout_ms() -> u64 {
    12_000
}

fn default_refresh_interval_secs() -> u64 {
    60
}

fn default_refill_backoff_ms() -> u64 {
    1_000
}

fn default_max_streams() -> usize {
    MAX_STREAMS
}

fn default_writer_queue_size() -> usize {
    1024
}

fn default_true() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new(vec!["127.0.0.1".to_string()])
    }
}

impl ClusterConfig {
    pub fn new(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            port: default_port(),
            local_dc: None,
            consistency: default_consistency(),
            serial_consistency: None,
            page_size: default_page_size(),
            compression: None,
            username: None,
            password: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            refill_backoff_ms: default_refill_backoff_ms(),
            max_streams: default_max_streams(),
            writer_queue_size: default_writer_queue_size(),
            token_aware: true,
            dc_aware: true,
        }
    }

    /// Load `cqlshard.toml` from a directory, after loading an optional
    /// `.env` file from the same directory, then apply env overrides
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            anyhow::bail!("Configuration file not found: {}", config_path.display());
        }

        let content = std::fs::read_to_string(&config_path)?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup; empty values are ignored
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(hosts) = get(ENV_HOSTS) {
            self.hosts = hosts
                .split(',')
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
                .collect();
        }
        if let Some(port) = get(ENV_PORT).and_then(|p| p.parse::<u16>().ok()) {
            self.port = port;
        }
        if let Some(dc) = get(ENV_LOCAL_DC) {
            self.local_dc = Some(dc);
        }
        if let Some(consistency) = get(ENV_CONSISTENCY).and_then(|c| c.parse().ok()) {
            self.consistency = consistency;
        }
        if let Some(compression) = get(ENV_COMPRESSION) {
            self.compression = Some(compression);
        }
        if let Some(username) = get(ENV_USERNAME) {
            self.username = Some(username);
        }
        if let Some(password) = get(ENV_PASSWORD) {
            self.password = Some(password);
        }
    }

    pub fn validate(&self) -> DriverResult<()> {
        if self.hosts.is_empty() {
            return Err(DriverError::Config("at least one host is required".to_string()));
        }
        if self.max_streams == 0 || self.max_streams > MAX_STREAMS {
            return Err(DriverError::Config(format!(
                "max_streams must be in 1..={}, got {}",
                MAX_STREAMS, self.max_streams
            )));
        }
        if self.writer_queue_size == 0 {
            return Err(DriverError::Config(
                "writer_queue_size must be positive".to_string(),
            ));
        }
        if let Some(name) = &self.compression {
            compressor_by_name(name)?;
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(DriverError::Config(
                "username and password must be set together".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve seed hosts, appending the default port where none is given
    pub async fn resolve_hosts(&self) -> DriverResult<Vec<SocketAddr>> {
        let mut addrs = Vec::new();
        for host in &self.hosts {
            if let Ok(addr) = host.parse::<SocketAddr>() {
                addrs.push(addr);
                continue;
            }
            let target = if host.contains(':') && !host.contains("::") {
                host.clone()
            } else {
                format!("{}:{}", host, self.port)
            };
            let target = match target.parse::<std::net::IpAddr>() {
                Ok(ip) => format!("{}", SocketAddr::new(ip, self.port)),
                Err(_) => target,
            };
            match tokio::net::lookup_host(&target).await {
                Ok(resolved) => addrs.extend(resolved),
                Err(e) => tracing::warn!("Failed to resolve host {}: {}", host, e),
            };
        }
        if addrs.is_empty() {
            return Err(DriverError::Config(
                "none of the configured hosts could be resolved".to_string(),
            ));
        }
        Ok(addrs)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn refill_backoff(&self) -> Duration {
        Duration::from_millis(self.refill_backoff_ms)
    }

    /// Runtime settings shared by every connection of a cluster
    pub fn connection_config(&self, metrics: Arc<DriverMetrics>) -> DriverResult<ConnectionConfig> {
        let compression = self
            .compression
            .as_deref()
            .map(compressor_by_name)
            .transpose()?;
        let authenticator: Option<Arc<dyn Authenticator>> =
            match (&self.username, &self.password) {
                (Some(user), Some(pass)) => Some(Arc::new(PasswordAuthenticator::new(
                    user.clone(),
                    pass.clone(),
                ))),
                _ => None,
            };
        Ok(ConnectionConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: self.request_timeout(),
            compression,
            authenticator,
            event_sender: None,
            max_streams: self.max_streams,
            writer_queue_size: self.writer_queue_size,
            metrics,
        })
    }
}

/// Per-connection runtime settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
    /// Requested algorithm; used only when the server lists it in SUPPORTED
    pub compression: Option<Arc<dyn Compressor>>,
    pub authenticator: Option<Arc<dyn Authenticator>>,
    /// Receives server events pushed on negative stream ids
    pub event_sender: Option<mpsc::UnboundedSender<Event>>,
    pub max_streams: usize,
    pub writer_queue_size: usize,
    pub metrics: Arc<DriverMetrics>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(default_connect_timeout_ms()),
            request_timeout: Some(Duration::from_millis(default_request_timeout_ms())),
            compression: None,
            authenticator: None,
            event_sender: None,
            max_streams: MAX_STREAMS,
            writer_queue_size: default_writer_queue_size(),
            metrics: Arc::new(DriverMetrics::new()),
        }
    }
}

impl ConnectionConfig {
    pub fn with_event_sender(&self, sender: mpsc::UnboundedSender<Event>) -> Self {
        let mut config = self.clone();
        config.event_sender = Some(sender);
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_from_minimal_toml() {
        let config = ClusterConfig::from_toml_str("hosts = [\"10.0.0.1\"]").unwrap();
        assert_eq!(config.hosts, vec!["10.0.0.1"]);
        assert_eq!(config.port, 9042);
        assert_eq!(config.consistency, Consistency::LocalQuorum);
        assert_eq!(config.page_size, Some(5000));
        assert_eq!(config.refresh_interval(), Duration::from_secs(60));
        assert_eq!(config.refill_backoff(), Duration::from_secs(1));
        assert_eq!(config.max_streams, MAX_STREAMS);
        assert!(config.token_aware && config.dc_aware);
        config.validate().unwrap();
    }

    #[test]
    fn test_full_toml() {
        let content = r#"
            hosts = ["a", "b:19042"]
            port = 9043
            local_dc = "dc1"
            consistency = "ONE"
            serial_consistency = "LOCAL_SERIAL"
            compression = "lz4"
            username = "cassandra"
            password = "cassandra"
            request_timeout_ms = 0
            token_aware = false
        "#;
        let config = ClusterConfig::from_toml_str(content).unwrap();
        assert_eq!(config.local_dc.as_deref(), Some("dc1"));
        assert_eq!(config.consistency, Consistency::One);
        assert_eq!(config.serial_consistency, Some(Consistency::LocalSerial));
        assert_eq!(config.request_timeout(), None);
        assert!(!config.token_aware);
        config.validate().unwrap();

        let conn = config
            .connection_config(Arc::new(DriverMetrics::new()))
            .unwrap();
        assert_eq!(conn.compression.map(|c| c.name()), Some("lz4"));
        assert!(conn.authenticator.is_some());
    }

    #[test]
    fn test_validation() {
        let mut config = ClusterConfig::new(vec![]);
        assert!(config.validate().is_err());

        config.hosts = vec!["127.0.0.1".into()];
        config.compression = Some("zstd".into());
        assert!(config.validate().is_err());

        config.compression = None;
        config.max_streams = 0;
        assert!(config.validate().is_err());

        config.max_streams = 128;
        config.username = Some("only-user".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_HOSTS, "10.0.0.1, 10.0.0.2"),
            (ENV_PORT, "19042"),
            (ENV_CONSISTENCY, "local_one"),
            (ENV_LOCAL_DC, ""),
        ]
        .into_iter()
        .collect();
        let mut config = ClusterConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.hosts, vec!["10.0.0.1", "10.0.0.2"]);
        assert_eq!(config.port, 19042);
        assert_eq!(config.consistency, Consistency::LocalOne);
        assert_eq!(config.local_dc, None);
    }

    #[test]
    fn test_load_from_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ClusterConfig::load(dir.path()).is_err());

        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "hosts = [\"127.0.0.1\"]\nlocal_dc = \"datacenter1\"\n",
        )
        .unwrap();
        let config = ClusterConfig::load(dir.path()).unwrap();
        assert_eq!(config.local_dc.as_deref(), Some("datacenter1"));

        let saved = config.to_toml_string().unwrap();
        let reparsed = ClusterConfig::from_toml_str(&saved).unwrap();
        assert_eq!(reparsed.hosts, config.hosts);
    }

    #[tokio::test]
    async fn test_resolve_hosts() {
        let config = ClusterConfig::new(vec!["127.0.0.1".into(), "127.0.0.2:19042".into()]);
        let addrs = config.resolve_hosts().await.unwrap();
        assert_eq!(
            addrs,
            vec![
                "127.0.0.1:9042".parse::<SocketAddr>().unwrap(),
                "127.0.0.2:19042".parse().unwrap()
            ]
        );
    }
}
