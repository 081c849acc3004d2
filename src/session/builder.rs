use std::sync::Arc;
use std::time::Duration;

use super::Session;
use crate::cluster::policy::{
    DcAwareRoundRobinPolicy, HostSelectionPolicy, RoundRobinPolicy, TokenAwarePolicy,
};
use crate::cluster::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::error::DriverResult;
use crate::frame::Consistency;
use crate::metrics::DriverMetrics;
use crate::transport::{Connector, TcpConnector};

pub struct SessionBuilder {
    config: ClusterConfig,
    connector: Option<Arc<dyn Connector>>,
    policy: Option<Arc<dyn HostSelectionPolicy>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    metrics: Option<Arc<DriverMetrics>>,
    keyspace: Option<String>,
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::from_config(ClusterConfig::new(Vec::new()))
    }
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: ClusterConfig) -> Self {
        Self {
            config,
            connector: None,
            policy: None,
            retry_policy: None,
            metrics: None,
            keyspace: None,
        }
    }

    /// Add a seed host, `host` or `host:port`
    pub fn known_node(mut self, host: &str) -> Self {
        self.config.hosts.push(host.to_string());
        self
    }

    pub fn known_nodes(mut self, hosts: &[&str]) -> Self {
        self.config.hosts.extend(hosts.iter().map(|h| h.to_string()));
        self
    }

    /// Port for seeds given without one
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    pub fn local_dc(mut self, dc: &str) -> Self {
        self.config.local_dc = Some(dc.to_string());
        self
    }

    pub fn consistency(mut self, consistency: Consistency) -> Self {
        self.config.consistency = consistency;
        self
    }

    pub fn serial_consistency(mut self, consistency: Consistency) -> Self {
        self.config.serial_consistency = Some(consistency);
        self
    }

    pub fn page_size(mut self, page_size: Option<i32>) -> Self {
        self.config.page_size = page_size;
        self
    }

    /// "lz4" or "snappy"
    pub fn compression(mut self, algorithm: &str) -> Self {
        self.config.compression = Some(algorithm.to_string());
        self
    }

    pub fn user(mut self, username: &str, password: &str) -> Self {
        self.config.username = Some(username.to_string());
        self.config.password = Some(password.to_string());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// `None` disables the per-request timeout
    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.config.refresh_interval_secs = interval.as_secs();
        self
    }

    pub fn refill_backoff(mut self, backoff: Duration) -> Self {
        self.config.refill_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn max_streams(mut self, max_streams: usize) -> Self {
        self.config.max_streams = max_streams;
        self
    }

    pub fn token_aware(mut self, enabled: bool) -> Self {
        self.config.token_aware = enabled;
        self
    }

    pub fn dc_aware(mut self, enabled: bool) -> Self {
        self.config.dc_aware = enabled;
        self
    }

    pub fn default_keyspace(mut self, keyspace: &str) -> Self {
        self.keyspace = Some(keyspace.to_string());
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Replace the policy derived from `token_aware` / `dc_aware`
    pub fn host_selection_policy(mut self, policy: Arc<dyn HostSelectionPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn metrics(mut self, metrics: Arc<DriverMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Policy chain described by the configuration
    pub fn default_policy(config: &ClusterConfig) -> Arc<dyn HostSelectionPolicy> {
        let local_dc = config.local_dc.as_deref().filter(|_| config.dc_aware);
        let base: Box<dyn HostSelectionPolicy> = match local_dc {
            Some(dc) => Box::new(DcAwareRoundRobinPolicy::new(dc)),
            None => Box::new(RoundRobinPolicy::new()),
        };
        if !config.token_aware {
            return Arc::from(base);
        }
        let policy = TokenAwarePolicy::new(base);
        match local_dc {
            Some(dc) => Arc::new(policy.with_local_dc(dc)),
            None => Arc::new(policy),
        }
    }

    pub async fn build(self) -> DriverResult<Session> {
        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(TcpConnector::new(Duration::from_millis(
                self.config.connect_timeout_ms,
            )))
        });
        let metrics = self.metrics.unwrap_or_default();
        let policy = self
            .policy
            .unwrap_or_else(|| Self::default_policy(&self.config));
        let retry_policy = self
            .retry_policy
            .unwrap_or_else(|| Arc::new(DefaultRetryPolicy::new()));

        let consistency = self.config.consistency;
        let serial_consistency = self.config.serial_consistency;
        let page_size = self.config.page_size;
        let cluster = Cluster::connect_with(self.config, connector, metrics).await?;
        tracing::info!("Session ready, routing with {}", policy.name());

        Ok(Session {
            cluster,
            policy,
            retry_policy,
            consistency,
            serial_consistency,
            page_size,
            keyspace: self.keyspace,
        })
    }
}
