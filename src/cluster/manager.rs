//! Cluster handle: control connection, topology refresh and node pools
//!
//! The control connection reads `system.local`, `system.peers` and
//! `system_schema.keyspaces` and receives server events. Every refresh
//! builds a fresh [`Topology`] and swaps it in atomically; nodes that
//! survive a refresh keep their connection pool.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::keyspace::{Keyspace, ReplicationStrategy};
use super::node::{Node, NodeStatus, PeerInfo};
use super::token::Token;
use super::topology::Topology;
use crate::config::{ClusterConfig, ConnectionConfig};
use crate::error::{DriverError, DriverResult};
use crate::frame::{
    Consistency, CqlValue, Event, EventType, QueryResult, Rows, Statement, StatusChange,
};
use crate::metrics::DriverMetrics;
use crate::transport::{CloseNotice, ConnPool, Connection, Connector, TcpConnector};

const SELECT_LOCAL: &str =
    "SELECT data_center, rack, host_id, tokens FROM system.local WHERE key='local'";
const SELECT_PEERS: &str =
    "SELECT peer, rpc_address, data_center, rack, host_id, tokens FROM system.peers";
const SELECT_KEYSPACES: &str =
    "SELECT keyspace_name, durable_writes, replication FROM system_schema.keyspaces";

const EVENT_TYPES: [EventType; 3] = [
    EventType::TopologyChange,
    EventType::StatusChange,
    EventType::SchemaChange,
];

struct ClusterInner {
    config: ClusterConfig,
    seeds: Vec<SocketAddr>,
    connector: Arc<dyn Connector>,
    /// Settings for node pools; carries no event sender
    pool_config: ConnectionConfig,
    topology: ArcSwap<Topology>,
    control: Mutex<Option<Connection>>,
    events_tx: mpsc::UnboundedSender<Event>,
    control_closed_tx: mpsc::UnboundedSender<CloseNotice>,
    refresh_tx: mpsc::UnboundedSender<()>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<DriverMetrics>,
}

/// Handle to a connected cluster; cheap to clone
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("seeds", &self.inner.seeds)
            .field("nodes", &self.inner.topology.load().len())
            .finish()
    }
}

impl Cluster {
    /// Connect over TCP using `config`
    pub async fn connect(config: ClusterConfig) -> DriverResult<Self> {
        let connector = Arc::new(TcpConnector::new(Duration::from_millis(
            config.connect_timeout_ms,
        )));
        Self::connect_with(config, connector, Arc::new(DriverMetrics::new())).await
    }

    /// Connect through a custom [`Connector`]
    ///
    /// Fails if no seed accepts a control connection or the first topology
    /// read fails. Returns once every node's pool has at least one
    /// connection or the connect timeout elapsed.
    pub async fn connect_with(
        config: ClusterConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<DriverMetrics>,
    ) -> DriverResult<Self> {
        config.validate()?;
        let seeds = config.resolve_hosts().await?;
        let pool_config = config.connection_config(metrics.clone())?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_closed_tx, control_closed_rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let interval = config.refresh_interval();

        let inner = Arc::new(ClusterInner {
            config,
            seeds,
            connector,
            pool_config,
            topology: ArcSwap::from_pointee(Topology::empty()),
            control: Mutex::new(None),
            events_tx,
            control_closed_tx,
            refresh_tx,
            shutdown,
            metrics,
        });

        inner.refresh().await?;

        let topology = inner.topology.load_full();
        if let Some(local_dc) = &inner.config.local_dc {
            if !topology.datacenters().contains(local_dc.as_str()) {
                warn!("Local datacenter '{}' has no nodes", local_dc);
            }
        }
        let timeout = inner.pool_config.connect_timeout;
        let waits = topology
            .nodes()
            .iter()
            .filter_map(|n| n.pool())
            .map(|pool| pool.wait_for_connections(1, timeout));
        join_all(waits).await;
        info!(
            "Connected to cluster with {} nodes in {} datacenters",
            topology.len(),
            topology.datacenters().len()
        );

        tokio::spawn(run_refresher(
            Arc::downgrade(&inner),
            interval,
            events_rx,
            control_closed_rx,
            refresh_rx,
            shutdown_rx,
        ));
        Ok(Self { inner })
    }

    /// Current topology snapshot
    pub fn topology(&self) -> Arc<Topology> {
        self.inner.topology.load_full()
    }

    pub fn node(&self, addr: SocketAddr) -> Option<Arc<Node>> {
        self.inner.topology.load().node(addr).cloned()
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        &self.inner.metrics
    }

    /// Address of the node serving the control connection
    pub async fn control_addr(&self) -> Option<SocketAddr> {
        self.inner
            .control
            .lock()
            .await
            .as_ref()
            .filter(|c| !c.is_closed())
            .map(|c| c.addr())
    }

    /// Re-read the topology now
    pub async fn refresh(&self) -> DriverResult<()> {
        self.inner.refresh().await
    }

    /// Ask the background task for a refresh without waiting for it
    pub fn request_refresh(&self) {
        let _ = self.inner.refresh_tx.send(());
    }

    /// Stop the refresher and close the control connection and every pool
    pub async fn close(&self) {
        self.inner.shutdown.send_replace(true);
        if let Some(control) = self.inner.control.lock().await.take() {
            control.close();
        }
        let topology = self.inner.topology.swap(Arc::new(Topology::empty()));
        for node in topology.nodes() {
            if let Some(pool) = node.pool() {
                pool.close();
            }
        }
        info!("Cluster closed");
    }
}

impl ClusterInner {
    async fn refresh(&self) -> DriverResult<()> {
        let mut control = self.control.lock().await;

        if let Some(conn) = control.as_ref().filter(|c| !c.is_closed()) {
            match self.read_topology(conn).await {
                Ok(topology) => {
                    self.apply(topology);
                    return Ok(());
                }
                Err(e) => {
                    warn!("Topology refresh over {} failed: {}", conn.addr(), e);
                    conn.close();
                }
            }
        }
        let failed = control.take().map(|c| c.addr());

        let mut last_error = None;
        for addr in self.control_candidates(failed) {
            let conn = match self.open_control(addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!("Control connection to {} failed: {}", addr, e);
                    last_error = Some(e);
                    continue;
                }
            };
            match self.read_topology(&conn).await {
                Ok(topology) => {
                    info!("Control connection established to {}", addr);
                    conn.notify_on_close(self.control_closed_tx.clone());
                    self.apply(topology);
                    *control = Some(conn);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Topology read from {} failed: {}", addr, e);
                    conn.close();
                    last_error = Some(e);
                }
            }
        }

        DriverMetrics::incr(&self.metrics.topology_refresh_failures);
        let reason = last_error.map_or_else(|| "no hosts to try".to_string(), |e| e.to_string());
        warn!("Topology refresh failed on every host: {}", reason);
        Err(DriverError::Topology(reason))
    }

    /// Known nodes in topology order, then seeds not already listed,
    /// starting after the previous control host
    fn control_candidates(&self, failed: Option<SocketAddr>) -> Vec<SocketAddr> {
        let topology = self.topology.load();
        let mut seen = HashSet::new();
        let addrs = topology
            .nodes()
            .iter()
            .map(|n| n.addr)
            .chain(self.seeds.iter().copied())
            .filter(|addr| seen.insert(*addr))
            .collect();
        rotate_after(addrs, failed)
    }

    async fn open_control(&self, addr: SocketAddr) -> DriverResult<Connection> {
        let config = self.pool_config.with_event_sender(self.events_tx.clone());
        let conn = Connection::open(addr, None, self.connector.as_ref(), &config).await?;
        if let Err(e) = conn.register(&EVENT_TYPES).await {
            conn.close();
            return Err(e);
        }
        Ok(conn)
    }

    async fn read_topology(&self, control: &Connection) -> DriverResult<Topology> {
        let local_rows = select(control, SELECT_LOCAL).await?;
        let peer_rows = select(control, SELECT_PEERS).await?;
        let keyspace_rows = select(control, SELECT_KEYSPACES).await?;

        let mut peers = Vec::with_capacity(peer_rows.len() + 1);
        if !local_rows.is_empty() {
            peers.push(peer_info(&local_rows, 0, control.addr())?);
        }
        let port = control.addr().port();
        for row in 0..peer_rows.len() {
            let ip = match peer_address(&peer_rows, row)? {
                Some(ip) => ip,
                None => {
                    warn!("Skipping system.peers row {} without an address", row);
                    continue;
                }
            };
            peers.push(peer_info(&peer_rows, row, SocketAddr::new(ip, port))?);
        }

        let keyspaces = (0..keyspace_rows.len())
            .map(|row| keyspace(&keyspace_rows, row))
            .collect::<DriverResult<Vec<_>>>()?
            .into_iter()
            .map(|ks| (ks.name.clone(), ks))
            .collect();

        Ok(self.build(peers, keyspaces))
    }

    /// New snapshot, reusing the pools of nodes already known
    fn build(&self, peers: Vec<PeerInfo>, keyspaces: HashMap<String, Keyspace>) -> Topology {
        let old = self.topology.load();
        let nodes = peers
            .into_iter()
            .map(|info| {
                let previous = old.node(info.addr);
                let pool = match previous.and_then(|n| n.pool()) {
                    Some(pool) => pool.clone(),
                    None => {
                        debug!("Opening pool to {}", info.addr);
                        ConnPool::new(
                            info.addr,
                            self.connector.clone(),
                            self.pool_config.clone(),
                            self.config.refill_backoff(),
                        )
                    }
                };
                let node = Node::new(info, Some(pool));
                if let Some(previous) = previous {
                    node.set_status(previous.status());
                }
                Arc::new(node)
            })
            .collect();
        Topology::new(nodes, keyspaces)
    }

    fn apply(&self, topology: Topology) {
        let old = self.topology.swap(Arc::new(topology));
        let current = self.topology.load();
        for node in old.nodes() {
            if current.contains(node.addr) {
                continue;
            }
            info!("Node {} left the cluster", node.addr);
            if let Some(pool) = node.pool() {
                pool.close();
            }
        }
        DriverMetrics::incr(&self.metrics.topology_refreshes);
        debug!(
            "Topology refreshed: {} nodes, {} keyspaces",
            current.len(),
            current.keyspaces().len()
        );
    }

    /// Returns true when the event calls for a full refresh
    fn handle_event(&self, event: Event) -> bool {
        match event {
            Event::StatusChange { status, addr } => {
                let status = match status {
                    StatusChange::Up => NodeStatus::Up,
                    StatusChange::Down => NodeStatus::Down,
                };
                match self.topology.load().node(addr) {
                    Some(node) => {
                        if node.set_status(status) != status {
                            info!("Node {} is now {:?}", addr, status);
                        }
                        false
                    }
                    None => {
                        debug!("Status change for unknown node {}", addr);
                        true
                    }
                }
            }
            Event::TopologyChange { change, addr } => {
                info!("Topology change {:?} for {}", change, addr);
                true
            }
            Event::SchemaChange(change) => {
                debug!(
                    "Schema change {} in keyspace {}",
                    change.change,
                    change.target.keyspace()
                );
                true
            }
        }
    }
}

impl Drop for ClusterInner {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        for node in self.topology.load().nodes() {
            if let Some(pool) = node.pool() {
                pool.close();
            }
        }
    }
}

async fn run_refresher(
    inner: Weak<ClusterInner>,
    interval: Duration,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut control_closed: mpsc::UnboundedReceiver<CloseNotice>,
    mut refresh_requests: mpsc::UnboundedReceiver<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately and the cluster was just read
    tick.tick().await;

    loop {
        let needs_refresh = tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => break,
            _ = tick.tick() => true,
            Some(()) = refresh_requests.recv() => true,
            Some(notice) = control_closed.recv() => {
                warn!("Control connection to {} closed", notice.addr);
                true
            }
            Some(event) = events.recv() => match inner.upgrade() {
                Some(inner) => inner.handle_event(event),
                None => break,
            },
        };
        if !needs_refresh {
            continue;
        }
        let Some(inner) = inner.upgrade() else { break };
        // Failures are counted and logged; the next tick retries
        let _ = inner.refresh().await;
    }
    debug!("Cluster refresher stopped");
}

/// Starts the list just after `failed`, which moves to the back
fn rotate_after(mut addrs: Vec<SocketAddr>, failed: Option<SocketAddr>) -> Vec<SocketAddr> {
    if let Some(pos) = failed.and_then(|f| addrs.iter().position(|a| *a == f)) {
        addrs.rotate_left(pos + 1);
    }
    addrs
}

async fn select(conn: &Connection, query: &str) -> DriverResult<Rows> {
    let statement = Statement::new(query, Consistency::One);
    match conn.query(&statement).await? {
        QueryResult::Rows(rows) => Ok(rows),
        other => Err(DriverError::Topology(format!(
            "expected rows for '{}', got {:?}",
            query, other
        ))),
    }
}

fn text(rows: &Rows, row: usize, column: &str) -> DriverResult<Option<String>> {
    match rows.value_by_name(row, column)? {
        Some(CqlValue::Text(s)) | Some(CqlValue::Ascii(s)) => Ok(Some(s)),
        Some(other) => Err(DriverError::Topology(format!(
            "column {} holds {} instead of text",
            column,
            other.type_name()
        ))),
        None => Ok(None),
    }
}

/// `rpc_address`, falling back to `peer` when unset or a wildcard
fn peer_address(rows: &Rows, row: usize) -> DriverResult<Option<IpAddr>> {
    let rpc = rows
        .value_by_name(row, "rpc_address")?
        .map(|v| v.as_inet())
        .transpose()?
        .filter(|ip| !ip.is_unspecified());
    if rpc.is_some() {
        return Ok(rpc);
    }
    Ok(rows
        .value_by_name(row, "peer")?
        .map(|v| v.as_inet())
        .transpose()?)
}

fn peer_info(rows: &Rows, row: usize, addr: SocketAddr) -> DriverResult<PeerInfo> {
    let host_id = rows
        .value_by_name(row, "host_id")?
        .map(|v| v.as_uuid())
        .transpose()?;
    let tokens = match rows.value_by_name(row, "tokens")? {
        Some(value) => value
            .as_set()?
            .iter()
            .map(|t| {
                let raw = t.as_text()?;
                Token::parse(raw)
                    .ok_or_else(|| DriverError::Topology(format!("invalid token '{}'", raw)))
            })
            .collect::<DriverResult<Vec<_>>>()?,
        None => Vec::new(),
    };
    Ok(PeerInfo {
        addr,
        datacenter: text(rows, row, "data_center")?.unwrap_or_default(),
        rack: text(rows, row, "rack")?.unwrap_or_default(),
        host_id,
        tokens,
    })
}

fn keyspace(rows: &Rows, row: usize) -> DriverResult<Keyspace> {
    let name = text(rows, row, "keyspace_name")?
        .ok_or_else(|| DriverError::Topology("keyspace row without a name".to_string()))?;
    let durable_writes = rows
        .value_by_name(row, "durable_writes")?
        .map(|v| v.as_boolean())
        .transpose()?
        .unwrap_or(true);
    let mut options = HashMap::new();
    if let Some(value) = rows.value_by_name(row, "replication")? {
        for (k, v) in value.as_map()? {
            options.insert(k.as_text()?.to_string(), v.as_text()?.to_string());
        }
    }
    Ok(Keyspace {
        name,
        strategy: ReplicationStrategy::from_options(&options),
        durable_writes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{ColumnSpec, ColumnType, ResultMetadata, Row};

    fn rows(columns: &[(&str, ColumnType)], values: Vec<Vec<Option<CqlValue>>>) -> Rows {
        let columns: Vec<ColumnSpec> = columns
            .iter()
            .map(|(name, ty)| ColumnSpec {
                keyspace: "system".to_string(),
                table: "peers".to_string(),
                name: name.to_string(),
                ty: ty.clone(),
            })
            .collect();
        Rows {
            metadata: ResultMetadata {
                columns_count: columns.len(),
                paging_state: None,
                columns,
            },
            rows: values
                .into_iter()
                .map(|row| Row {
                    columns: row.into_iter().map(|v| v.map(|v| v.encode())).collect(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_peer_row_parsing() {
        let host_id = uuid::Uuid::new_v4();
        let rows = rows(
            &[
                ("peer", ColumnType::Inet),
                ("rpc_address", ColumnType::Inet),
                ("data_center", ColumnType::Text),
                ("rack", ColumnType::Text),
                ("host_id", ColumnType::Uuid),
                ("tokens", ColumnType::Set(Box::new(ColumnType::Text))),
            ],
            vec![
                vec![
                    Some(CqlValue::Inet("10.0.0.2".parse().unwrap())),
                    Some(CqlValue::Inet("0.0.0.0".parse().unwrap())),
                    Some(CqlValue::Text("dc1".into())),
                    Some(CqlValue::Text("rack1".into())),
                    Some(CqlValue::Uuid(host_id)),
                    Some(CqlValue::set(["-100", "42"])),
                ],
                vec![
                    Some(CqlValue::Inet("10.0.0.3".parse().unwrap())),
                    Some(CqlValue::Inet("192.168.0.3".parse().unwrap())),
                    None,
                    None,
                    None,
                    None,
                ],
            ],
        );

        let ip = peer_address(&rows, 0).unwrap().unwrap();
        assert_eq!(ip.to_string(), "10.0.0.2");
        let info = peer_info(&rows, 0, SocketAddr::new(ip, 9042)).unwrap();
        assert_eq!(info.datacenter, "dc1");
        assert_eq!(info.rack, "rack1");
        assert_eq!(info.host_id, Some(host_id));
        assert_eq!(info.tokens, vec![Token(-100), Token(42)]);

        let ip = peer_address(&rows, 1).unwrap().unwrap();
        assert_eq!(ip.to_string(), "192.168.0.3");
        let info = peer_info(&rows, 1, SocketAddr::new(ip, 9042)).unwrap();
        assert!(info.tokens.is_empty());
        assert_eq!(info.datacenter, "");
    }

    #[test]
    fn test_keyspace_row_parsing() {
        let rows = rows(
            &[
                ("keyspace_name", ColumnType::Text),
                ("durable_writes", ColumnType::Boolean),
                (
                    "replication",
                    ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text)),
                ),
            ],
            vec![vec![
                Some(CqlValue::Text("ks".into())),
                Some(CqlValue::Boolean(false)),
                Some(CqlValue::Map(vec![
                    (
                        CqlValue::Text("class".into()),
                        CqlValue::Text("org.apache.cassandra.locator.SimpleStrategy".into()),
                    ),
                    (
                        CqlValue::Text("replication_factor".into()),
                        CqlValue::Text("2".into()),
                    ),
                ])),
            ]],
        );
        let ks = keyspace(&rows, 0).unwrap();
        assert_eq!(ks.name, "ks");
        assert!(!ks.durable_writes);
        assert_eq!(ks.strategy, ReplicationStrategy::Simple { rf: 2 });
    }

    #[test]
    fn test_control_candidates_start_after_failed_host() {
        let addrs: Vec<SocketAddr> = (1..=4)
            .map(|i| format!("10.0.0.{}:9042", i).parse().unwrap())
            .collect();

        let rotated = rotate_after(addrs.clone(), Some(addrs[1]));
        assert_eq!(rotated, vec![addrs[2], addrs[3], addrs[0], addrs[1]]);

        let rotated = rotate_after(addrs.clone(), Some(addrs[3]));
        assert_eq!(rotated, addrs);

        // No previous host, or one no longer listed, keeps topology order
        assert_eq!(rotate_after(addrs.clone(), None), addrs);
        let gone: SocketAddr = "10.0.0.9:9042".parse().unwrap();
        assert_eq!(rotate_after(addrs.clone(), Some(gone)), addrs);
    }
}
