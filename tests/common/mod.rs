//! Common test utilities for driver integration tests
//!
//! Provides a scripted CQL node listening on localhost:
//! - OPTIONS / STARTUP / AUTH handshake with optional compression
//! - Scylla sharding keys and an optional shard-aware port
//! - system tables describing the node, its peers and keyspaces
//! - delayed replies, injected errors, forgotten prepared statements,
//!   server-pushed events and forced disconnects

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use cqlshard::cluster::Token;
use cqlshard::frame::compression::compressor_by_name;
use cqlshard::frame::{
    decode_request, encode_response, ColumnSpec, ColumnType, Compressor, CqlError, CqlValue,
    ErrorCode, ErrorDetails, Event, Prepared, PreparedMetadata, QueryResult, Request, Response,
    ResultMetadata, Row, Rows, Value,
};
use cqlshard::transport::connection::read_frame;

pub const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// Install a tracing subscriber honoring `RUST_LOG`, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cqlshard=info".into()),
        )
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone)]
pub struct PeerRow {
    pub ip: std::net::IpAddr,
    pub datacenter: String,
    pub rack: String,
    pub tokens: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub nr_shards: u32,
    pub msb_ignore: u8,
    pub shard_aware_port: bool,
    pub compression: Vec<String>,
    pub credentials: Option<(String, String)>,
    pub datacenter: String,
    pub rack: String,
    pub tokens: Vec<i64>,
    pub peers: Vec<PeerRow>,
    pub keyspaces: Vec<(String, Vec<(String, String)>)>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            nr_shards: 1,
            msb_ignore: 12,
            shard_aware_port: false,
            compression: vec!["lz4".to_string(), "snappy".to_string()],
            credentials: None,
            datacenter: "dc1".to_string(),
            rack: "rack1".to_string(),
            tokens: vec![0],
            peers: Vec::new(),
            keyspaces: vec![(
                "ks".to_string(),
                vec![
                    (
                        "class".to_string(),
                        "org.apache.cassandra.locator.SimpleStrategy".to_string(),
                    ),
                    ("replication_factor".to_string(), "1".to_string()),
                ],
            )],
        }
    }
}

impl NodeConfig {
    pub fn sharded(nr_shards: u32, shard_aware_port: bool) -> Self {
        Self {
            nr_shards,
            shard_aware_port,
            ..Default::default()
        }
    }
}

struct ConnState {
    shard: u32,
    compressor: Mutex<Option<Arc<dyn Compressor>>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ConnState {
    fn send(&self, stream_id: i16, response: &Response) {
        let compressor = self.compressor.lock().clone();
        if let Ok(frame) = encode_response(stream_id, response, &[], compressor.as_deref()) {
            let _ = self.tx.send(frame);
        }
    }
}

struct NodeInner {
    config: NodeConfig,
    addr: SocketAddr,
    shard_port: Option<u16>,
    next_shard: AtomicU32,
    connections: AtomicUsize,
    /// Shards of every accepted connection, in accept order
    accepted_shards: Mutex<Vec<u32>>,
    /// User statements (QUERY text or EXECUTE'd statement text) and the
    /// shard that served them
    statements: Mutex<Vec<(String, u32)>>,
    /// Values bound to each user statement, as decoded off the wire
    bound: Mutex<Vec<(String, Vec<Value>)>>,
    prepared: Mutex<HashMap<Vec<u8>, String>>,
    prepare_count: AtomicUsize,
    errors: Mutex<VecDeque<CqlError>>,
    listeners: Mutex<Vec<Arc<ConnState>>>,
    kill: watch::Sender<u64>,
}

/// A scripted CQL node on 127.0.0.1
pub struct FakeNode {
    inner: Arc<NodeInner>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeNode {
    pub async fn start(config: NodeConfig) -> Self {
        Self::start_on("127.0.0.1:0".parse().unwrap(), config).await
    }

    pub async fn start_on(bind: SocketAddr, config: NodeConfig) -> Self {
        let listener = TcpListener::bind(bind).await.expect("bind fake node");
        let addr = listener.local_addr().unwrap();
        let shard_listener = if config.shard_aware_port {
            Some(
                TcpListener::bind(SocketAddr::new(addr.ip(), 0))
                    .await
                    .expect("bind shard-aware port"),
            )
        } else {
            None
        };
        let shard_port = shard_listener
            .as_ref()
            .map(|l| l.local_addr().unwrap().port());

        let (kill, _) = watch::channel(0);
        let inner = Arc::new(NodeInner {
            config,
            addr,
            shard_port,
            next_shard: AtomicU32::new(0),
            connections: AtomicUsize::new(0),
            accepted_shards: Mutex::new(Vec::new()),
            statements: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            prepared: Mutex::new(HashMap::new()),
            prepare_count: AtomicUsize::new(0),
            errors: Mutex::new(VecDeque::new()),
            listeners: Mutex::new(Vec::new()),
            kill,
        });

        let mut tasks = vec![tokio::spawn(accept_loop(listener, inner.clone(), false))];
        if let Some(listener) = shard_listener {
            tasks.push(tokio::spawn(accept_loop(listener, inner.clone(), true)));
        }
        Self { inner, tasks }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn host(&self) -> String {
        self.inner.addr.to_string()
    }

    pub fn shard_aware_port(&self) -> Option<u16> {
        self.inner.shard_port
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub fn accepted_shards(&self) -> Vec<u32> {
        self.inner.accepted_shards.lock().clone()
    }

    pub fn statements(&self) -> Vec<(String, u32)> {
        self.inner.statements.lock().clone()
    }

    /// Values of the last user statement with this text
    pub fn bound_values(&self, text: &str) -> Option<Vec<Value>> {
        self.inner
            .bound
            .lock()
            .iter()
            .rev()
            .find(|(t, _)| t == text)
            .map(|(_, values)| values.clone())
    }

    pub fn prepare_count(&self) -> usize {
        self.inner.prepare_count.load(Ordering::SeqCst)
    }

    /// Fail the next user statements with these errors, in order
    pub fn inject_errors(&self, errors: impl IntoIterator<Item = CqlError>) {
        self.inner.errors.lock().extend(errors);
    }

    /// Drop every prepared statement, as after a restart
    pub fn forget_prepared(&self) {
        self.inner.prepared.lock().clear();
    }

    /// Push an EVENT to every connection that registered for events
    pub fn push_event(&self, event: Event) {
        let response = Response::Event(event);
        for conn in self.inner.listeners.lock().iter() {
            conn.send(-1, &response);
        }
    }

    /// Close every open connection; the node keeps accepting new ones
    pub fn disconnect_all(&self) {
        self.inner.listeners.lock().clear();
        self.inner.kill.send_modify(|generation| *generation += 1);
    }

    /// Stop accepting and close every connection
    pub fn stop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.disconnect_all();
    }
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(listener: TcpListener, node: Arc<NodeInner>, shard_aware: bool) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(_) => return,
        };
        let nr_shards = node.config.nr_shards.max(1);
        let shard = if shard_aware {
            peer.port() as u32 % nr_shards
        } else {
            node.next_shard.fetch_add(1, Ordering::SeqCst) % nr_shards
        };
        node.connections.fetch_add(1, Ordering::SeqCst);
        node.accepted_shards.lock().push(shard);
        tokio::spawn(serve(stream, shard, node.clone()));
    }
}

async fn serve(stream: TcpStream, shard: u32, node: Arc<NodeInner>) {
    let _ = stream.set_nodelay(true);
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let conn = Arc::new(ConnState {
        shard,
        compressor: Mutex::new(None),
        tx,
    });

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut kill = node.kill.subscribe();
    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader) => frame,
            _ = kill.changed() => break,
        };
        let Ok((header, body)) = frame else { break };
        let compressor = conn.compressor.lock().clone();
        let Ok((request, _)) = decode_request(&header, body, compressor.as_deref()) else {
            break;
        };
        let stream_id = header.stream_id;
        let node = node.clone();
        let conn = conn.clone();
        tokio::spawn(async move {
            let response = respond(&node, &conn, request).await;
            conn.send(stream_id, &response);
        });
    }
    writer_task.abort();
}

async fn respond(node: &NodeInner, conn: &Arc<ConnState>, request: Request) -> Response {
    match request {
        Request::Options => Response::Supported(supported(node, conn.shard)),
        Request::Startup(startup) => {
            if let Some(name) = startup.option("COMPRESSION") {
                match compressor_by_name(name) {
                    Ok(c) => *conn.compressor.lock() = Some(c),
                    Err(_) => {
                        return Response::Error(CqlError::new(
                            ErrorCode::Protocol,
                            format!("unknown compression {}", name),
                        ))
                    }
                }
            }
            match node.config.credentials {
                Some(_) => Response::Authenticate(PASSWORD_AUTHENTICATOR.to_string()),
                None => Response::Ready,
            }
        }
        Request::AuthResponse(token) => {
            let expected = node.config.credentials.as_ref().map(|(user, pass)| {
                let mut token = vec![0u8];
                token.extend_from_slice(user.as_bytes());
                token.push(0);
                token.extend_from_slice(pass.as_bytes());
                token
            });
            if token.is_some() && token == expected {
                Response::AuthSuccess(None)
            } else {
                Response::Error(CqlError::new(
                    ErrorCode::Credentials,
                    "Provided username and/or password are incorrect",
                ))
            }
        }
        Request::Register(_) => {
            node.listeners.lock().push(conn.clone());
            Response::Ready
        }
        Request::Query(statement) => {
            let text = statement.content;
            if text.contains("system.local") {
                return Response::Result(local_rows(node));
            }
            if text.contains("system.peers") {
                return Response::Result(peer_rows(node));
            }
            if text.contains("system_schema.keyspaces") {
                return Response::Result(keyspace_rows(node));
            }
            user_statement(node, conn.shard, text, statement.params.values).await
        }
        Request::Prepare(text) => {
            node.prepare_count.fetch_add(1, Ordering::SeqCst);
            let id = Token::of(text.as_bytes()).value().to_be_bytes().to_vec();
            node.prepared.lock().insert(id.clone(), text);
            Response::Result(QueryResult::Prepared(Prepared {
                id,
                metadata: PreparedMetadata {
                    pk_indexes: vec![0],
                    columns: vec![column_spec("ks", "t", "pk", ColumnType::Blob)],
                },
                result_metadata: ResultMetadata {
                    columns_count: 1,
                    paging_state: None,
                    columns: vec![column_spec("ks", "t", "shard", ColumnType::Int)],
                },
            }))
        }
        Request::Execute(execute) => {
            let text = node.prepared.lock().get(&execute.id).cloned();
            match text {
                Some(text) => user_statement(node, conn.shard, text, execute.params.values).await,
                None => Response::Error(
                    CqlError::new(ErrorCode::Unprepared, "Prepared statement not found")
                        .with_details(ErrorDetails::Unprepared { id: execute.id }),
                ),
            }
        }
        Request::Batch(_) => {
            user_statement(node, conn.shard, "BATCH".to_string(), Vec::new()).await
        }
    }
}

/// `SLEEP <ms> ...` delays the reply; anything else answers at once with
/// the serving shard
async fn user_statement(
    node: &NodeInner,
    shard: u32,
    text: String,
    values: Vec<Value>,
) -> Response {
    node.statements.lock().push((text.clone(), shard));
    node.bound.lock().push((text.clone(), values));
    if let Some(error) = node.errors.lock().pop_front() {
        return Response::Error(error);
    }
    if let Some(ms) = text
        .strip_prefix("SLEEP ")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|ms| ms.parse::<u64>().ok())
    {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
    if text.starts_with("INSERT") || text == "BATCH" {
        return Response::Result(QueryResult::Void);
    }
    Response::Result(rows(
        "t",
        &[("shard", ColumnType::Int), ("statement", ColumnType::Text)],
        vec![vec![
            Some(CqlValue::Int(shard as i32)),
            Some(CqlValue::Text(text)),
        ]],
    ))
}

fn supported(node: &NodeInner, shard: u32) -> HashMap<String, Vec<String>> {
    let mut options = HashMap::new();
    options.insert("CQL_VERSION".to_string(), vec!["3.0.0".to_string()]);
    options.insert("COMPRESSION".to_string(), node.config.compression.clone());
    if node.config.nr_shards > 1 {
        options.insert("SCYLLA_SHARD".to_string(), vec![shard.to_string()]);
        options.insert(
            "SCYLLA_NR_SHARDS".to_string(),
            vec![node.config.nr_shards.to_string()],
        );
        options.insert(
            "SCYLLA_SHARDING_IGNORE_MSB".to_string(),
            vec![node.config.msb_ignore.to_string()],
        );
        options.insert(
            "SCYLLA_SHARDING_ALGORITHM".to_string(),
            vec!["biased-token-round-robin".to_string()],
        );
        if let Some(port) = node.shard_port {
            options.insert("SCYLLA_SHARD_AWARE_PORT".to_string(), vec![port.to_string()]);
        }
    }
    options
}

pub fn column_spec(keyspace: &str, table: &str, name: &str, ty: ColumnType) -> ColumnSpec {
    ColumnSpec {
        keyspace: keyspace.to_string(),
        table: table.to_string(),
        name: name.to_string(),
        ty,
    }
}

pub fn rows(
    table: &str,
    columns: &[(&str, ColumnType)],
    values: Vec<Vec<Option<CqlValue>>>,
) -> QueryResult {
    let columns: Vec<ColumnSpec> = columns
        .iter()
        .map(|(name, ty)| column_spec("system", table, name, ty.clone()))
        .collect();
    QueryResult::Rows(Rows {
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
    })
}

fn token_set(tokens: &[i64]) -> CqlValue {
    CqlValue::set(tokens.iter().map(|t| t.to_string()))
}

fn text_set_type() -> ColumnType {
    ColumnType::Set(Box::new(ColumnType::Text))
}

fn local_rows(node: &NodeInner) -> QueryResult {
    rows(
        "local",
        &[
            ("data_center", ColumnType::Text),
            ("rack", ColumnType::Text),
            ("host_id", ColumnType::Uuid),
            ("tokens", text_set_type()),
        ],
        vec![vec![
            Some(CqlValue::Text(node.config.datacenter.clone())),
            Some(CqlValue::Text(node.config.rack.clone())),
            Some(CqlValue::Uuid(uuid::Uuid::new_v4())),
            Some(token_set(&node.config.tokens)),
        ]],
    )
}

fn peer_rows(node: &NodeInner) -> QueryResult {
    rows(
        "peers",
        &[
            ("peer", ColumnType::Inet),
            ("rpc_address", ColumnType::Inet),
            ("data_center", ColumnType::Text),
            ("rack", ColumnType::Text),
            ("host_id", ColumnType::Uuid),
            ("tokens", text_set_type()),
        ],
        node.config
            .peers
            .iter()
            .map(|peer| {
                vec![
                    Some(CqlValue::Inet(peer.ip)),
                    Some(CqlValue::Inet(peer.ip)),
                    Some(CqlValue::Text(peer.datacenter.clone())),
                    Some(CqlValue::Text(peer.rack.clone())),
                    Some(CqlValue::Uuid(uuid::Uuid::new_v4())),
                    Some(token_set(&peer.tokens)),
                ]
            })
            .collect(),
    )
}

fn keyspace_rows(node: &NodeInner) -> QueryResult {
    rows(
        "keyspaces",
        &[
            ("keyspace_name", ColumnType::Text),
            ("durable_writes", ColumnType::Boolean),
            (
                "replication",
                ColumnType::Map(Box::new(ColumnType::Text), Box::new(ColumnType::Text)),
            ),
        ],
        node.config
            .keyspaces
            .iter()
            .map(|(name, options)| {
                vec![
                    Some(CqlValue::Text(name.clone())),
                    Some(CqlValue::Boolean(true)),
                    Some(CqlValue::Map(
                        options
                            .iter()
                            .map(|(k, v)| (CqlValue::Text(k.clone()), CqlValue::Text(v.clone())))
                            .collect(),
                    )),
                ]
            })
            .collect(),
    )
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Values distinct from each other
pub fn distinct<T: std::hash::Hash + Eq>(items: impl IntoIterator<Item = T>) -> usize {
    items.into_iter().collect::<HashSet<_>>().len()
}
