//! Stream-multiplexed connection to one node
//!
//! A connection owns one byte stream driven by a single IO task that runs a
//! reader and a writer side by side. Callers allocate a stream id, park a
//! oneshot sender under it and hand the encoded frame to the writer; the
//! reader routes each response back by stream id. When the stream breaks,
//! every parked caller is released with the error and close listeners are
//! notified.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use super::shard::ShardInfo;
use super::stream::StreamIdAllocator;
use super::{BoxedStream, Connector};
use crate::config::ConnectionConfig;
use crate::error::{DriverError, DriverResult};
use crate::frame::{
    decode_response, encode_request, Batch, Compressor, Event, EventType, Execute, FrameOptions,
    Header, Prepared, QueryResult, Request, Response, ResponseFrame, Startup, Statement,
    HEADER_SIZE,
};
use crate::metrics::DriverMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
}

/// Sent to close listeners once a connection is closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseNotice {
    pub addr: SocketAddr,
    pub shard: Option<u32>,
}

type ResponseSender = oneshot::Sender<DriverResult<ResponseFrame>>;

struct HandlerMap {
    streams: StreamIdAllocator,
    handlers: HashMap<i16, ResponseSender>,
    closed: bool,
}

struct Shared {
    addr: SocketAddr,
    handlers: Mutex<HandlerMap>,
    in_flight: AtomicUsize,
    state: watch::Sender<ConnectionState>,
    compressor: RwLock<Option<Arc<dyn Compressor>>>,
    shard_info: OnceLock<ShardInfo>,
    close_listeners: Mutex<Vec<mpsc::UnboundedSender<CloseNotice>>>,
    event_sender: Option<mpsc::UnboundedSender<Event>>,
    request_timeout: Option<Duration>,
    metrics: Arc<DriverMetrics>,
}

impl Shared {
    fn register(&self, sender: ResponseSender) -> DriverResult<i16> {
        let mut map = self.handlers.lock();
        if map.closed {
            return Err(DriverError::ConnectionClosed);
        }
        let stream_id = map
            .streams
            .allocate()
            .ok_or(DriverError::StreamsExhausted(map.streams.capacity()))?;
        map.handlers.insert(stream_id, sender);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(stream_id)
    }

    fn take(&self, stream_id: i16) -> Option<ResponseSender> {
        let mut map = self.handlers.lock();
        let handler = map.handlers.remove(&stream_id)?;
        map.streams.free(stream_id);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        Some(handler)
    }

    fn shard(&self) -> Option<u32> {
        self.shard_info.get().map(|info| info.shard)
    }

    /// Release every waiter with `err`, mark the connection closed and
    /// notify close listeners exactly once
    fn fail_all(&self, err: DriverError) {
        let handlers = {
            let mut map = self.handlers.lock();
            map.closed = true;
            for stream_id in map.handlers.keys().copied().collect::<Vec<_>>() {
                map.streams.free(stream_id);
            }
            std::mem::take(&mut map.handlers)
        };
        self.in_flight.store(0, Ordering::Relaxed);
        for (_, handler) in handlers {
            let _ = handler.send(Err(err.clone()));
        }

        let listeners = self.close_listeners.lock();
        let previous = self.state.send_replace(ConnectionState::Closed);
        if previous == ConnectionState::Closed {
            return;
        }
        DriverMetrics::incr(&self.metrics.connections_closed);
        match previous {
            ConnectionState::Closing => tracing::debug!("Connection to {} closed", self.addr),
            _ => tracing::info!("Connection to {} closed: {}", self.addr, err),
        }
        let notice = CloseNotice {
            addr: self.addr,
            shard: self.shard(),
        };
        for listener in listeners.iter() {
            let _ = listener.send(notice);
        }
    }
}

struct ConnectionInner {
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<Vec<u8>>,
    shutdown: watch::Sender<bool>,
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Cheap to clone handle; the IO task stops when the last handle is dropped
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("addr", &self.addr())
            .field("shard", &self.inner.shared.shard())
            .field("state", &self.state())
            .field("in_flight", &self.waiting())
            .finish()
    }
}

/// Read one frame: the nine header bytes and `length` body bytes
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> DriverResult<(Header, Vec<u8>)> {
    let mut head = [0u8; HEADER_SIZE];
    reader.read_exact(&mut head).await?;
    let header = Header::decode(&head);
    header.validate()?;
    let mut body = vec![0u8; header.length as usize];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

async fn reader(mut read_half: impl AsyncRead + Unpin, shared: &Shared) -> DriverResult<()> {
    loop {
        let (header, body) = read_frame(&mut read_half).await?;
        let compressor = shared.compressor.read().clone();
        let decoded = decode_response(&header, body, compressor.as_deref());

        if header.stream_id < 0 {
            match decoded {
                Ok(ResponseFrame {
                    response: Response::Event(event),
                    ..
                }) => {
                    DriverMetrics::incr(&shared.metrics.events_received);
                    tracing::debug!("Event from {}: {:?}", shared.addr, event);
                    if let Some(sender) = &shared.event_sender {
                        let _ = sender.send(event);
                    }
                }
                Ok(other) => tracing::warn!(
                    "Unexpected {} frame on event stream from {}",
                    other.response.opcode(),
                    shared.addr
                ),
                Err(e) => tracing::warn!("Malformed event from {}: {}", shared.addr, e),
            }
            continue;
        }

        tracing::trace!(
            "Received frame for stream {} from {} ({} bytes)",
            header.stream_id,
            shared.addr,
            header.length
        );
        match shared.take(header.stream_id) {
            Some(handler) => {
                // The caller may have given up waiting
                let _ = handler.send(decoded);
            }
            None => tracing::warn!(
                "Response for unknown stream {} from {}",
                header.stream_id,
                shared.addr
            ),
        }
    }
}

async fn writer(
    mut write_half: impl AsyncWrite + Unpin,
    mut frames: mpsc::Receiver<Vec<u8>>,
) -> DriverResult<()> {
    while let Some(mut frame) = frames.recv().await {
        let mut count = 0usize;
        let mut total = 0usize;
        loop {
            write_half.write_all(&frame).await?;
            count += 1;
            total += frame.len();
            frame = match frames.try_recv() {
                Ok(next) => next,
                Err(_) => {
                    // Give concurrent callers a chance to join this flush
                    tokio::task::yield_now().await;
                    match frames.try_recv() {
                        Ok(next) => next,
                        Err(_) => break,
                    }
                }
            };
        }
        tracing::trace!("Flushing {} frames, {} bytes", count, total);
        write_half.flush().await?;
    }
    Ok(())
}

async fn run_io(
    stream: BoxedStream,
    shared: Arc<Shared>,
    frames: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, write_half) = tokio::io::split(stream);
    let result = tokio::select! {
        r = reader(read_half, &shared) => r,
        r = writer(write_half, frames) => r,
        _ = shutdown.wait_for(|stop| *stop) => Ok(()),
    };
    let err = match result {
        Ok(()) => DriverError::ConnectionClosed,
        Err(e) => e,
    };
    shared.fail_all(err);
}

fn unexpected(response: &Response, expected: &str) -> DriverError {
    tracing::warn!("Expected {} but server sent {}", expected, response.opcode());
    DriverError::Protocol(format!(
        "expected {} but received {}",
        expected,
        response.opcode()
    ))
}

fn into_query_result(frame: ResponseFrame) -> DriverResult<QueryResult> {
    match frame.response.into_result()? {
        Response::Result(result) => Ok(result),
        other => Err(unexpected(&other, "RESULT")),
    }
}

impl Connection {
    /// Wrap an established byte stream and start its IO task
    pub fn spawn(addr: SocketAddr, stream: BoxedStream, config: &ConnectionConfig) -> Self {
        let (writer_tx, writer_rx) = mpsc::channel(config.writer_queue_size.max(1));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let shared = Arc::new(Shared {
            addr,
            handlers: Mutex::new(HandlerMap {
                streams: StreamIdAllocator::new(config.max_streams),
                handlers: HashMap::new(),
                closed: false,
            }),
            in_flight: AtomicUsize::new(0),
            state,
            compressor: RwLock::new(None),
            shard_info: OnceLock::new(),
            close_listeners: Mutex::new(Vec::new()),
            event_sender: config.event_sender.clone(),
            request_timeout: config.request_timeout,
            metrics: config.metrics.clone(),
        });

        tokio::spawn(run_io(stream, shared.clone(), writer_rx, shutdown_rx));

        Self {
            inner: Arc::new(ConnectionInner {
                shared,
                writer_tx,
                shutdown,
            }),
        }
    }

    /// Connect and run the OPTIONS / STARTUP / AUTH handshake
    pub async fn open(
        addr: SocketAddr,
        source_port: Option<u16>,
        connector: &dyn Connector,
        config: &ConnectionConfig,
    ) -> DriverResult<Self> {
        let stream = connector.connect(addr, source_port).await?;
        let connection = Self::spawn(addr, stream, config);
        connection.set_state(ConnectionState::Handshaking);

        let handshake = tokio::time::timeout(config.connect_timeout, connection.handshake(config));
        match handshake.await {
            Ok(Ok(())) => Ok(connection),
            Ok(Err(e)) => {
                connection.close();
                Err(e)
            }
            Err(_) => {
                connection.close();
                Err(DriverError::Timeout(config.connect_timeout))
            }
        }
    }

    async fn handshake(&self, config: &ConnectionConfig) -> DriverResult<()> {
        let supported = self.options().await?;
        if let Some(info) = ShardInfo::from_supported(&supported)? {
            let _ = self.inner.shared.shard_info.set(info);
        }

        let offered = supported.get("COMPRESSION");
        let compression = config.compression.as_ref().filter(|c| {
            offered.is_some_and(|names| names.iter().any(|n| n.eq_ignore_ascii_case(c.name())))
        });
        if let (Some(requested), None) = (&config.compression, compression) {
            tracing::warn!(
                "{} does not support {} compression, continuing uncompressed",
                self.addr(),
                requested.name()
            );
        }

        let startup = Startup::new(compression.map(|c| c.name()));
        // Frames after STARTUP may be compressed; STARTUP itself never is
        if let Some(c) = compression {
            *self.inner.shared.compressor.write() = Some(c.clone());
        }
        let frame = self
            .send(&Request::Startup(startup), &FrameOptions::default(), false)
            .await?;
        match frame.response {
            Response::Ready => {}
            Response::Authenticate(class) => self.authenticate(&class, config).await?,
            Response::Error(err) => return Err(DriverError::Server(err)),
            other => return Err(unexpected(&other, "READY or AUTHENTICATE")),
        }

        self.set_state(ConnectionState::Ready);
        DriverMetrics::incr(&config.metrics.connections_opened);
        tracing::info!(
            "Connected to {} (shard {:?}, compression {:?})",
            self.addr(),
            self.inner.shared.shard(),
            compression.map(|c| c.name())
        );
        Ok(())
    }

    async fn authenticate(&self, class: &str, config: &ConnectionConfig) -> DriverResult<()> {
        let authenticator = config.authenticator.as_ref().ok_or_else(|| {
            DriverError::Auth(format!(
                "{} requires authentication with {} but no credentials are configured",
                self.addr(),
                class
            ))
        })?;
        tracing::debug!("Authenticating to {} with {}", self.addr(), class);

        let mut token = authenticator.initial_response(class)?;
        loop {
            let frame = self
                .request(&Request::AuthResponse(token), &FrameOptions::default())
                .await?;
            match frame.response {
                Response::AuthChallenge(challenge) => {
                    token = authenticator.evaluate_challenge(challenge.as_deref())?;
                }
                Response::AuthSuccess(final_token) => {
                    return authenticator.on_success(final_token.as_deref());
                }
                Response::Error(err) => return Err(DriverError::Auth(err.to_string())),
                other => return Err(unexpected(&other, "AUTH_CHALLENGE or AUTH_SUCCESS")),
            }
        }
    }

    async fn send(
        &self,
        request: &Request,
        options: &FrameOptions,
        compress: bool,
    ) -> DriverResult<ResponseFrame> {
        let shared = &self.inner.shared;
        // Queue space is reserved before a stream id is taken, so a caller
        // dropped while the queue is full holds no stream id
        let permit = self
            .inner
            .writer_tx
            .reserve()
            .await
            .map_err(|_| DriverError::ConnectionClosed)?;
        let (tx, rx) = oneshot::channel();
        let stream_id = shared.register(tx)?;

        let compressor = if compress {
            shared.compressor.read().clone()
        } else {
            None
        };
        let frame = match encode_request(stream_id, request, options, compressor.as_deref()) {
            Ok(frame) => frame,
            Err(e) => {
                shared.take(stream_id);
                return Err(e);
            }
        };
        permit.send(frame);

        // On timeout the stream stays reserved until its response arrives or
        // the connection closes
        let received = match shared.request_timeout {
            Some(limit) => tokio::time::timeout(limit, rx)
                .await
                .map_err(|_| DriverError::Timeout(limit))?,
            None => rx.await,
        };
        let frame = received.map_err(|_| DriverError::ConnectionClosed)??;
        for warning in &frame.warnings {
            tracing::warn!("Server warning from {}: {}", shared.addr, warning);
        }
        Ok(frame)
    }

    /// Send any request and wait for its response frame
    pub async fn request(
        &self,
        request: &Request,
        options: &FrameOptions,
    ) -> DriverResult<ResponseFrame> {
        self.send(request, options, true).await
    }

    pub async fn options(&self) -> DriverResult<HashMap<String, Vec<String>>> {
        let frame = self
            .send(&Request::Options, &FrameOptions::default(), false)
            .await?;
        match frame.response.into_result()? {
            Response::Supported(options) => Ok(options),
            other => Err(unexpected(&other, "SUPPORTED")),
        }
    }

    pub async fn query(&self, statement: &Statement) -> DriverResult<QueryResult> {
        let frame = self
            .request(&Request::Query(statement.clone()), &FrameOptions::default())
            .await?;
        into_query_result(frame)
    }

    pub async fn execute(&self, execute: &Execute) -> DriverResult<QueryResult> {
        let frame = self
            .request(&Request::Execute(execute.clone()), &FrameOptions::default())
            .await?;
        into_query_result(frame)
    }

    pub async fn prepare(&self, query: &str) -> DriverResult<Prepared> {
        let frame = self
            .request(&Request::Prepare(query.to_string()), &FrameOptions::default())
            .await?;
        match into_query_result(frame)? {
            QueryResult::Prepared(prepared) => Ok(prepared),
            other => Err(DriverError::Protocol(format!(
                "expected a prepared result, got {:?}",
                other
            ))),
        }
    }

    pub async fn batch(&self, batch: &Batch) -> DriverResult<QueryResult> {
        let frame = self
            .request(&Request::Batch(batch.clone()), &FrameOptions::default())
            .await?;
        into_query_result(frame)
    }

    /// Subscribe this connection to server events
    pub async fn register(&self, events: &[EventType]) -> DriverResult<()> {
        let frame = self
            .request(&Request::Register(events.to_vec()), &FrameOptions::default())
            .await?;
        match frame.response.into_result()? {
            Response::Ready => Ok(()),
            other => Err(unexpected(&other, "READY")),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.shared.addr
    }

    pub fn shard_info(&self) -> Option<ShardInfo> {
        self.inner.shared.shard_info.get().copied()
    }

    /// Requests currently waiting for a response
    pub fn waiting(&self) -> usize {
        self.inner.shared.in_flight.load(Ordering::Relaxed)
    }

    pub fn max_streams(&self) -> usize {
        self.inner.shared.handlers.lock().streams.capacity()
    }

    pub fn is_heavily_loaded(&self) -> bool {
        self.waiting() > self.max_streams() / 2
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.shared.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Closing | ConnectionState::Closed
        )
    }

    /// Register a listener that receives one notice when this connection
    /// closes; fires immediately if it already has
    pub fn notify_on_close(&self, listener: mpsc::UnboundedSender<CloseNotice>) {
        let shared = &self.inner.shared;
        let mut listeners = shared.close_listeners.lock();
        if *shared.state.borrow() == ConnectionState::Closed {
            let _ = listener.send(CloseNotice {
                addr: shared.addr,
                shard: shared.shard(),
            });
            return;
        }
        listeners.push(listener);
    }

    /// Wait until the connection is closed
    pub async fn closed(&self) {
        let mut state = self.inner.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Stop the IO task; pending requests fail with `ConnectionClosed`
    pub fn close(&self) {
        self.set_state(ConnectionState::Closing);
        let _ = self.inner.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_response, Consistency, CqlError, ErrorCode};
    use tokio::io::DuplexStream;

    fn test_config(max_streams: usize) -> ConnectionConfig {
        ConnectionConfig {
            max_streams,
            request_timeout: Some(Duration::from_secs(5)),
            ..ConnectionConfig::default()
        }
    }

    fn pair(config: &ConnectionConfig) -> (Connection, DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        (Connection::spawn(addr, Box::new(client), config), server)
    }

    async fn read_request(server: &mut DuplexStream) -> Header {
        let (header, _) = read_frame(server).await.unwrap();
        header
    }

    async fn reply(server: &mut DuplexStream, stream_id: i16, response: &Response) {
        let frame = encode_response(stream_id, response, &[], None).unwrap();
        server.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let config = test_config(128);
        let (conn, mut server) = pair(&config);

        let first = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query(&Statement::new("a", Consistency::One)).await })
        };
        let h1 = read_request(&mut server).await;
        let second = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.prepare("b").await })
        };
        let h2 = read_request(&mut server).await;
        assert_ne!(h1.stream_id, h2.stream_id);
        assert_eq!(conn.waiting(), 2);

        let err = CqlError::new(ErrorCode::Invalid, "bad");
        reply(&mut server, h2.stream_id, &Response::Error(err.clone())).await;
        reply(&mut server, h1.stream_id, &Response::Result(QueryResult::Void)).await;

        assert_eq!(first.await.unwrap().unwrap(), QueryResult::Void);
        let second = second.await.unwrap();
        assert!(matches!(second, Err(DriverError::Server(e)) if e == err));
        assert_eq!(conn.waiting(), 0);
    }

    #[tokio::test]
    async fn test_streams_exhausted_is_backpressure() {
        let config = test_config(2);
        let (conn, mut server) = pair(&config);

        let mut pending = Vec::new();
        for _ in 0..2 {
            let conn = conn.clone();
            pending.push(tokio::spawn(async move {
                conn.query(&Statement::new("x", Consistency::One)).await
            }));
        }
        let h1 = read_request(&mut server).await;
        let h2 = read_request(&mut server).await;

        let err = conn
            .query(&Statement::new("y", Consistency::One))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::StreamsExhausted(2)));
        assert!(conn.is_heavily_loaded());

        reply(&mut server, h1.stream_id, &Response::Result(QueryResult::Void)).await;
        reply(&mut server, h2.stream_id, &Response::Result(QueryResult::Void)).await;
        for task in pending {
            task.await.unwrap().unwrap();
        }
        assert!(!conn.is_heavily_loaded());
    }

    #[tokio::test]
    async fn test_close_releases_waiters_and_notifies() {
        let config = test_config(16);
        let (conn, mut server) = pair(&config);
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.notify_on_close(tx);

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query(&Statement::new("x", Consistency::One)).await })
        };
        read_request(&mut server).await;
        drop(server);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, DriverError::Io(_) | DriverError::ConnectionClosed));
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.addr, conn.addr());
        assert_eq!(conn.waiting(), 0);

        // Late listeners are told right away
        let (tx, mut rx) = mpsc::unbounded_channel();
        conn.notify_on_close(tx);
        assert!(rx.recv().await.is_some());

        let err = conn.prepare("q").await.unwrap_err();
        assert!(matches!(err, DriverError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_timeout_frees_stream_on_late_response() {
        let config = ConnectionConfig {
            request_timeout: Some(Duration::from_millis(50)),
            ..test_config(1)
        };
        let (conn, mut server) = pair(&config);

        let err = conn
            .query(&Statement::new("slow", Consistency::One))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Timeout(_)));
        let header = read_request(&mut server).await;
        assert_eq!(conn.waiting(), 1);

        reply(&mut server, header.stream_id, &Response::Result(QueryResult::Void)).await;
        while conn.waiting() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let next = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query(&Statement::new("next", Consistency::One)).await })
        };
        let header = read_request(&mut server).await;
        reply(&mut server, header.stream_id, &Response::Result(QueryResult::Void)).await;
        assert_eq!(next.await.unwrap().unwrap(), QueryResult::Void);
    }

    #[tokio::test]
    async fn test_events_are_forwarded() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let config = test_config(16).with_event_sender(events_tx);
        let (_conn, mut server) = pair(&config);

        let event = Event::StatusChange {
            status: crate::frame::StatusChange::Down,
            addr: "10.0.0.2:9042".parse().unwrap(),
        };
        reply(&mut server, -1, &Response::Event(event.clone())).await;
        assert_eq!(events_rx.recv().await.unwrap(), event);
        assert_eq!(DriverMetrics::get(&config.metrics.events_received), 1);
    }

    #[tokio::test]
    async fn test_bad_opcode_fails_only_its_stream() {
        let config = test_config(16);
        let (conn, mut server) = pair(&config);

        let broken = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query(&Statement::new("a", Consistency::One)).await })
        };
        let header = read_request(&mut server).await;
        let bogus = Header {
            version: 0x84,
            flags: 0,
            stream_id: header.stream_id,
            opcode: 0x04,
            length: 0,
        };
        server.write_all(&bogus.encode()).await.unwrap();
        assert!(matches!(
            broken.await.unwrap(),
            Err(DriverError::Protocol(_))
        ));

        let healthy = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.query(&Statement::new("b", Consistency::One)).await })
        };
        let header = read_request(&mut server).await;
        reply(&mut server, header.stream_id, &Response::Result(QueryResult::Void)).await;
        assert_eq!(healthy.await.unwrap().unwrap(), QueryResult::Void);
    }

    #[tokio::test]
    async fn test_caller_dropped_on_full_queue_holds_no_stream() {
        let config = ConnectionConfig {
            writer_queue_size: 1,
            ..test_config(3)
        };
        // Smaller than one QUERY frame, so the writer blocks mid-frame
        let (client, mut server) = tokio::io::duplex(16);
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let conn = Connection::spawn(addr, Box::new(client), &config);

        let mut parked = Vec::new();
        for text in ["a", "b"] {
            let task_conn = conn.clone();
            parked.push(tokio::spawn(async move {
                task_conn
                    .query(&Statement::new(text, Consistency::One))
                    .await
            }));
            while conn.waiting() < parked.len() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            conn.query(&Statement::new("c", Consistency::One)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(conn.waiting(), 2);

        for _ in 0..2 {
            let header = read_request(&mut server).await;
            reply(&mut server, header.stream_id, &Response::Result(QueryResult::Void)).await;
        }
        for task in parked {
            assert_eq!(task.await.unwrap().unwrap(), QueryResult::Void);
        }
        assert_eq!(conn.waiting(), 0);
    }
}
