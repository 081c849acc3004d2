//! Per-node pool holding one connection per shard
//!
//! The first connection discovers the node's sharding parameters. The
//! remaining shards are then opened through the shard-aware port with a
//! source port chosen so `port % nr_shards` selects the target shard, or,
//! without a shard-aware port, by opening plain connections and keeping the
//! ones that land on an empty shard. A background refiller retries missing
//! shards every `refill_backoff` and refills a slot right after its
//! connection closes.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};

use super::connection::{CloseNotice, Connection};
use super::shard::Sharder;
use super::Connector;
use crate::cluster::token::Token;
use crate::config::ConnectionConfig;
use crate::error::{DriverError, DriverResult};
use crate::metrics::DriverMetrics;

/// Rerouting off a heavily loaded shard only pays when the alternative is
/// at least this much less busy
const LESS_BUSY_RATIO: (usize, usize) = (9, 10);

#[derive(Debug)]
struct Slots {
    sharder: Sharder,
    shard_aware_port: Option<u16>,
    discovered: bool,
    conns: Vec<Option<Connection>>,
}

impl Slots {
    fn filled(&self) -> usize {
        self.conns.iter().filter(|c| c.is_some()).count()
    }

    fn missing(&self) -> Vec<u32> {
        self.conns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_none())
            .map(|(shard, _)| shard as u32)
            .collect()
    }

    fn evict_closed(&mut self) -> usize {
        let mut evicted = 0;
        for slot in self.conns.iter_mut() {
            if slot.as_ref().is_some_and(|c| c.is_closed()) {
                *slot = None;
                evicted += 1;
            }
        }
        evicted
    }
}

struct PoolInner {
    addr: SocketAddr,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    refill_backoff: Duration,
    slots: RwLock<Slots>,
    close_tx: mpsc::UnboundedSender<CloseNotice>,
    filled: watch::Sender<usize>,
    shutdown: watch::Sender<bool>,
    metrics: Arc<DriverMetrics>,
}

/// Connections to every shard of one node
#[derive(Clone)]
pub struct ConnPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slots = self.inner.slots.read();
        f.debug_struct("ConnPool")
            .field("addr", &self.inner.addr)
            .field("nr_shards", &slots.sharder.nr_shards())
            .field("filled", &slots.filled())
            .finish()
    }
}

impl ConnPool {
    /// Create the pool and start its refiller; connections open in the
    /// background
    pub fn new(
        addr: SocketAddr,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        refill_backoff: Duration,
    ) -> Self {
        let (close_tx, close_rx) = mpsc::unbounded_channel();
        let (filled, _) = watch::channel(0);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let metrics = config.metrics.clone();
        let inner = Arc::new(PoolInner {
            addr,
            connector,
            config,
            refill_backoff,
            slots: RwLock::new(Slots {
                sharder: Sharder::single(),
                shard_aware_port: None,
                discovered: false,
                conns: vec![None],
            }),
            close_tx,
            filled,
            shutdown,
            metrics,
        });

        tokio::spawn(refiller(Arc::downgrade(&inner), close_rx, shutdown_rx));
        Self { inner }
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn nr_shards(&self) -> u32 {
        self.inner.slots.read().sharder.nr_shards()
    }

    pub fn sharder(&self) -> Sharder {
        self.inner.slots.read().sharder
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.inner.slots.read().filled()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether every shard has a connection
    pub fn is_full(&self) -> bool {
        let slots = self.inner.slots.read();
        slots.discovered && slots.filled() == slots.conns.len()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .slots
            .read()
            .conns
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Wait until at least `count` connections are open
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let mut filled = self.inner.filled.subscribe();
        tokio::time::timeout(timeout, filled.wait_for(|n| *n >= count))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Wait until every shard has a connection
    pub async fn wait_until_full(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut filled = self.inner.filled.subscribe();
        loop {
            if self.is_full() {
                return true;
            }
            if tokio::time::timeout_at(deadline, filled.changed())
                .await
                .map_or(true, |r| r.is_err())
            {
                return self.is_full();
            }
        }
    }

    /// Connection for the shard owning `token`, or the least busy one
    pub fn conn(&self, token: Option<Token>) -> DriverResult<Connection> {
        let slots = self.inner.slots.read();
        let token = match token {
            Some(token) => token,
            None => return least_busy(&slots.conns, self.inner.addr),
        };
        let shard = slots.sharder.shard_of(token) as usize;
        let owner = slots
            .conns
            .get(shard)
            .and_then(|slot| slot.as_ref())
            .filter(|c| !c.is_closed());
        match owner {
            None => least_busy(&slots.conns, self.inner.addr),
            Some(conn) if conn.is_heavily_loaded() => {
                let (num, den) = LESS_BUSY_RATIO;
                match least_busy(&slots.conns, self.inner.addr) {
                    Ok(alt) if alt.waiting() < conn.waiting() * num / den => {
                        DriverMetrics::incr(&self.inner.metrics.less_busy_reroutes);
                        tracing::trace!(
                            "Shard {} of {} is busy, using shard {:?}",
                            shard,
                            self.inner.addr,
                            alt.shard_info().map(|i| i.shard)
                        );
                        Ok(alt)
                    }
                    _ => Ok(conn.clone()),
                }
            }
            Some(conn) => Ok(conn.clone()),
        }
    }

    pub fn least_busy_conn(&self) -> DriverResult<Connection> {
        least_busy(&self.inner.slots.read().conns, self.inner.addr)
    }

    /// Stop the refiller and close every connection
    pub fn close(&self) {
        self.inner.shutdown.send_replace(true);
        let conns: Vec<Connection> = {
            let mut slots = self.inner.slots.write();
            slots.conns.iter_mut().filter_map(Option::take).collect()
        };
        for conn in &conns {
            conn.close();
        }
        self.inner.filled.send_replace(0);
        tracing::debug!("Closed pool to {} ({} connections)", self.inner.addr, conns.len());
    }
}

fn least_busy(conns: &[Option<Connection>], addr: SocketAddr) -> DriverResult<Connection> {
    conns
        .iter()
        .flatten()
        .filter(|c| !c.is_closed())
        .min_by_key(|c| c.waiting())
        .cloned()
        .ok_or(DriverError::NoConnection(addr))
}

impl PoolInner {
    fn publish_filled(&self) {
        let filled = self.slots.read().filled();
        self.filled.send_replace(filled);
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn open(&self, addr: SocketAddr, source_port: Option<u16>) -> DriverResult<Connection> {
        let conn =
            Connection::open(addr, source_port, self.connector.as_ref(), &self.config).await?;
        conn.notify_on_close(self.close_tx.clone());
        Ok(conn)
    }

    /// Open a connection meant to land on `shard`
    async fn open_for_shard(&self, shard: u32) -> DriverResult<Connection> {
        let (sharder, port) = {
            let slots = self.slots.read();
            (slots.sharder, slots.shard_aware_port)
        };
        let port = match port {
            Some(port) => port,
            None => return self.open(self.addr, None).await,
        };

        let target = SocketAddr::new(self.addr.ip(), port);
        for source_port in sharder.source_ports_for(shard) {
            match self.open(target, Some(source_port)).await {
                Err(DriverError::SourcePortUnavailable(_)) => continue,
                result => return result,
            }
        }
        Err(DriverError::NoConnection(target))
    }

    /// Put a new connection into its shard's slot; returns false if the slot
    /// was already taken
    fn place(&self, conn: Connection) -> bool {
        let shard = conn.shard_info().map_or(0, |info| info.shard) as usize;
        let placed = !self.is_shutdown() && {
            let mut slots = self.slots.write();
            match slots.conns.get_mut(shard) {
                Some(slot) if slot.is_none() => {
                    *slot = Some(conn.clone());
                    true
                }
                _ => false,
            }
        };
        if !placed {
            tracing::trace!("Shard {} of {} already connected", shard, self.addr);
            conn.close();
        }
        placed
    }

    async fn discover(&self) -> DriverResult<()> {
        let conn = self.open(self.addr, None).await?;
        let info = conn.shard_info();
        {
            let mut slots = self.slots.write();
            slots.sharder = info.map_or_else(Sharder::single, |i| i.sharder());
            slots.shard_aware_port = info.and_then(|i| i.shard_aware_port);
            slots.conns = vec![None; slots.sharder.nr_shards() as usize];
            slots.discovered = true;
        }
        tracing::info!(
            "Node {} has {} shards (shard-aware port {:?})",
            self.addr,
            info.map_or(1, |i| i.nr_shards),
            info.and_then(|i| i.shard_aware_port)
        );
        self.place(conn);
        Ok(())
    }

    /// One pass over the missing shards; returns true when the pool is full
    async fn fill(&self) -> bool {
        let evicted = self.slots.write().evict_closed();
        if evicted > 0 {
            self.publish_filled();
        }

        if !self.slots.read().discovered {
            if let Err(e) = self.discover().await {
                DriverMetrics::incr(&self.metrics.refill_failures);
                tracing::warn!("Failed to connect to {}: {}", self.addr, e);
                return false;
            }
            self.publish_filled();
        }

        // Plain connections land on a shard of the server's choosing, so
        // without a shard-aware port a few extra rounds are needed
        let rounds = if self.slots.read().shard_aware_port.is_some() {
            1
        } else {
            4
        };
        let mut failed = false;
        for _ in 0..rounds {
            let missing = self.slots.read().missing();
            if missing.is_empty() || failed {
                break;
            }
            for shard in missing {
                if self.is_shutdown() {
                    return false;
                }
                match self.open_for_shard(shard).await {
                    Ok(conn) => {
                        self.place(conn);
                        self.publish_filled();
                    }
                    Err(e) => {
                        failed = true;
                        DriverMetrics::incr(&self.metrics.refill_failures);
                        tracing::warn!(
                            "Failed to open connection to shard {} of {}: {}",
                            shard,
                            self.addr,
                            e
                        );
                    }
                }
            }
        }
        let slots = self.slots.read();
        slots.filled() == slots.conns.len()
    }
}

async fn refiller(
    pool: Weak<PoolInner>,
    mut close_rx: mpsc::UnboundedReceiver<CloseNotice>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (full, backoff) = match pool.upgrade() {
            Some(inner) if !inner.is_shutdown() => (inner.fill().await, inner.refill_backoff),
            _ => return,
        };

        if full {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return,
                notice = close_rx.recv() => match notice {
                    Some(notice) => tracing::debug!(
                        "Refilling shard {:?} of {}",
                        notice.shard,
                        notice.addr
                    ),
                    None => return,
                },
            }
        } else {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => return,
                _ = tokio::time::sleep(backoff) => {}
                notice = close_rx.recv() => if notice.is_none() {
                    return;
                },
            }
        }
    }
}
