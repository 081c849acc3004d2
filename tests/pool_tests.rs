//! Pool Integration Tests
//!
//! Per-node pools against the scripted node: one connection per shard,
//! through the shard-aware port or by round-robin luck on the main port,
//! token routing to the owning shard, refill and close.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{distinct, init_tracing, wait_until, FakeNode, NodeConfig};
use cqlshard::config::ConnectionConfig;
use cqlshard::frame::{Consistency, Statement};
use cqlshard::transport::{ConnPool, TcpConnector};
use cqlshard::Token;

const FILL_TIMEOUT: Duration = Duration::from_secs(10);

fn pool(node: &FakeNode) -> ConnPool {
    ConnPool::new(
        node.addr(),
        Arc::new(TcpConnector::default()),
        ConnectionConfig::default(),
        Duration::from_millis(50),
    )
}

fn shards(pool: &ConnPool) -> Vec<u32> {
    pool.connections()
        .iter()
        .map(|c| c.shard_info().map_or(0, |i| i.shard))
        .collect()
}

// ============================================================================
// Filling
// ============================================================================

#[tokio::test]
async fn test_fill_through_shard_aware_port() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::sharded(4, true)).await;
    let pool = pool(&node);

    assert!(pool.wait_until_full(FILL_TIMEOUT).await);
    assert_eq!(pool.nr_shards(), 4);
    assert_eq!(pool.len(), 4);
    assert_eq!(shards(&pool), vec![0, 1, 2, 3]);

    // One discovery connection, then exactly one per missing shard
    assert_eq!(node.connections(), 4);
    assert_eq!(distinct(node.accepted_shards()), 4);
    pool.close();
}

#[tokio::test]
async fn test_fill_without_shard_aware_port() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::sharded(3, false)).await;
    let pool = pool(&node);

    assert!(pool.wait_until_full(FILL_TIMEOUT).await);
    assert_eq!(pool.nr_shards(), 3);
    assert_eq!(shards(&pool), vec![0, 1, 2]);
    assert!(node.connections() >= 3);
    pool.close();
}

#[tokio::test]
async fn test_single_shard_node() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::default()).await;
    let pool = pool(&node);

    assert!(pool.wait_until_full(FILL_TIMEOUT).await);
    assert_eq!(pool.nr_shards(), 1);
    assert_eq!(pool.len(), 1);
    assert!(pool.conn(Some(Token::of(b"key"))).is_ok());
    assert!(pool.conn(None).is_ok());
    pool.close();
}

// ============================================================================
// Routing
// ============================================================================

#[tokio::test]
async fn test_token_routes_to_owner_shard() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::sharded(4, true)).await;
    let pool = pool(&node);
    assert!(pool.wait_until_full(FILL_TIMEOUT).await);
    let sharder = pool.sharder();

    for i in 0..32 {
        let key = format!("key-{}", i);
        let token = Token::of(key.as_bytes());
        let conn = pool.conn(Some(token)).unwrap();
        assert_eq!(conn.shard_info().unwrap().shard, sharder.shard_of(token));

        conn.query(&Statement::new(key.clone(), Consistency::One))
            .await
            .unwrap();
    }

    // The node saw every statement on the shard owning its key
    for (text, shard) in node.statements() {
        assert_eq!(shard, sharder.shard_of(Token::of(text.as_bytes())), "{}", text);
    }
    pool.close();
}

#[tokio::test]
async fn test_empty_pool_has_no_connection() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::default()).await;
    let pool = pool(&node);
    pool.close();

    assert!(pool.is_empty());
    assert!(pool.conn(None).is_err());
    assert!(pool.least_busy_conn().is_err());
}

// ============================================================================
// Refill and close
// ============================================================================

#[tokio::test]
async fn test_refill_after_disconnect() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::sharded(4, true)).await;
    let pool = pool(&node);
    assert!(pool.wait_until_full(FILL_TIMEOUT).await);
    let before = node.connections();

    node.disconnect_all();

    assert!(
        wait_until(FILL_TIMEOUT, || {
            node.connections() >= before + 4
                && pool.is_full()
                && pool.connections().iter().all(|c| !c.is_closed())
        })
        .await
    );
    assert_eq!(shards(&pool), vec![0, 1, 2, 3]);
    pool.close();
}

#[tokio::test]
async fn test_refill_waits_for_node() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::default()).await;
    let addr = node.addr();
    drop(node);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool = ConnPool::new(
        addr,
        Arc::new(TcpConnector::default()),
        ConnectionConfig::default(),
        Duration::from_millis(50),
    );
    assert!(!pool.wait_for_connections(1, Duration::from_millis(300)).await);
    assert!(pool.is_empty());
    pool.close();
}

#[tokio::test]
async fn test_close_stops_refill() {
    init_tracing();
    let node = FakeNode::start(NodeConfig::sharded(2, true)).await;
    let pool = pool(&node);
    assert!(pool.wait_until_full(FILL_TIMEOUT).await);
    let conns = pool.connections();

    pool.close();
    for conn in &conns {
        conn.closed().await;
    }
    let after_close = node.connections();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(pool.is_empty());
    assert!(!pool.is_full());
    assert_eq!(node.connections(), after_close);
}
