use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::token::Token;
use crate::transport::ConnPool;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeStatus {
    Up,
    Down,
}

/// Row data describing a node, as read from `system.local` / `system.peers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub addr: SocketAddr,
    pub datacenter: String,
    pub rack: String,
    pub host_id: Option<Uuid>,
    pub tokens: Vec<Token>,
}

/// A node of the cluster
///
/// Owned by a topology snapshot. A refresh builds new `Node`s but hands the
/// pool of a surviving node over, so connections outlive snapshots.
#[derive(Debug)]
pub struct Node {
    pub addr: SocketAddr,
    pub datacenter: String,
    pub rack: String,
    pub host_id: Option<Uuid>,
    pub tokens: Vec<Token>,
    up: AtomicBool,
    pool: Option<ConnPool>,
}

impl Node {
    pub fn new(info: PeerInfo, pool: Option<ConnPool>) -> Self {
        Self {
            addr: info.addr,
            datacenter: info.datacenter,
            rack: info.rack,
            host_id: info.host_id,
            tokens: info.tokens,
            up: AtomicBool::new(true),
            pool,
        }
    }

    /// Node without a pool, for topology computations
    pub fn detached(addr: SocketAddr, datacenter: &str, rack: &str, tokens: Vec<Token>) -> Self {
        Self::new(
            PeerInfo {
                addr,
                datacenter: datacenter.to_string(),
                rack: rack.to_string(),
                host_id: None,
                tokens,
            },
            None,
        )
    }

    pub fn pool(&self) -> Option<&ConnPool> {
        self.pool.as_ref()
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn status(&self) -> NodeStatus {
        if self.is_up() {
            NodeStatus::Up
        } else {
            NodeStatus::Down
        }
    }

    /// Returns the previous status
    pub fn set_status(&self, status: NodeStatus) -> NodeStatus {
        let was_up = self.up.swap(status == NodeStatus::Up, Ordering::AcqRel);
        if was_up {
            NodeStatus::Up
        } else {
            NodeStatus::Down
        }
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            addr: self.addr,
            datacenter: self.datacenter.clone(),
            rack: self.rack.clone(),
            host_id: self.host_id,
            tokens: self.tokens.clone(),
        }
    }
}
