//! Host selection policies
//!
//! A policy turns routing information into a [`QueryPlan`]: the ordered
//! nodes a request should be tried on. Plans are finite; once every
//! candidate has been yielded the plan returns `None`.

use std::collections::HashSet;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::node::Node;
use super::token::Token;
use super::topology::Topology;

/// What a request knows about where its data lives
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingInfo {
    pub token: Option<Token>,
    pub keyspace: Option<String>,
}

impl RoutingInfo {
    pub fn new(token: Option<Token>, keyspace: Option<String>) -> Self {
        Self { token, keyspace }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryPlan {
    nodes: Vec<Arc<Node>>,
    pos: usize,
}

impl QueryPlan {
    pub fn new(nodes: Vec<Arc<Node>>) -> Self {
        Self { nodes, pos: 0 }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl Iterator for QueryPlan {
    type Item = Arc<Node>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.nodes.get(self.pos)?.clone();
        self.pos += 1;
        Some(node)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.nodes.len() - self.pos;
        (left, Some(left))
    }
}

impl ExactSizeIterator for QueryPlan {}

pub trait HostSelectionPolicy: Send + Sync + Debug {
    fn plan(&self, routing: &RoutingInfo, topology: &Topology) -> QueryPlan;

    fn name(&self) -> &'static str;
}

/// `nodes` rotated to start at `counter % len`
fn rotated(nodes: Vec<Arc<Node>>, counter: &AtomicUsize) -> Vec<Arc<Node>> {
    if nodes.is_empty() {
        return nodes;
    }
    let start = counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
    let mut nodes = nodes;
    nodes.rotate_left(start);
    nodes
}

/// Every node once per plan; consecutive plans start one node later
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelectionPolicy for RoundRobinPolicy {
    fn plan(&self, _routing: &RoutingInfo, topology: &Topology) -> QueryPlan {
        QueryPlan::new(rotated(topology.nodes().to_vec(), &self.counter))
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Round-robin over the local datacenter, then over the remote ones
#[derive(Debug)]
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    local_counter: AtomicUsize,
    remote_counter: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    pub fn new(local_dc: impl Into<String>) -> Self {
        Self {
            local_dc: local_dc.into(),
            local_counter: AtomicUsize::new(0),
            remote_counter: AtomicUsize::new(0),
        }
    }

    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }
}

impl HostSelectionPolicy for DcAwareRoundRobinPolicy {
    fn plan(&self, _routing: &RoutingInfo, topology: &Topology) -> QueryPlan {
        let (local, remote): (Vec<_>, Vec<_>) = topology
            .nodes()
            .iter()
            .cloned()
            .partition(|n| n.datacenter == self.local_dc);
        let mut nodes = rotated(local, &self.local_counter);
        nodes.extend(rotated(remote, &self.remote_counter));
        QueryPlan::new(nodes)
    }

    fn name(&self) -> &'static str {
        "dc_aware_round_robin"
    }
}

/// Replicas of the routing token first, then the wrapped policy's plan
#[derive(Debug)]
pub struct TokenAwarePolicy {
    fallback: Box<dyn HostSelectionPolicy>,
    local_dc: Option<String>,
}

impl TokenAwarePolicy {
    pub fn new(fallback: Box<dyn HostSelectionPolicy>) -> Self {
        Self {
            fallback,
            local_dc: None,
        }
    }

    /// Local-DC replicas are tried before remote ones
    pub fn with_local_dc(mut self, local_dc: impl Into<String>) -> Self {
        self.local_dc = Some(local_dc.into());
        self
    }

    pub fn fallback(&self) -> &dyn HostSelectionPolicy {
        self.fallback.as_ref()
    }
}

impl HostSelectionPolicy for TokenAwarePolicy {
    fn plan(&self, routing: &RoutingInfo, topology: &Topology) -> QueryPlan {
        let token = match routing.token {
            Some(token) => token,
            None => return self.fallback.plan(routing, topology),
        };

        let mut replicas = topology.replicas(routing.keyspace.as_deref(), token);
        if let Some(local_dc) = &self.local_dc {
            // Stable: ring order is kept inside each group
            replicas.sort_by_key(|n| n.datacenter != *local_dc);
        }

        let seen: HashSet<SocketAddr> = replicas.iter().map(|n| n.addr).collect();
        let rest = self
            .fallback
            .plan(routing, topology)
            .filter(|n| !seen.contains(&n.addr));
        replicas.extend(rest);
        QueryPlan::new(replicas)
    }

    fn name(&self) -> &'static str {
        "token_aware"
    }
}
