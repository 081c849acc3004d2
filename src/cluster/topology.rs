//! Immutable snapshot of the cluster: nodes, token ring and keyspaces
//!
//! A refresh builds a whole new `Topology` and swaps it in; readers hold an
//! `Arc` to whichever snapshot was current when they started.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;

use super::keyspace::Keyspace;
use super::node::Node;
use super::ring::Ring;
use super::token::Token;

#[derive(Debug, Default)]
pub struct Topology {
    nodes: Vec<Arc<Node>>,
    index: HashMap<SocketAddr, usize>,
    ring: Ring,
    keyspaces: HashMap<String, Keyspace>,
}

impl Topology {
    /// Nodes keep their given order; a repeated address keeps its first entry
    pub fn new(nodes: Vec<Arc<Node>>, keyspaces: HashMap<String, Keyspace>) -> Self {
        let mut index = HashMap::with_capacity(nodes.len());
        let mut unique = Vec::with_capacity(nodes.len());
        for node in nodes {
            if index.contains_key(&node.addr) {
                continue;
            }
            index.insert(node.addr, unique.len());
            unique.push(node);
        }
        let ring = Ring::new(unique.iter());
        Self {
            nodes: unique,
            index,
            ring,
            keyspaces,
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, addr: SocketAddr) -> Option<&Arc<Node>> {
        self.index.get(&addr).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.index.contains_key(&addr)
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn keyspace(&self, name: &str) -> Option<&Keyspace> {
        self.keyspaces.get(name)
    }

    pub fn keyspaces(&self) -> &HashMap<String, Keyspace> {
        &self.keyspaces
    }

    pub fn datacenters(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.datacenter.as_str()).collect()
    }

    /// Replicas of `token` in placement order
    ///
    /// Without a known keyspace only the primary owner is returned.
    pub fn replicas(&self, keyspace: Option<&str>, token: Token) -> Vec<Arc<Node>> {
        match keyspace.and_then(|name| self.keyspaces.get(name)) {
            Some(ks) => ks.strategy.replicas(&self.ring, token),
            None => self.ring.primary(token).cloned().into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::keyspace::ReplicationStrategy;

    fn node(i: u8, dc: &str, token: i64) -> Arc<Node> {
        Arc::new(Node::detached(
            SocketAddr::new([10, 0, 0, i].into(), 9042),
            dc,
            "r1",
            vec![Token(token)],
        ))
    }

    #[test]
    fn test_topology_lookup_and_replicas() {
        let nodes = vec![
            node(1, "dc1", 0),
            node(2, "dc2", 100),
            node(3, "dc1", 200),
            node(1, "dc1", 300),
        ];
        let mut keyspaces = HashMap::new();
        keyspaces.insert(
            "ks".to_string(),
            Keyspace {
                name: "ks".to_string(),
                strategy: ReplicationStrategy::Simple { rf: 2 },
                durable_writes: true,
            },
        );
        let topology = Topology::new(nodes, keyspaces);

        assert_eq!(topology.len(), 3);
        assert_eq!(topology.ring().len(), 3);
        let addr: SocketAddr = "10.0.0.2:9042".parse().unwrap();
        assert_eq!(topology.node(addr).unwrap().datacenter, "dc2");
        assert!(!topology.contains("10.0.0.9:9042".parse().unwrap()));
        assert_eq!(topology.datacenters().into_iter().collect::<Vec<_>>(), vec!["dc1", "dc2"]);

        let replicas = topology.replicas(Some("ks"), Token(50));
        let addrs: Vec<_> = replicas.iter().map(|n| n.addr.to_string()).collect();
        assert_eq!(addrs, vec!["10.0.0.2:9042", "10.0.0.3:9042"]);

        let primary = topology.replicas(Some("missing"), Token(50));
        assert_eq!(primary.len(), 1);
        assert_eq!(primary[0].addr, addr);
        assert_eq!(topology.replicas(None, Token(50)).len(), 1);
    }

    #[test]
    fn test_empty_topology() {
        let topology = Topology::empty();
        assert!(topology.is_empty());
        assert!(topology.replicas(None, Token(0)).is_empty());
    }
}
