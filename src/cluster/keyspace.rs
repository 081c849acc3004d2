//! Keyspace replication strategies and replica placement

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use super::node::Node;
use super::ring::Ring;
use super::token::Token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationStrategy {
    Simple { rf: usize },
    NetworkTopology { dc_rf: BTreeMap<String, usize> },
    Local,
    Other(String),
}

/// `"3"` or the transient form `"3/1"`; the full replica count is used
fn parse_rf(raw: &str) -> Option<usize> {
    raw.split('/').next()?.trim().parse().ok()
}

impl ReplicationStrategy {
    /// Build from the `replication` map of `system_schema.keyspaces`
    pub fn from_options(options: &HashMap<String, String>) -> Self {
        let class = options.get("class").map(String::as_str).unwrap_or_default();
        let short = class.rsplit('.').next().unwrap_or(class);
        match short {
            "SimpleStrategy" => ReplicationStrategy::Simple {
                rf: options
                    .get("replication_factor")
                    .and_then(|rf| parse_rf(rf))
                    .unwrap_or(1),
            },
            "NetworkTopologyStrategy" => ReplicationStrategy::NetworkTopology {
                dc_rf: options
                    .iter()
                    .filter(|(k, _)| k.as_str() != "class" && k.as_str() != "replication_factor")
                    .filter_map(|(dc, rf)| parse_rf(rf).map(|rf| (dc.clone(), rf)))
                    .collect(),
            },
            "LocalStrategy" | "EverywhereStrategy" => ReplicationStrategy::Local,
            _ => ReplicationStrategy::Other(class.to_string()),
        }
    }

    /// Ordered replicas of `token`, primary first
    pub fn replicas(&self, ring: &Ring, token: Token) -> Vec<Arc<Node>> {
        match self {
            ReplicationStrategy::Simple { rf } => simple_replicas(ring, token, *rf),
            ReplicationStrategy::NetworkTopology { dc_rf } => nts_replicas(ring, token, dc_rf),
            ReplicationStrategy::Local | ReplicationStrategy::Other(_) => {
                ring.primary(token).cloned().into_iter().collect()
            }
        }
    }
}

fn simple_replicas(ring: &Ring, token: Token, rf: usize) -> Vec<Arc<Node>> {
    let mut seen = HashSet::new();
    let mut replicas = Vec::with_capacity(rf);
    for node in ring.walk(token) {
        if replicas.len() >= rf {
            break;
        }
        if seen.insert(node.addr) {
            replicas.push(node.clone());
        }
    }
    replicas
}

#[derive(Default)]
struct DcState {
    rf: usize,
    picked: usize,
    racks_total: usize,
    racks_seen: HashSet<String>,
    /// Same-rack nodes held back until every rack of the DC has one replica
    skipped: Vec<Arc<Node>>,
}

impl DcState {
    fn full(&self) -> bool {
        self.picked >= self.rf
    }

    fn all_racks_seen(&self) -> bool {
        self.racks_seen.len() >= self.racks_total
    }
}

fn nts_replicas(ring: &Ring, token: Token, dc_rf: &BTreeMap<String, usize>) -> Vec<Arc<Node>> {
    let mut racks: HashMap<&str, HashSet<&str>> = HashMap::new();
    for (_, node) in ring.entries() {
        racks
            .entry(node.datacenter.as_str())
            .or_default()
            .insert(node.rack.as_str());
    }

    let mut dcs: HashMap<&str, DcState> = dc_rf
        .iter()
        .filter(|(dc, rf)| **rf > 0 && racks.contains_key(dc.as_str()))
        .map(|(dc, rf)| {
            let state = DcState {
                rf: *rf,
                racks_total: racks.get(dc.as_str()).map_or(0, |r| r.len()),
                ..DcState::default()
            };
            (dc.as_str(), state)
        })
        .collect();
    let wanted: usize = dcs.values().map(|s| s.rf).sum();

    let mut picked: HashSet<SocketAddr> = HashSet::new();
    let mut replicas = Vec::with_capacity(wanted);
    for node in ring.walk(token) {
        if replicas.len() >= wanted {
            break;
        }
        let state = match dcs.get_mut(node.datacenter.as_str()) {
            Some(state) if !state.full() => state,
            _ => continue,
        };
        if picked.contains(&node.addr) {
            continue;
        }

        if state.all_racks_seen() {
            picked.insert(node.addr);
            replicas.push(node.clone());
            state.picked += 1;
            continue;
        }
        if state.racks_seen.contains(&node.rack) {
            if !state.skipped.iter().any(|n| n.addr == node.addr) {
                state.skipped.push(node.clone());
            }
            continue;
        }

        state.racks_seen.insert(node.rack.clone());
        picked.insert(node.addr);
        replicas.push(node.clone());
        state.picked += 1;

        if state.all_racks_seen() {
            for held in std::mem::take(&mut state.skipped) {
                if state.full() {
                    break;
                }
                if picked.insert(held.addr) {
                    replicas.push(held);
                    state.picked += 1;
                }
            }
        }
    }
    replicas
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    pub name: String,
    pub strategy: ReplicationStrategy,
    pub durable_writes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(i: u8, dc: &str, rack: &str, token: i64) -> Arc<Node> {
        Arc::new(Node::detached(
            SocketAddr::new([10, 0, 0, i].into(), 9042),
            dc,
            rack,
            vec![Token(token)],
        ))
    }

    fn addrs(nodes: &[Arc<Node>]) -> Vec<u8> {
        nodes
            .iter()
            .map(|n| match n.addr.ip() {
                std::net::IpAddr::V4(ip) => ip.octets()[3],
                std::net::IpAddr::V6(_) => 0,
            })
            .collect()
    }

    fn options(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_strategy_from_options() {
        let simple = options(&[
            ("class", "org.apache.cassandra.locator.SimpleStrategy"),
            ("replication_factor", "3"),
        ]);
        assert_eq!(
            ReplicationStrategy::from_options(&simple),
            ReplicationStrategy::Simple { rf: 3 }
        );

        let nts = options(&[
            ("class", "NetworkTopologyStrategy"),
            ("dc1", "3"),
            ("dc2", "2/1"),
        ]);
        let mut dc_rf = BTreeMap::new();
        dc_rf.insert("dc1".to_string(), 3);
        dc_rf.insert("dc2".to_string(), 2);
        assert_eq!(
            ReplicationStrategy::from_options(&nts),
            ReplicationStrategy::NetworkTopology { dc_rf }
        );

        let local = options(&[("class", "org.apache.cassandra.locator.LocalStrategy")]);
        assert_eq!(ReplicationStrategy::from_options(&local), ReplicationStrategy::Local);

        let other = options(&[("class", "com.example.Custom")]);
        assert!(matches!(
            ReplicationStrategy::from_options(&other),
            ReplicationStrategy::Other(_)
        ));
    }

    #[test]
    fn test_simple_strategy_distinct_in_ring_order() {
        // Node 1 owns two tokens, so the walk meets it twice
        let n1 = Arc::new(Node::detached(
            SocketAddr::new([10, 0, 0, 1].into(), 9042),
            "dc1",
            "r1",
            vec![Token(0), Token(150)],
        ));
        let n2 = node(2, "dc1", "r1", 100);
        let n3 = node(3, "dc1", "r1", 200);
        let ring = Ring::new([&n1, &n2, &n3]);

        let strategy = ReplicationStrategy::Simple { rf: 3 };
        assert_eq!(addrs(&strategy.replicas(&ring, Token(50))), vec![2, 1, 3]);
        assert_eq!(addrs(&strategy.replicas(&ring, Token(201))), vec![1, 2, 3]);

        let strategy = ReplicationStrategy::Simple { rf: 2 };
        assert_eq!(addrs(&strategy.replicas(&ring, Token(120))), vec![1, 3]);

        let strategy = ReplicationStrategy::Simple { rf: 5 };
        assert_eq!(strategy.replicas(&ring, Token(0)).len(), 3);
    }

    #[test]
    fn test_nts_per_dc_caps() {
        let ring_nodes = vec![
            node(1, "dc1", "r1", 0),
            node(2, "dc2", "r1", 10),
            node(3, "dc1", "r2", 20),
            node(4, "dc2", "r2", 30),
            node(5, "dc1", "r3", 40),
            node(6, "dc2", "r1", 50),
        ];
        let ring = Ring::new(ring_nodes.iter());
        let mut dc_rf = BTreeMap::new();
        dc_rf.insert("dc1".to_string(), 2);
        dc_rf.insert("dc2".to_string(), 1);
        dc_rf.insert("dc3".to_string(), 3);
        let strategy = ReplicationStrategy::NetworkTopology { dc_rf };

        let replicas = strategy.replicas(&ring, Token(0));
        assert_eq!(addrs(&replicas), vec![1, 2, 3]);
        assert_eq!(replicas.len(), 3);
    }

    #[test]
    fn test_nts_prefers_rack_diversity() {
        // dc1 has racks r1, r2; rf 3 allows one same-rack repeat
        let ring_nodes = vec![
            node(1, "dc1", "r1", 0),
            node(2, "dc1", "r1", 10),
            node(3, "dc1", "r1", 20),
            node(4, "dc1", "r2", 30),
            node(5, "dc1", "r2", 40),
        ];
        let ring = Ring::new(ring_nodes.iter());
        let mut dc_rf = BTreeMap::new();
        dc_rf.insert("dc1".to_string(), 3);
        let strategy = ReplicationStrategy::NetworkTopology { dc_rf };

        let replicas = strategy.replicas(&ring, Token(0));
        assert_eq!(addrs(&replicas), vec![1, 4, 2]);

        let racks: HashSet<&str> = replicas.iter().map(|n| n.rack.as_str()).collect();
        assert_eq!(racks.len(), 2);
    }

    #[test]
    fn test_nts_racks_exceed_rf() {
        let ring_nodes = vec![
            node(1, "dc1", "r1", 0),
            node(2, "dc1", "r1", 10),
            node(3, "dc1", "r2", 20),
            node(4, "dc1", "r3", 30),
        ];
        let ring = Ring::new(ring_nodes.iter());
        let mut dc_rf = BTreeMap::new();
        dc_rf.insert("dc1".to_string(), 2);
        let strategy = ReplicationStrategy::NetworkTopology { dc_rf };
        assert_eq!(addrs(&strategy.replicas(&ring, Token(0))), vec![1, 3]);
    }

    #[test]
    fn test_local_strategy_primary_only() {
        let ring_nodes = vec![node(1, "dc1", "r1", 0), node(2, "dc1", "r1", 10)];
        let ring = Ring::new(ring_nodes.iter());
        assert_eq!(
            addrs(&ReplicationStrategy::Local.replicas(&ring, Token(5))),
            vec![2]
        );
    }
}
