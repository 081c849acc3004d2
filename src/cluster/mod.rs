pub mod keyspace;
pub mod manager;
pub mod node;
pub mod policy;
pub mod retry;
pub mod ring;
pub mod token;
pub mod topology;

pub use keyspace::{Keyspace, ReplicationStrategy};
pub use manager::Cluster;
pub use node::{Node, NodeStatus, PeerInfo};
pub use policy::{
    DcAwareRoundRobinPolicy, HostSelectionPolicy, QueryPlan, RoundRobinPolicy, RoutingInfo,
    TokenAwarePolicy,
};
pub use retry::{
    DefaultRetryDecider, DefaultRetryPolicy, FallthroughRetryPolicy, RequestInfo, RetryDecider,
    RetryDecision, RetryPolicy,
};
pub use ring::Ring;
pub use token::{murmur3_token, Token};
pub use topology::Topology;
