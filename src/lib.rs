//! Shard-aware CQL v4 driver
//!
//! Requests are routed to the node owning the partition and, on nodes that
//! split work across CPU shards, to the connection bound to the owning
//! shard.

pub mod cluster;
pub mod config;
pub mod error;
pub mod frame;
pub mod metrics;
pub mod session;
pub mod transport;

pub use cluster::{Cluster, Token};
pub use config::ClusterConfig;
pub use error::{DriverError, DriverResult};
pub use frame::{Consistency, CqlValue, QueryResult, Value};
pub use metrics::DriverMetrics;
pub use session::{PreparedStatement, Query, Session, SessionBuilder};
