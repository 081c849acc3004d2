//! Request execution over a cluster
//!
//! A [`Session`] asks its host selection policy for a query plan, sends the
//! request to the first usable node through that node's shard-aware pool
//! and consults a fresh retry decider after every failure.

pub mod builder;
pub mod statement;

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cluster::policy::{HostSelectionPolicy, RoutingInfo};
use crate::cluster::retry::{RequestInfo, RetryDecision, RetryPolicy};
use crate::cluster::Cluster;
use crate::config::ClusterConfig;
use crate::error::{DriverError, DriverResult, ErrorKind};
use crate::frame::{
    Batch, Consistency, Execute, QueryParams, QueryResult, Statement, Value,
};
use crate::metrics::DriverMetrics;
use crate::transport::Connection;

pub use builder::SessionBuilder;
pub use statement::{bind_values, routing_key, PreparedStatement, Query, StatementOptions};

/// Executes statements against a [`Cluster`]
#[derive(Debug, Clone)]
pub struct Session {
    cluster: Cluster,
    policy: Arc<dyn HostSelectionPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    consistency: Consistency,
    serial_consistency: Option<Consistency>,
    page_size: Option<i32>,
    keyspace: Option<String>,
}

impl Session {
    /// Connect with the policies `config` selects
    pub async fn connect(config: ClusterConfig) -> DriverResult<Self> {
        SessionBuilder::from_config(config).build().await
    }

    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    pub fn metrics(&self) -> &Arc<DriverMetrics> {
        self.cluster.metrics()
    }

    pub fn policy(&self) -> &dyn HostSelectionPolicy {
        self.policy.as_ref()
    }

    /// Keyspace used for routing statements that name none
    pub fn default_keyspace(&self) -> Option<&str> {
        self.keyspace.as_deref()
    }

    pub async fn query(
        &self,
        query: impl Into<Query>,
        values: &[Value],
    ) -> DriverResult<QueryResult> {
        let query = query.into();
        let statement = Statement {
            content: query.contents.clone(),
            params: self.params(&query.options, values.to_vec()),
        };
        let routing = RoutingInfo::new(
            query.token(),
            self.routing_keyspace(query.keyspace.as_deref()),
        );

        self.run(routing, &query.options, statement.params.consistency, |conn| {
            let statement = statement.clone();
            async move { conn.query(&statement).await }
        })
        .await
    }

    /// Prepare on one node of the plan
    ///
    /// Other nodes learn the statement lazily: an `Unprepared` answer to
    /// EXECUTE makes the session prepare it there and execute again.
    pub async fn prepare(&self, contents: &str) -> DriverResult<PreparedStatement> {
        let routing = RoutingInfo::new(None, self.keyspace.clone());
        let options = StatementOptions {
            idempotent: true,
            ..Default::default()
        };
        let contents_owned = contents.to_string();
        let result = self
            .run(routing, &options, self.consistency, |conn| {
                let contents = contents_owned.clone();
                async move { conn.prepare(&contents).await.map(QueryResult::Prepared) }
            })
            .await?;
        match result {
            QueryResult::Prepared(prepared) => Ok(PreparedStatement::new(contents, prepared)),
            other => Err(DriverError::Protocol(format!(
                "expected a prepared result, got {:?}",
                other
            ))),
        }
    }

    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &[Value],
    ) -> DriverResult<QueryResult> {
        let values = values.to_vec();
        let token = prepared.token(&values);
        let execute = Execute {
            id: prepared.id().to_vec(),
            params: self.params(prepared.options(), values),
        };
        let routing = RoutingInfo::new(token, self.routing_keyspace(prepared.keyspace()));
        let contents = prepared.contents().to_string();

        self.run(routing, prepared.options(), execute.params.consistency, |conn| {
            let execute = execute.clone();
            let contents = contents.clone();
            async move { execute_or_reprepare(&conn, execute, &contents).await }
        })
        .await
    }

    /// Send a BATCH; it is routed without a token
    pub async fn batch(&self, batch: &Batch, idempotent: bool) -> DriverResult<QueryResult> {
        let routing = RoutingInfo::new(None, self.keyspace.clone());
        let options = StatementOptions {
            idempotent,
            ..Default::default()
        };
        self.run(routing, &options, batch.consistency, |conn| {
            let batch = batch.clone();
            async move { conn.batch(&batch).await }
        })
        .await
    }

    /// Stop background tasks and close every connection
    pub async fn close(&self) {
        self.cluster.close().await;
    }

    fn routing_keyspace(&self, keyspace: Option<&str>) -> Option<String> {
        keyspace.map(str::to_string).or_else(|| self.keyspace.clone())
    }

    fn params(&self, options: &StatementOptions, values: Vec<Value>) -> QueryParams {
        QueryParams {
            consistency: options.consistency.unwrap_or(self.consistency),
            values,
            names: Vec::new(),
            skip_metadata: false,
            page_size: options.page_size.or(self.page_size),
            paging_state: options.paging_state.clone(),
            serial_consistency: options.serial_consistency.or(self.serial_consistency),
            default_timestamp: options.timestamp,
        }
    }

    /// Walk the query plan until an attempt succeeds or the retry decider
    /// gives up
    async fn run<F, Fut>(
        &self,
        routing: RoutingInfo,
        options: &StatementOptions,
        consistency: Consistency,
        mut attempt: F,
    ) -> DriverResult<QueryResult>
    where
        F: FnMut(Connection) -> Fut,
        Fut: Future<Output = DriverResult<QueryResult>>,
    {
        let metrics = self.cluster.metrics();
        DriverMetrics::incr(&metrics.requests);

        let topology = self.cluster.topology();
        let plan = self.policy.plan(&routing, &topology);
        let mut decider = self.retry_policy.decider();
        let mut last_error = None;

        'plan: for node in plan {
            if !node.is_up() {
                trace!("Skipping down node {}", node.addr);
                continue;
            }
            let Some(pool) = node.pool() else { continue };

            loop {
                let result = match pool.conn(routing.token) {
                    Ok(conn) => attempt(conn).await,
                    Err(e) => Err(e),
                };
                let error = match result {
                    Ok(result) => return Ok(result),
                    Err(e) => e,
                };

                let decision = decider.decide(&RequestInfo {
                    error: &error,
                    idempotent: options.idempotent,
                    consistency,
                });
                debug!("Request to {} failed ({}), {:?}", node.addr, error, decision);
                last_error = Some(error);

                match decision {
                    RetryDecision::RetrySameNode => DriverMetrics::incr(&metrics.retries),
                    RetryDecision::RetryNextNode => {
                        DriverMetrics::incr(&metrics.retries);
                        continue 'plan;
                    }
                    RetryDecision::DontRetry => break 'plan,
                }
            }
        }

        DriverMetrics::incr(&metrics.request_errors);
        Err(last_error.unwrap_or(DriverError::NoHosts))
    }
}

/// EXECUTE, preparing once more if the node lost the statement
async fn execute_or_reprepare(
    conn: &Connection,
    mut execute: Execute,
    contents: &str,
) -> DriverResult<QueryResult> {
    match conn.execute(&execute).await {
        Err(e) if e.kind() == ErrorKind::Unprepared => {
            debug!("{} does not know the statement, preparing it again", conn.addr());
            let prepared = conn.prepare(contents).await?;
            execute.id = prepared.id;
            conn.execute(&execute).await
        }
        other => other,
    }
}
