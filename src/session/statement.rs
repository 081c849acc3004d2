//! Statements as the session executes them

use crate::cluster::token::Token;
use crate::frame::{
    Consistency, CqlValue, Prepared, PreparedMetadata, ResultMetadata, Value,
};

/// Per-statement overrides of the session defaults
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatementOptions {
    pub consistency: Option<Consistency>,
    pub serial_consistency: Option<Consistency>,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    /// Safe to send again after a failure that may have been applied
    pub idempotent: bool,
}

macro_rules! option_setters {
    () => {
        pub fn with_consistency(mut self, consistency: Consistency) -> Self {
            self.options.consistency = Some(consistency);
            self
        }

        pub fn with_serial_consistency(mut self, consistency: Consistency) -> Self {
            self.options.serial_consistency = Some(consistency);
            self
        }

        pub fn with_page_size(mut self, page_size: i32) -> Self {
            self.options.page_size = Some(page_size);
            self
        }

        /// Resume from the paging state of a previous page
        pub fn with_paging_state(mut self, paging_state: Option<Vec<u8>>) -> Self {
            self.options.paging_state = paging_state;
            self
        }

        pub fn with_timestamp(mut self, timestamp: i64) -> Self {
            self.options.timestamp = Some(timestamp);
            self
        }

        pub fn idempotent(mut self, idempotent: bool) -> Self {
            self.options.idempotent = idempotent;
            self
        }

        pub fn options(&self) -> &StatementOptions {
            &self.options
        }
    };
}

/// A CQL string sent as QUERY
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    pub contents: String,
    pub options: StatementOptions,
    /// Serialized partition key, used for token-aware routing
    pub routing_key: Option<Vec<u8>>,
    pub keyspace: Option<String>,
}

impl Query {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            ..Default::default()
        }
    }

    option_setters!();

    pub fn with_routing_key(mut self, routing_key: Vec<u8>) -> Self {
        self.routing_key = Some(routing_key);
        self
    }

    pub fn with_keyspace(mut self, keyspace: impl Into<String>) -> Self {
        self.keyspace = Some(keyspace.into());
        self
    }

    pub fn token(&self) -> Option<Token> {
        self.routing_key.as_deref().map(Token::of)
    }
}

impl From<&str> for Query {
    fn from(contents: &str) -> Self {
        Query::new(contents)
    }
}

impl From<String> for Query {
    fn from(contents: String) -> Self {
        Query::new(contents)
    }
}

/// A statement prepared on the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    id: Vec<u8>,
    contents: String,
    metadata: PreparedMetadata,
    result_metadata: ResultMetadata,
    pub options: StatementOptions,
}

impl PreparedStatement {
    pub fn new(contents: impl Into<String>, prepared: Prepared) -> Self {
        Self {
            id: prepared.id,
            contents: contents.into(),
            metadata: prepared.metadata,
            result_metadata: prepared.result_metadata,
            options: StatementOptions::default(),
        }
    }

    option_setters!();

    pub fn id(&self) -> &[u8] {
        &self.id
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn metadata(&self) -> &PreparedMetadata {
        &self.metadata
    }

    pub fn result_metadata(&self) -> &ResultMetadata {
        &self.result_metadata
    }

    /// Keyspace of the bound columns
    pub fn keyspace(&self) -> Option<&str> {
        self.metadata
            .columns
            .first()
            .map(|c| c.keyspace.as_str())
            .filter(|ks| !ks.is_empty())
    }

    /// Routing key built from the partition-key columns of `values`
    pub fn routing_key(&self, values: &[Value]) -> Option<Vec<u8>> {
        routing_key(&self.metadata.pk_indexes, values)
    }

    pub fn token(&self, values: &[Value]) -> Option<Token> {
        self.routing_key(values).as_deref().map(Token::of)
    }
}

/// Serialize the partition key from bound values
///
/// A single component is used as is. Composite keys concatenate
/// `u16 length ++ bytes ++ 0x00` per component. Returns `None` when a key
/// column is missing, null or unset.
pub fn routing_key(pk_indexes: &[u16], values: &[Value]) -> Option<Vec<u8>> {
    match pk_indexes {
        [] => None,
        [idx] => values.get(*idx as usize)?.as_bytes().map(<[u8]>::to_vec),
        indexes => {
            let mut key = Vec::new();
            for idx in indexes {
                let bytes = values.get(*idx as usize)?.as_bytes()?;
                let len = u16::try_from(bytes.len()).ok()?;
                key.extend_from_slice(&len.to_be_bytes());
                key.extend_from_slice(bytes);
                key.push(0);
            }
            Some(key)
        }
    }
}

/// Bind values in wire form
pub fn bind_values(values: &[CqlValue]) -> Vec<Value> {
    values.iter().map(|v| Value::Set(v.encode())).collect()
}
