//! Response message bodies.

use std::collections::HashMap;
use std::net::SocketAddr;

use super::buffer::Buffer;
use super::error::CqlError;
use super::header::Opcode;
use super::types::ColumnType;
use super::value::CqlValue;
use crate::error::{DriverError, DriverResult};

/// Rows metadata flag bits
pub mod metadata_flags {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    pub const HAS_MORE_PAGES: i32 = 0x0002;
    pub const NO_METADATA: i32 = 0x0004;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub keyspace: String,
    pub table: String,
    pub name: String,
    pub ty: ColumnType,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResultMetadata {
    pub columns_count: usize,
    pub paging_state: Option<Vec<u8>>,
    /// Empty when the server was asked to skip metadata
    pub columns: Vec<ColumnSpec>,
}

impl ResultMetadata {
    pub fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let flags = buf.read_int();
        let columns_count = read_count(buf)?;
        let paging_state = if flags & metadata_flags::HAS_MORE_PAGES != 0 {
            buf.read_bytes()
        } else {
            None
        };
        let columns = if flags & metadata_flags::NO_METADATA != 0 {
            Vec::new()
        } else {
            read_column_specs(buf, flags, columns_count)?
        };
        buf.check()?;
        Ok(Self {
            columns_count,
            paging_state,
            columns,
        })
    }

    pub fn write(&self, buf: &mut Buffer) {
        let mut flags = 0;
        if self.paging_state.is_some() {
            flags |= metadata_flags::HAS_MORE_PAGES;
        }
        if self.columns.is_empty() {
            flags |= metadata_flags::NO_METADATA;
        }
        buf.write_int(flags);
        buf.write_int(self.columns_count as i32);
        if let Some(state) = &self.paging_state {
            buf.write_bytes(Some(state));
        }
        write_column_specs(buf, &self.columns);
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }
}

fn read_count(buf: &mut Buffer) -> DriverResult<usize> {
    let n = buf.read_int();
    buf.check()?;
    usize::try_from(n).map_err(|_| DriverError::Protocol(format!("negative count {}", n)))
}

fn read_column_specs(
    buf: &mut Buffer,
    flags: i32,
    count: usize,
) -> DriverResult<Vec<ColumnSpec>> {
    let global = if flags & metadata_flags::GLOBAL_TABLES_SPEC != 0 {
        Some((buf.read_string(), buf.read_string()))
    } else {
        None
    };
    let mut columns = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        let (keyspace, table) = match &global {
            Some((ks, t)) => (ks.clone(), t.clone()),
            None => (buf.read_string(), buf.read_string()),
        };
        let name = buf.read_string();
        let ty = ColumnType::parse(buf)?;
        columns.push(ColumnSpec {
            keyspace,
            table,
            name,
            ty,
        });
    }
    Ok(columns)
}

/// Always written with per-column table specs
fn write_column_specs(buf: &mut Buffer, columns: &[ColumnSpec]) {
    for column in columns {
        buf.write_string(&column.keyspace);
        buf.write_string(&column.table);
        buf.write_string(&column.name);
        column.ty.write(buf);
    }
}

/// One row of raw column values, decoded on demand against the metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub columns: Vec<Option<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rows {
    pub metadata: ResultMetadata,
    pub rows: Vec<Row>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn paging_state(&self) -> Option<&[u8]> {
        self.metadata.paging_state.as_deref()
    }

    /// Decode column `col` of row `row`
    pub fn value(&self, row: usize, col: usize) -> DriverResult<Option<CqlValue>> {
        let spec = self.metadata.columns.get(col).ok_or_else(|| {
            DriverError::Protocol(format!("column {} has no metadata", col))
        })?;
        let raw = self
            .rows
            .get(row)
            .and_then(|r| r.columns.get(col))
            .ok_or_else(|| {
                DriverError::Protocol(format!("no value at row {} column {}", row, col))
            })?;
        Ok(CqlValue::decode(&spec.ty, raw.as_deref())?)
    }

    pub fn value_by_name(&self, row: usize, name: &str) -> DriverResult<Option<CqlValue>> {
        let col = self
            .metadata
            .column_index(name)
            .ok_or_else(|| DriverError::Protocol(format!("no column named '{}'", name)))?;
        self.value(row, col)
    }

    pub fn decode_row(&self, row: usize) -> DriverResult<Vec<Option<CqlValue>>> {
        (0..self.metadata.columns.len())
            .map(|col| self.value(row, col))
            .collect()
    }

    fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let metadata = ResultMetadata::parse(buf)?;
        let rows_count = read_count(buf)?;
        let mut rows = Vec::with_capacity(rows_count.min(4096));
        for _ in 0..rows_count {
            let columns = (0..metadata.columns_count)
                .map(|_| buf.read_bytes())
                .collect();
            if buf.error().is_some() {
                break;
            }
            rows.push(Row { columns });
        }
        buf.check()?;
        Ok(Self { metadata, rows })
    }

    fn write(&self, buf: &mut Buffer) {
        self.metadata.write(buf);
        buf.write_int(self.rows.len() as i32);
        for row in &self.rows {
            for col in &row.columns {
                buf.write_bytes(col.as_deref());
            }
        }
    }
}

/// Metadata of a prepared statement's bind markers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PreparedMetadata {
    pub pk_indexes: Vec<u16>,
    pub columns: Vec<ColumnSpec>,
}

impl PreparedMetadata {
    fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let flags = buf.read_int();
        let columns_count = read_count(buf)?;
        let pk_count = read_count(buf)?;
        let pk_indexes = (0..pk_count).map(|_| buf.read_short()).collect();
        let columns = read_column_specs(buf, flags, columns_count)?;
        buf.check()?;
        Ok(Self {
            pk_indexes,
            columns,
        })
    }

    fn write(&self, buf: &mut Buffer) {
        buf.write_int(0);
        buf.write_int(self.columns.len() as i32);
        buf.write_int(self.pk_indexes.len() as i32);
        for idx in &self.pk_indexes {
            buf.write_short(*idx);
        }
        write_column_specs(buf, &self.columns);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub id: Vec<u8>,
    pub metadata: PreparedMetadata,
    pub result_metadata: ResultMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaChangeTarget {
    Keyspace {
        keyspace: String,
    },
    Table {
        keyspace: String,
        name: String,
    },
    Type {
        keyspace: String,
        name: String,
    },
    Function {
        keyspace: String,
        name: String,
        arg_types: Vec<String>,
    },
    Aggregate {
        keyspace: String,
        name: String,
        arg_types: Vec<String>,
    },
}

impl SchemaChangeTarget {
    pub fn keyspace(&self) -> &str {
        match self {
            SchemaChangeTarget::Keyspace { keyspace }
            | SchemaChangeTarget::Table { keyspace, .. }
            | SchemaChangeTarget::Type { keyspace, .. }
            | SchemaChangeTarget::Function { keyspace, .. }
            | SchemaChangeTarget::Aggregate { keyspace, .. } => keyspace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaChange {
    /// CREATED, UPDATED or DROPPED
    pub change: String,
    pub target: SchemaChangeTarget,
}

impl SchemaChange {
    fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let change = buf.read_string();
        let target = buf.read_string();
        let target = match target.as_str() {
            "KEYSPACE" => SchemaChangeTarget::Keyspace {
                keyspace: buf.read_string(),
            },
            "TABLE" => SchemaChangeTarget::Table {
                keyspace: buf.read_string(),
                name: buf.read_string(),
            },
            "TYPE" => SchemaChangeTarget::Type {
                keyspace: buf.read_string(),
                name: buf.read_string(),
            },
            "FUNCTION" => SchemaChangeTarget::Function {
                keyspace: buf.read_string(),
                name: buf.read_string(),
                arg_types: buf.read_string_list(),
            },
            "AGGREGATE" => SchemaChangeTarget::Aggregate {
                keyspace: buf.read_string(),
                name: buf.read_string(),
                arg_types: buf.read_string_list(),
            },
            other => {
                buf.check()?;
                return Err(DriverError::Protocol(format!(
                    "unknown schema change target '{}'",
                    other
                )));
            }
        };
        buf.check()?;
        Ok(Self { change, target })
    }

    fn write(&self, buf: &mut Buffer) {
        buf.write_string(&self.change);
        match &self.target {
            SchemaChangeTarget::Keyspace { keyspace } => {
                buf.write_string("KEYSPACE");
                buf.write_string(keyspace);
            }
            SchemaChangeTarget::Table { keyspace, name } => {
                buf.write_string("TABLE");
                buf.write_string(keyspace);
                buf.write_string(name);
            }
            SchemaChangeTarget::Type { keyspace, name } => {
                buf.write_string("TYPE");
                buf.write_string(keyspace);
                buf.write_string(name);
            }
            SchemaChangeTarget::Function {
                keyspace,
                name,
                arg_types,
            } => {
                buf.write_string("FUNCTION");
                buf.write_string(keyspace);
                buf.write_string(name);
                buf.write_string_list(arg_types);
            }
            SchemaChangeTarget::Aggregate {
                keyspace,
                name,
                arg_types,
            } => {
                buf.write_string("AGGREGATE");
                buf.write_string(keyspace);
                buf.write_string(name);
                buf.write_string_list(arg_types);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Void,
    Rows(Rows),
    SetKeyspace(String),
    Prepared(Prepared),
    SchemaChange(SchemaChange),
}

impl QueryResult {
    pub fn into_rows(self) -> Option<Rows> {
        match self {
            QueryResult::Rows(rows) => Some(rows),
            _ => None,
        }
    }

    fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let kind = buf.read_int();
        buf.check()?;
        Ok(match kind {
            0x0001 => QueryResult::Void,
            0x0002 => QueryResult::Rows(Rows::parse(buf)?),
            0x0003 => QueryResult::SetKeyspace(buf.read_string()),
            0x0004 => {
                let id = buf.read_short_bytes();
                let metadata = PreparedMetadata::parse(buf)?;
                let result_metadata = ResultMetadata::parse(buf)?;
                QueryResult::Prepared(Prepared {
                    id,
                    metadata,
                    result_metadata,
                })
            }
            0x0005 => QueryResult::SchemaChange(SchemaChange::parse(buf)?),
            other => {
                return Err(DriverError::Protocol(format!(
                    "unknown result kind 0x{:04x}",
                    other
                )))
            }
        })
    }

    fn write(&self, buf: &mut Buffer) {
        match self {
            QueryResult::Void => buf.write_int(0x0001),
            QueryResult::Rows(rows) => {
                buf.write_int(0x0002);
                rows.write(buf);
            }
            QueryResult::SetKeyspace(keyspace) => {
                buf.write_int(0x0003);
                buf.write_string(keyspace);
            }
            QueryResult::Prepared(prepared) => {
                buf.write_int(0x0004);
                buf.write_short_bytes(&prepared.id);
                prepared.metadata.write(buf);
                prepared.result_metadata.write(buf);
            }
            QueryResult::SchemaChange(change) => {
                buf.write_int(0x0005);
                change.write(buf);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChange {
    NewNode,
    RemovedNode,
    MovedNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    TopologyChange {
        change: TopologyChange,
        addr: SocketAddr,
    },
    StatusChange {
        status: StatusChange,
        addr: SocketAddr,
    },
    SchemaChange(SchemaChange),
}

impl Event {
    pub fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let kind = buf.read_string();
        let event = match kind.as_str() {
            "TOPOLOGY_CHANGE" => {
                let change = match buf.read_string().as_str() {
                    "NEW_NODE" => TopologyChange::NewNode,
                    "REMOVED_NODE" => TopologyChange::RemovedNode,
                    "MOVED_NODE" => TopologyChange::MovedNode,
                    other => {
                        return Err(DriverError::Protocol(format!(
                            "unknown topology change '{}'",
                            other
                        )))
                    }
                };
                Event::TopologyChange {
                    change,
                    addr: buf.read_inet(),
                }
            }
            "STATUS_CHANGE" => {
                let status = match buf.read_string().as_str() {
                    "UP" => StatusChange::Up,
                    "DOWN" => StatusChange::Down,
                    other => {
                        return Err(DriverError::Protocol(format!(
                            "unknown status change '{}'",
                            other
                        )))
                    }
                };
                Event::StatusChange {
                    status,
                    addr: buf.read_inet(),
                }
            }
            "SCHEMA_CHANGE" => Event::SchemaChange(SchemaChange::parse(buf)?),
            other => {
                buf.check()?;
                return Err(DriverError::Protocol(format!(
                    "unknown event '{}'",
                    other
                )));
            }
        };
        buf.check()?;
        Ok(event)
    }

    pub fn write(&self, buf: &mut Buffer) {
        match self {
            Event::TopologyChange { change, addr } => {
                buf.write_string("TOPOLOGY_CHANGE");
                buf.write_string(match change {
                    TopologyChange::NewNode => "NEW_NODE",
                    TopologyChange::RemovedNode => "REMOVED_NODE",
                    TopologyChange::MovedNode => "MOVED_NODE",
                });
                buf.write_inet(*addr);
            }
            Event::StatusChange { status, addr } => {
                buf.write_string("STATUS_CHANGE");
                buf.write_string(match status {
                    StatusChange::Up => "UP",
                    StatusChange::Down => "DOWN",
                });
                buf.write_inet(*addr);
            }
            Event::SchemaChange(change) => {
                buf.write_string("SCHEMA_CHANGE");
                change.write(buf);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Error(CqlError),
    Ready,
    Authenticate(String),
    Supported(HashMap<String, Vec<String>>),
    Result(QueryResult),
    Event(Event),
    AuthChallenge(Option<Vec<u8>>),
    AuthSuccess(Option<Vec<u8>>),
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Error(_) => Opcode::Error,
            Response::Ready => Opcode::Ready,
            Response::Authenticate(_) => Opcode::Authenticate,
            Response::Supported(_) => Opcode::Supported,
            Response::Result(_) => Opcode::Result,
            Response::Event(_) => Opcode::Event,
            Response::AuthChallenge(_) => Opcode::AuthChallenge,
            Response::AuthSuccess(_) => Opcode::AuthSuccess,
        }
    }

    pub fn parse(opcode: Opcode, buf: &mut Buffer) -> DriverResult<Self> {
        let response = match opcode {
            Opcode::Error => Response::Error(CqlError::parse(buf)?),
            Opcode::Ready => Response::Ready,
            Opcode::Authenticate => Response::Authenticate(buf.read_string()),
            Opcode::Supported => Response::Supported(buf.read_string_multimap()),
            Opcode::Result => Response::Result(QueryResult::parse(buf)?),
            Opcode::Event => Response::Event(Event::parse(buf)?),
            Opcode::AuthChallenge => Response::AuthChallenge(buf.read_bytes()),
            Opcode::AuthSuccess => Response::AuthSuccess(buf.read_bytes()),
            other => {
                return Err(DriverError::Protocol(format!(
                    "{} is not a response opcode",
                    other
                )))
            }
        };
        buf.check()?;
        Ok(response)
    }

    pub fn write(&self, buf: &mut Buffer) {
        match self {
            Response::Error(err) => err.write(buf),
            Response::Ready => {}
            Response::Authenticate(authenticator) => buf.write_string(authenticator),
            Response::Supported(options) => buf.write_string_multimap(options),
            Response::Result(result) => result.write(buf),
            Response::Event(event) => event.write(buf),
            Response::AuthChallenge(token) | Response::AuthSuccess(token) => {
                buf.write_bytes(token.as_deref())
            }
        }
    }

    /// Turn an ERROR response into `Err`, anything else passes through
    pub fn into_result(self) -> DriverResult<Self> {
        match self {
            Response::Error(err) => Err(DriverError::Server(err)),
            other => Ok(other),
        }
    }
}
