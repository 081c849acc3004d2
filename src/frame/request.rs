//! Request message bodies.

use super::buffer::{Buffer, Value};
use super::consistency::Consistency;
use super::header::Opcode;
use crate::error::{DriverError, DriverResult};

/// Query parameter flag bits
pub mod query_flags {
    pub const VALUES: u8 = 0x01;
    pub const SKIP_METADATA: u8 = 0x02;
    pub const PAGE_SIZE: u8 = 0x04;
    pub const PAGING_STATE: u8 = 0x08;
    pub const SERIAL_CONSISTENCY: u8 = 0x10;
    pub const DEFAULT_TIMESTAMP: u8 = 0x20;
    pub const NAMES_FOR_VALUES: u8 = 0x40;
}

/// Parameters shared by QUERY and EXECUTE. The flags byte is derived from
/// which optional fields are populated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueryParams {
    pub consistency: Consistency,
    pub values: Vec<Value>,
    /// Bind names, parallel to `values`; empty for positional binding
    pub names: Vec<String>,
    pub skip_metadata: bool,
    pub page_size: Option<i32>,
    pub paging_state: Option<Vec<u8>>,
    pub serial_consistency: Option<Consistency>,
    pub default_timestamp: Option<i64>,
}

impl QueryParams {
    pub fn with_consistency(consistency: Consistency) -> Self {
        Self {
            consistency,
            ..Default::default()
        }
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.values.is_empty() {
            flags |= query_flags::VALUES;
            if !self.names.is_empty() {
                flags |= query_flags::NAMES_FOR_VALUES;
            }
        }
        if self.skip_metadata {
            flags |= query_flags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= query_flags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= query_flags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.default_timestamp.is_some() {
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }
        flags
    }

    pub fn write(&self, buf: &mut Buffer) {
        let flags = self.flags();
        buf.write_short(self.consistency as u16);
        buf.write_byte(flags);
        if flags & query_flags::VALUES != 0 {
            buf.write_short(self.values.len() as u16);
            let named = flags & query_flags::NAMES_FOR_VALUES != 0;
            for (i, value) in self.values.iter().enumerate() {
                if named {
                    buf.write_string(self.names.get(i).map(String::as_str).unwrap_or(""));
                }
                buf.write_value(value);
            }
        }
        if let Some(page_size) = self.page_size {
            buf.write_int(page_size);
        }
        if let Some(state) = &self.paging_state {
            buf.write_bytes(Some(state));
        }
        if let Some(serial) = self.serial_consistency {
            buf.write_short(serial as u16);
        }
        if let Some(ts) = self.default_timestamp {
            buf.write_long(ts);
        }
    }

    pub fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let consistency = read_consistency(buf)?;
        let flags = buf.read_byte();
        let mut params = Self::with_consistency(consistency);
        if flags & query_flags::VALUES != 0 {
            let n = buf.read_short();
            for _ in 0..n {
                if flags & query_flags::NAMES_FOR_VALUES != 0 {
                    params.names.push(buf.read_string());
                }
                params.values.push(buf.read_value());
            }
        }
        params.skip_metadata = flags & query_flags::SKIP_METADATA != 0;
        if flags & query_flags::PAGE_SIZE != 0 {
            params.page_size = Some(buf.read_int());
        }
        if flags & query_flags::PAGING_STATE != 0 {
            params.paging_state = Some(buf.read_bytes().unwrap_or_default());
        }
        if flags & query_flags::SERIAL_CONSISTENCY != 0 {
            params.serial_consistency = Some(read_consistency(buf)?);
        }
        if flags & query_flags::DEFAULT_TIMESTAMP != 0 {
            params.default_timestamp = Some(buf.read_long());
        }
        buf.check()?;
        Ok(params)
    }
}

fn read_consistency(buf: &mut Buffer) -> DriverResult<Consistency> {
    let raw = buf.read_short();
    buf.check()?;
    Consistency::from_u16(raw)
}

/// STARTUP: ordered option map, `CQL_VERSION` first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Startup {
    pub options: Vec<(String, String)>,
}

impl Startup {
    pub const CQL_VERSION: &'static str = "3.0.0";

    pub fn new(compression: Option<&str>) -> Self {
        let mut options = vec![("CQL_VERSION".to_string(), Self::CQL_VERSION.to_string())];
        if let Some(algorithm) = compression {
            options.push(("COMPRESSION".to_string(), algorithm.to_string()));
        }
        Self { options }
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// QUERY body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    pub content: String,
    pub params: QueryParams,
}

impl Statement {
    pub fn new(content: impl Into<String>, consistency: Consistency) -> Self {
        Self {
            content: content.into(),
            params: QueryParams::with_consistency(consistency),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    pub id: Vec<u8>,
    pub params: QueryParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BatchType {
    Logged = 0,
    Unlogged = 1,
    Counter = 2,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchQuery {
    Query(String),
    Prepared(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchStatement {
    pub query: BatchQuery,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub batch_type: BatchType,
    pub statements: Vec<BatchStatement>,
    pub consistency: Consistency,
    pub serial_consistency: Option<Consistency>,
    pub default_timestamp: Option<i64>,
}

impl Batch {
    pub fn new(batch_type: BatchType, consistency: Consistency) -> Self {
        Self {
            batch_type,
            statements: Vec::new(),
            consistency,
            serial_consistency: None,
            default_timestamp: None,
        }
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.serial_consistency.is_some() {
            flags |= query_flags::SERIAL_CONSISTENCY;
        }
        if self.default_timestamp.is_some() {
            flags |= query_flags::DEFAULT_TIMESTAMP;
        }
        flags
    }
}

/// Server event classes a connection can REGISTER for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TopologyChange => "TOPOLOGY_CHANGE",
            EventType::StatusChange => "STATUS_CHANGE",
            EventType::SchemaChange => "SCHEMA_CHANGE",
        }
    }

    pub fn parse(s: &str) -> DriverResult<Self> {
        match s {
            "TOPOLOGY_CHANGE" => Ok(EventType::TopologyChange),
            "STATUS_CHANGE" => Ok(EventType::StatusChange),
            "SCHEMA_CHANGE" => Ok(EventType::SchemaChange),
            other => Err(DriverError::Protocol(format!("unknown event type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Startup(Startup),
    Options,
    Query(Statement),
    Prepare(String),
    Execute(Execute),
    Batch(Batch),
    Register(Vec<EventType>),
    AuthResponse(Option<Vec<u8>>),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Startup(_) => Opcode::Startup,
            Request::Options => Opcode::Options,
            Request::Query(_) => Opcode::Query,
            Request::Prepare(_) => Opcode::Prepare,
            Request::Execute(_) => Opcode::Execute,
            Request::Batch(_) => Opcode::Batch,
            Request::Register(_) => Opcode::Register,
            Request::AuthResponse(_) => Opcode::AuthResponse,
        }
    }

    pub fn write(&self, buf: &mut Buffer) {
        match self {
            Request::Startup(startup) => buf.write_string_map(
                startup
                    .options
                    .iter()
                    .map(|(k, v)| (k.as_str(), v.as_str())),
            ),
            Request::Options => {}
            Request::Query(statement) => {
                buf.write_long_string(&statement.content);
                statement.params.write(buf);
            }
            Request::Prepare(query) => buf.write_long_string(query),
            Request::Execute(execute) => {
                buf.write_short_bytes(&execute.id);
                execute.params.write(buf);
            }
            Request::Batch(batch) => {
                buf.write_byte(batch.batch_type as u8);
                buf.write_short(batch.statements.len() as u16);
                for statement in &batch.statements {
                    match &statement.query {
                        BatchQuery::Query(query) => {
                            buf.write_byte(0);
                            buf.write_long_string(query);
                        }
                        BatchQuery::Prepared(id) => {
                            buf.write_byte(1);
                            buf.write_short_bytes(id);
                        }
                    }
                    buf.write_short(statement.values.len() as u16);
                    for value in &statement.values {
                        buf.write_value(value);
                    }
                }
                buf.write_short(batch.consistency as u16);
                buf.write_byte(batch.flags());
                if let Some(serial) = batch.serial_consistency {
                    buf.write_short(serial as u16);
                }
                if let Some(ts) = batch.default_timestamp {
                    buf.write_long(ts);
                }
            }
            Request::Register(events) => {
                let names: Vec<&str> = events.iter().map(EventType::as_str).collect();
                buf.write_string_list(&names);
            }
            Request::AuthResponse(token) => buf.write_bytes(token.as_deref()),
        }
    }

    /// Decode a request body; the server side of the codec
    pub fn parse(opcode: Opcode, buf: &mut Buffer) -> DriverResult<Self> {
        let request = match opcode {
            Opcode::Startup => {
                let n = buf.read_short();
                let mut options = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let k = buf.read_string();
                    let v = buf.read_string();
                    options.push((k, v));
                }
                Request::Startup(Startup { options })
            }
            Opcode::Options => Request::Options,
            Opcode::Query => {
                let content = buf.read_long_string();
                let params = QueryParams::parse(buf)?;
                Request::Query(Statement { content, params })
            }
            Opcode::Prepare => Request::Prepare(buf.read_long_string()),
            Opcode::Execute => {
                let id = buf.read_short_bytes();
                let params = QueryParams::parse(buf)?;
                Request::Execute(Execute { id, params })
            }
            Opcode::Batch => {
                let batch_type = match buf.read_byte() {
                    0 => BatchType::Logged,
                    1 => BatchType::Unlogged,
                    2 => BatchType::Counter,
                    other => {
                        return Err(DriverError::Protocol(format!(
                            "unknown batch type {}",
                            other
                        )))
                    }
                };
                let n = buf.read_short();
                let mut statements = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let query = match buf.read_byte() {
                        0 => BatchQuery::Query(buf.read_long_string()),
                        1 => BatchQuery::Prepared(buf.read_short_bytes()),
                        other => {
                            return Err(DriverError::Protocol(format!(
                                "unknown batch statement kind {}",
                                other
                            )))
                        }
                    };
                    let count = buf.read_short();
                    let values = (0..count).map(|_| buf.read_value()).collect();
                    statements.push(BatchStatement { query, values });
                }
                let consistency = read_consistency(buf)?;
                let flags = buf.read_byte();
                let serial_consistency = if flags & query_flags::SERIAL_CONSISTENCY != 0 {
                    Some(read_consistency(buf)?)
                } else {
                    None
                };
                let default_timestamp = if flags & query_flags::DEFAULT_TIMESTAMP != 0 {
                    Some(buf.read_long())
                } else {
                    None
                };
                Request::Batch(Batch {
                    batch_type,
                    statements,
                    consistency,
                    serial_consistency,
                    default_timestamp,
                })
            }
            Opcode::Register => Request::Register(
                buf.read_string_list()
                    .iter()
                    .map(|s| EventType::parse(s))
                    .collect::<DriverResult<_>>()?,
            ),
            Opcode::AuthResponse => Request::AuthResponse(buf.read_bytes()),
            other => {
                return Err(DriverError::Protocol(format!(
                    "{} is not a request opcode",
                    other
                )))
            }
        };
        buf.check()?;
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(request: &Request) -> Vec<u8> {
        let mut buf = Buffer::new();
        request.write(&mut buf);
        buf.check().unwrap();
        buf.into_bytes()
    }

    fn round_trip(request: &Request) -> Request {
        let bytes = encode(request);
        Request::parse(request.opcode(), &mut Buffer::from_bytes(bytes)).unwrap()
    }

    #[test]
    fn test_plain_query_encoding() {
        let q = "select * from system.local";
        let request = Request::Query(Statement::new(q, Consistency::One));

        let mut expected = Buffer::new();
        expected.write_long_string(q);
        expected.write_short(1);
        expected.write_byte(0);
        assert_eq!(encode(&request), expected.bytes());
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn test_flags_are_derived() {
        let mut params = QueryParams::with_consistency(Consistency::Quorum);
        assert_eq!(params.flags(), 0);

        params.values = vec![Value::Set(vec![1]), Value::Null, Value::Unset];
        assert_eq!(params.flags(), query_flags::VALUES);

        params.names = vec!["a".into(), "b".into(), "c".into()];
        params.page_size = Some(100);
        params.paging_state = Some(vec![9, 9]);
        params.serial_consistency = Some(Consistency::LocalSerial);
        params.default_timestamp = Some(1_700_000_000_000_000);
        params.skip_metadata = true;
        assert_eq!(params.flags(), 0x7f);

        let request = Request::Execute(Execute {
            id: vec![0xca, 0xfe],
            params,
        });
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn test_names_without_values_do_not_set_flag() {
        let params = QueryParams {
            names: vec!["a".into()],
            ..Default::default()
        };
        assert_eq!(params.flags(), 0);
    }

    #[test]
    fn test_startup_keeps_option_order() {
        let startup = Startup::new(Some("lz4"));
        assert_eq!(startup.option("COMPRESSION"), Some("lz4"));
        let request = Request::Startup(startup);
        let bytes = encode(&request);
        // map length 2, then CQL_VERSION as the first key
        assert_eq!(&bytes[..2], &[0, 2]);
        assert_eq!(&bytes[4..15], b"CQL_VERSION");
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn test_batch_round_trip() {
        let mut batch = Batch::new(BatchType::Unlogged, Consistency::LocalQuorum);
        batch.statements.push(BatchStatement {
            query: BatchQuery::Query("INSERT INTO t (k) VALUES (?)".into()),
            values: vec![Value::Set(vec![0, 0, 0, 1])],
        });
        batch.statements.push(BatchStatement {
            query: BatchQuery::Prepared(vec![1, 2, 3]),
            values: vec![],
        });
        batch.serial_consistency = Some(Consistency::Serial);
        batch.default_timestamp = Some(42);
        let request = Request::Batch(batch);
        assert_eq!(round_trip(&request), request);
    }

    #[test]
    fn test_register_and_auth() {
        let register = Request::Register(vec![EventType::TopologyChange, EventType::SchemaChange]);
        assert_eq!(round_trip(&register), register);

        let auth = Request::AuthResponse(Some(b"\0cassandra\0cassandra".to_vec()));
        assert_eq!(round_trip(&auth), auth);
        assert_eq!(round_trip(&Request::Options), Request::Options);
    }

    #[test]
    fn test_response_opcode_is_not_a_request() {
        let err = Request::parse(Opcode::Ready, &mut Buffer::new()).unwrap_err();
        assert!(matches!(err, DriverError::Protocol(_)));
    }
}
