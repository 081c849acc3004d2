//! ERROR response body: `code int, message string, details by code`.

use std::fmt;

use super::buffer::Buffer;
use super::consistency::Consistency;
use crate::error::DriverResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Server,
    Protocol,
    Credentials,
    Unavailable,
    Overloaded,
    IsBootstrapping,
    Truncate,
    WriteTimeout,
    ReadTimeout,
    ReadFailure,
    FuncFailure,
    WriteFailure,
    Syntax,
    Unauthorized,
    Invalid,
    Config,
    AlreadyExists,
    Unprepared,
    Other(i32),
}

impl ErrorCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            0x0000 => ErrorCode::Server,
            0x000A => ErrorCode::Protocol,
            0x0100 => ErrorCode::Credentials,
            0x1000 => ErrorCode::Unavailable,
            0x1001 => ErrorCode::Overloaded,
            0x1002 => ErrorCode::IsBootstrapping,
            0x1003 => ErrorCode::Truncate,
            0x1100 => ErrorCode::WriteTimeout,
            0x1200 => ErrorCode::ReadTimeout,
            0x1300 => ErrorCode::ReadFailure,
            0x1400 => ErrorCode::FuncFailure,
            0x1500 => ErrorCode::WriteFailure,
            0x2000 => ErrorCode::Syntax,
            0x2100 => ErrorCode::Unauthorized,
            0x2200 => ErrorCode::Invalid,
            0x2300 => ErrorCode::Config,
            0x2400 => ErrorCode::AlreadyExists,
            0x2500 => ErrorCode::Unprepared,
            other => ErrorCode::Other(other),
        }
    }

    pub fn as_i32(&self) -> i32 {
        match self {
            ErrorCode::Server => 0x0000,
            ErrorCode::Protocol => 0x000A,
            ErrorCode::Credentials => 0x0100,
            ErrorCode::Unavailable => 0x1000,
            ErrorCode::Overloaded => 0x1001,
            ErrorCode::IsBootstrapping => 0x1002,
            ErrorCode::Truncate => 0x1003,
            ErrorCode::WriteTimeout => 0x1100,
            ErrorCode::ReadTimeout => 0x1200,
            ErrorCode::ReadFailure => 0x1300,
            ErrorCode::FuncFailure => 0x1400,
            ErrorCode::WriteFailure => 0x1500,
            ErrorCode::Syntax => 0x2000,
            ErrorCode::Unauthorized => 0x2100,
            ErrorCode::Invalid => 0x2200,
            ErrorCode::Config => 0x2300,
            ErrorCode::AlreadyExists => 0x2400,
            ErrorCode::Unprepared => 0x2500,
            ErrorCode::Other(code) => *code,
        }
    }
}

/// Kind of write reported by write timeouts and failures
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteType {
    Simple,
    Batch,
    UnloggedBatch,
    Counter,
    BatchLog,
    Cas,
    View,
    Cdc,
    Other(String),
}

impl WriteType {
    pub fn parse(s: &str) -> Self {
        match s {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            other => WriteType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(s) => s,
        }
    }
}

/// Code-specific trailer of an ERROR body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorDetails {
    None,
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        write_type: WriteType,
    },
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        data_present: bool,
    },
    ReadFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        data_present: bool,
    },
    FuncFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },
    WriteFailure {
        consistency: Consistency,
        received: i32,
        block_for: i32,
        num_failures: i32,
        write_type: WriteType,
    },
    AlreadyExists {
        keyspace: String,
        table: String,
    },
    Unprepared {
        id: Vec<u8>,
    },
}

/// Server error decoded from an ERROR frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CqlError {
    pub code: ErrorCode,
    pub message: String,
    pub details: ErrorDetails,
}

impl CqlError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::None,
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    pub fn parse(buf: &mut Buffer) -> DriverResult<Self> {
        let code = ErrorCode::from_i32(buf.read_int());
        let message = buf.read_string();
        let details = match code {
            ErrorCode::Unavailable => ErrorDetails::Unavailable {
                consistency: read_consistency(buf)?,
                required: buf.read_int(),
                alive: buf.read_int(),
            },
            ErrorCode::WriteTimeout => ErrorDetails::WriteTimeout {
                consistency: read_consistency(buf)?,
                received: buf.read_int(),
                block_for: buf.read_int(),
                write_type: WriteType::parse(&buf.read_string()),
            },
            ErrorCode::ReadTimeout => ErrorDetails::ReadTimeout {
                consistency: read_consistency(buf)?,
                received: buf.read_int(),
                block_for: buf.read_int(),
                data_present: buf.read_byte() != 0,
            },
            ErrorCode::ReadFailure => ErrorDetails::ReadFailure {
                consistency: read_consistency(buf)?,
                received: buf.read_int(),
                block_for: buf.read_int(),
                num_failures: buf.read_int(),
                data_present: buf.read_byte() != 0,
            },
            ErrorCode::FuncFailure => ErrorDetails::FuncFailure {
                keyspace: buf.read_string(),
                function: buf.read_string(),
                arg_types: buf.read_string_list(),
            },
            ErrorCode::WriteFailure => ErrorDetails::WriteFailure {
                consistency: read_consistency(buf)?,
                received: buf.read_int(),
                block_for: buf.read_int(),
                num_failures: buf.read_int(),
                write_type: WriteType::parse(&buf.read_string()),
            },
            ErrorCode::AlreadyExists => ErrorDetails::AlreadyExists {
                keyspace: buf.read_string(),
                table: buf.read_string(),
            },
            ErrorCode::Unprepared => ErrorDetails::Unprepared {
                id: buf.read_short_bytes(),
            },
            _ => ErrorDetails::None,
        };
        buf.check()?;
        Ok(Self {
            code,
            message,
            details,
        })
    }

    pub fn write(&self, buf: &mut Buffer) {
        buf.write_int(self.code.as_i32());
        buf.write_string(&self.message);
        match &self.details {
            ErrorDetails::None => {}
            ErrorDetails::Unavailable {
                consistency,
                required,
                alive,
            } => {
                buf.write_short(*consistency as u16);
                buf.write_int(*required);
                buf.write_int(*alive);
            }
            ErrorDetails::WriteTimeout {
                consistency,
                received,
                block_for,
                write_type,
            } => {
                buf.write_short(*consistency as u16);
                buf.write_int(*received);
                buf.write_int(*block_for);
                buf.write_string(write_type.as_str());
            }
            ErrorDetails::ReadTimeout {
                consistency,
                received,
                block_for,
                data_present,
            } => {
                buf.write_short(*consistency as u16);
                buf.write_int(*received);
                buf.write_int(*block_for);
                buf.write_byte(*data_present as u8);
            }
            ErrorDetails::ReadFailure {
                consistency,
                received,
                block_for,
                num_failures,
                data_present,
            } => {
                buf.write_short(*consistency as u16);
                buf.write_int(*received);
                buf.write_int(*block_for);
                buf.write_int(*num_failures);
                buf.write_byte(*data_present as u8);
            }
            ErrorDetails::FuncFailure {
                keyspace,
                function,
                arg_types,
            } => {
                buf.write_string(keyspace);
                buf.write_string(function);
                buf.write_string_list(arg_types);
            }
            ErrorDetails::WriteFailure {
                consistency,
                received,
                block_for,
                num_failures,
                write_type,
            } => {
                buf.write_short(*consistency as u16);
                buf.write_int(*received);
                buf.write_int(*block_for);
                buf.write_int(*num_failures);
                buf.write_string(write_type.as_str());
            }
            ErrorDetails::AlreadyExists { keyspace, table } => {
                buf.write_string(keyspace);
                buf.write_string(table);
            }
            ErrorDetails::Unprepared { id } => buf.write_short_bytes(id),
        }
    }
}

fn read_consistency(buf: &mut Buffer) -> DriverResult<Consistency> {
    let raw = buf.read_short();
    buf.check()?;
    Consistency::from_u16(raw)
}

impl fmt::Display for CqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (0x{:04x}): {}", self.code, self.code.as_i32(), self.message)
    }
}

impl std::error::Error for CqlError {}
