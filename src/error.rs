use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::frame::buffer::BufferError;
use crate::frame::error::{CqlError, ErrorCode};
use crate::frame::value::{TypeMismatch, ValueError};

#[derive(Error, Debug, Clone)]
pub enum DriverError {
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server error: {0}")]
    Server(#[from] CqlError),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("All {0} stream ids are in use")]
    StreamsExhausted(usize),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    TypeMismatch(#[from] TypeMismatch),

    #[error("Invalid value: {0}")]
    Value(#[from] ValueError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("No connection available to {0}")]
    NoConnection(SocketAddr),

    #[error("Source port {0} is unavailable")]
    SourcePortUnavailable(u16),

    #[error("No hosts available in the query plan")]
    NoHosts,

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

impl From<std::io::Error> for DriverError {
    fn from(err: std::io::Error) -> Self {
        DriverError::Io(err.to_string())
    }
}

/// Error classes the retry decision table is keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Syntax,
    Invalid,
    AlreadyExists,
    FuncFailure,
    Credentials,
    Unauthorized,
    Config,
    Unprepared,
    Overloaded,
    Truncate,
    Server,
    Io,
    IsBootstrapping,
    Unavailable,
    ReadTimeout,
    WriteTimeout,
    StreamsExhausted,
    NoConnection,
    Other,
}

impl DriverError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DriverError::Server(err) => match err.code {
                ErrorCode::Syntax => ErrorKind::Syntax,
                ErrorCode::Invalid => ErrorKind::Invalid,
                ErrorCode::AlreadyExists => ErrorKind::AlreadyExists,
                ErrorCode::FuncFailure => ErrorKind::FuncFailure,
                ErrorCode::Credentials => ErrorKind::Credentials,
                ErrorCode::Unauthorized => ErrorKind::Unauthorized,
                ErrorCode::Config => ErrorKind::Config,
                ErrorCode::Unprepared => ErrorKind::Unprepared,
                ErrorCode::Overloaded => ErrorKind::Overloaded,
                ErrorCode::Truncate => ErrorKind::Truncate,
                ErrorCode::Server => ErrorKind::Server,
                ErrorCode::IsBootstrapping => ErrorKind::IsBootstrapping,
                ErrorCode::Unavailable => ErrorKind::Unavailable,
                ErrorCode::ReadTimeout => ErrorKind::ReadTimeout,
                ErrorCode::WriteTimeout => ErrorKind::WriteTimeout,
                _ => ErrorKind::Other,
            },
            DriverError::Io(_) | DriverError::ConnectionClosed | DriverError::Timeout(_) => {
                ErrorKind::Io
            }
            DriverError::StreamsExhausted(_) => ErrorKind::StreamsExhausted,
            DriverError::NoConnection(_) => ErrorKind::NoConnection,
            _ => ErrorKind::Other,
        }
    }

    /// The server error carried by this error, if any
    pub fn as_server(&self) -> Option<&CqlError> {
        match self {
            DriverError::Server(err) => Some(err),
            _ => None,
        }
    }
}
