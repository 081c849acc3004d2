//! Retry decisions after a failed attempt
//!
//! A [`RetryPolicy`] hands out one [`RetryDecider`] per request. The decider
//! is stateful across the attempts of that request so "retry once" rules
//! hold no matter how many nodes the plan has.

use std::fmt::Debug;

use crate::error::{DriverError, ErrorKind};
use crate::frame::{Consistency, ErrorDetails, WriteType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    DontRetry,
    RetrySameNode,
    RetryNextNode,
}

#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub error: &'a DriverError,
    pub idempotent: bool,
    pub consistency: Consistency,
}

pub trait RetryDecider: Send {
    fn decide(&mut self, request: &RequestInfo<'_>) -> RetryDecision;
}

pub trait RetryPolicy: Send + Sync + Debug {
    fn decider(&self) -> Box<dyn RetryDecider>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn decider(&self) -> Box<dyn RetryDecider> {
        Box::new(DefaultRetryDecider::new())
    }
}

#[derive(Debug, Default)]
pub struct DefaultRetryDecider {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetryDecider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RetryDecider for DefaultRetryDecider {
    fn decide(&mut self, request: &RequestInfo<'_>) -> RetryDecision {
        match request.error.kind() {
            ErrorKind::Syntax
            | ErrorKind::Invalid
            | ErrorKind::AlreadyExists
            | ErrorKind::FuncFailure
            | ErrorKind::Credentials
            | ErrorKind::Unauthorized
            | ErrorKind::Config
            | ErrorKind::Unprepared => RetryDecision::DontRetry,

            ErrorKind::Overloaded | ErrorKind::Truncate | ErrorKind::Server | ErrorKind::Io => {
                if request.idempotent {
                    RetryDecision::RetryNextNode
                } else {
                    RetryDecision::DontRetry
                }
            }

            ErrorKind::IsBootstrapping => RetryDecision::RetryNextNode,

            ErrorKind::Unavailable => {
                if self.was_unavailable_retry {
                    RetryDecision::DontRetry
                } else {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextNode
                }
            }

            ErrorKind::ReadTimeout => {
                let enough_data = matches!(
                    request.error.as_server().map(|e| &e.details),
                    Some(ErrorDetails::ReadTimeout {
                        received,
                        block_for,
                        data_present: true,
                        ..
                    }) if received >= block_for
                );
                if enough_data && !self.was_read_timeout_retry {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameNode
                } else {
                    RetryDecision::DontRetry
                }
            }

            ErrorKind::WriteTimeout => {
                let batch_log = matches!(
                    request.error.as_server().map(|e| &e.details),
                    Some(ErrorDetails::WriteTimeout {
                        write_type: WriteType::BatchLog,
                        ..
                    })
                );
                if batch_log && request.idempotent && !self.was_write_timeout_retry {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameNode
                } else {
                    RetryDecision::DontRetry
                }
            }

            ErrorKind::StreamsExhausted | ErrorKind::NoConnection => RetryDecision::RetryNextNode,

            ErrorKind::Other => RetryDecision::DontRetry,
        }
    }
}

/// Never retries
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl FallthroughRetryPolicy {
    pub fn new() -> Self {
        Self
    }
}

struct FallthroughRetryDecider;

impl RetryDecider for FallthroughRetryDecider {
    fn decide(&mut self, _request: &RequestInfo<'_>) -> RetryDecision {
        RetryDecision::DontRetry
    }
}

impl RetryPolicy for FallthroughRetryPolicy {
    fn decider(&self) -> Box<dyn RetryDecider> {
        Box::new(FallthroughRetryDecider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{CqlError, ErrorCode};
    use std::net::SocketAddr;
    use std::time::Duration;

    fn server(code: ErrorCode) -> DriverError {
        DriverError::Server(CqlError::new(code, "test"))
    }

    fn read_timeout(received: i32, block_for: i32, data_present: bool) -> DriverError {
        DriverError::Server(CqlError::new(ErrorCode::ReadTimeout, "timeout").with_details(
            ErrorDetails::ReadTimeout {
                consistency: Consistency::Quorum,
                received,
                block_for,
                data_present,
            },
        ))
    }

    fn write_timeout(write_type: WriteType) -> DriverError {
        DriverError::Server(CqlError::new(ErrorCode::WriteTimeout, "timeout").with_details(
            ErrorDetails::WriteTimeout {
                consistency: Consistency::Quorum,
                received: 1,
                block_for: 2,
                write_type,
            },
        ))
    }

    fn decide(
        decider: &mut DefaultRetryDecider,
        error: &DriverError,
        idempotent: bool,
    ) -> RetryDecision {
        decider.decide(&RequestInfo {
            error,
            idempotent,
            consistency: Consistency::Quorum,
        })
    }

    #[test]
    fn test_never_retried_errors() {
        for code in [
            ErrorCode::Syntax,
            ErrorCode::Invalid,
            ErrorCode::AlreadyExists,
            ErrorCode::FuncFailure,
            ErrorCode::Credentials,
            ErrorCode::Unauthorized,
            ErrorCode::Config,
            ErrorCode::Unprepared,
        ] {
            let mut decider = DefaultRetryDecider::new();
            assert_eq!(decide(&mut decider, &server(code), true), RetryDecision::DontRetry);
            assert_eq!(decide(&mut decider, &server(code), false), RetryDecision::DontRetry);
        }
    }

    #[test]
    fn test_idempotent_only_errors() {
        let errors = [
            server(ErrorCode::Overloaded),
            server(ErrorCode::Truncate),
            server(ErrorCode::Server),
            DriverError::Io("reset".into()),
            DriverError::ConnectionClosed,
            DriverError::Timeout(Duration::from_secs(1)),
        ];
        for error in &errors {
            let mut decider = DefaultRetryDecider::new();
            assert_eq!(decide(&mut decider, error, true), RetryDecision::RetryNextNode);
            assert_eq!(decide(&mut decider, error, true), RetryDecision::RetryNextNode);
            assert_eq!(decide(&mut decider, error, false), RetryDecision::DontRetry);
        }
    }

    #[test]
    fn test_bootstrapping_always_next_node() {
        let mut decider = DefaultRetryDecider::new();
        let error = server(ErrorCode::IsBootstrapping);
        assert_eq!(decide(&mut decider, &error, false), RetryDecision::RetryNextNode);
        assert_eq!(decide(&mut decider, &error, false), RetryDecision::RetryNextNode);
    }

    #[test]
    fn test_unavailable_once() {
        let mut decider = DefaultRetryDecider::new();
        let error = server(ErrorCode::Unavailable);
        assert_eq!(decide(&mut decider, &error, false), RetryDecision::RetryNextNode);
        assert_eq!(decide(&mut decider, &error, false), RetryDecision::DontRetry);
    }

    #[test]
    fn test_read_timeout() {
        let mut decider = DefaultRetryDecider::new();
        let error = read_timeout(2, 2, true);
        assert_eq!(decide(&mut decider, &error, false), RetryDecision::RetrySameNode);
        assert_eq!(decide(&mut decider, &error, false), RetryDecision::DontRetry);

        let mut decider = DefaultRetryDecider::new();
        let stop = RetryDecision::DontRetry;
        assert_eq!(decide(&mut decider, &read_timeout(2, 2, false), true), stop);
        assert_eq!(decide(&mut decider, &read_timeout(1, 2, true), true), stop);
        assert_eq!(decide(&mut decider, &server(ErrorCode::ReadTimeout), true), stop);
    }

    #[test]
    fn test_write_timeout() {
        let mut decider = DefaultRetryDecider::new();
        let batch_log = write_timeout(WriteType::BatchLog);
        assert_eq!(decide(&mut decider, &batch_log, false), RetryDecision::DontRetry);
        assert_eq!(decide(&mut decider, &batch_log, true), RetryDecision::RetrySameNode);
        assert_eq!(decide(&mut decider, &batch_log, true), RetryDecision::DontRetry);

        let mut decider = DefaultRetryDecider::new();
        let simple = write_timeout(WriteType::Simple);
        assert_eq!(decide(&mut decider, &simple, true), RetryDecision::DontRetry);
    }

    #[test]
    fn test_local_failures_move_on() {
        let mut decider = DefaultRetryDecider::new();
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        assert_eq!(
            decide(&mut decider, &DriverError::StreamsExhausted(8), false),
            RetryDecision::RetryNextNode
        );
        assert_eq!(
            decide(&mut decider, &DriverError::NoConnection(addr), false),
            RetryDecision::RetryNextNode
        );
        assert_eq!(
            decide(&mut decider, &DriverError::Protocol("bad".into()), true),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn test_fallthrough() {
        let mut decider = FallthroughRetryPolicy::new().decider();
        let error = server(ErrorCode::IsBootstrapping);
        let info = RequestInfo {
            error: &error,
            idempotent: true,
            consistency: Consistency::One,
        };
        assert_eq!(decider.decide(&info), RetryDecision::DontRetry);
    }
}
