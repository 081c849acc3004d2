//! Byte-stream transport, multiplexed connections and per-node pools

pub mod auth;
pub mod connection;
pub mod pool;
pub mod shard;
pub mod stream;

use std::fmt::Debug;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;

use crate::error::{DriverError, DriverResult};

pub use auth::{Authenticator, PasswordAuthenticator};
pub use connection::{CloseNotice, Connection, ConnectionState};
pub use pool::ConnPool;
pub use shard::{ShardInfo, ShardPortIterator, Sharder};
pub use stream::StreamIdAllocator;

/// A full-duplex byte stream a connection runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to nodes
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Connect to `addr`, binding the local side to `source_port` when given
    async fn connect(
        &self,
        addr: SocketAddr,
        source_port: Option<u16>,
    ) -> DriverResult<BoxedStream>;
}

/// Plain TCP with `TCP_NODELAY`
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn bind_error(err: std::io::Error, source_port: u16) -> DriverError {
    match err.kind() {
        std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AddrNotAvailable
            if source_port != 0 =>
        {
            DriverError::SourcePortUnavailable(source_port)
        }
        _ => err.into(),
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        addr: SocketAddr,
        source_port: Option<u16>,
    ) -> DriverResult<BoxedStream> {
        // Port 0 lets the kernel pick an ephemeral port
        let port = source_port.unwrap_or(0);
        let socket = match addr {
            SocketAddr::V4(_) => {
                let socket = TcpSocket::new_v4()?;
                socket
                    .bind(SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port))
                    .map_err(|e| bind_error(e, port))?;
                socket
            }
            SocketAddr::V6(_) => {
                let socket = TcpSocket::new_v6()?;
                socket
                    .bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), port))
                    .map_err(|e| bind_error(e, port))?;
                socket
            }
        };

        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| DriverError::Timeout(self.connect_timeout))?
            .map_err(|e| bind_error(e, port))?;
        stream.set_nodelay(true)?;
        tracing::trace!("TCP connection to {} established", addr);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut stream = TcpConnector::default().connect(addr, None).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = TcpConnector::default().connect(addr, None).await.err().unwrap();
        assert!(matches!(err, DriverError::Io(_)));
    }

    #[test]
    fn test_bind_error_mapping() {
        let in_use = std::io::Error::from(std::io::ErrorKind::AddrInUse);
        assert!(matches!(
            bind_error(in_use, 50000),
            DriverError::SourcePortUnavailable(50000)
        ));
        let other = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(bind_error(other, 50000), DriverError::Io(_)));
    }
}
