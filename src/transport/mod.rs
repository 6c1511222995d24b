//! Transport Layer
//!
//! The broker runs over any bidirectional byte stream. A stream is split into
//! an owned read half (driven by the connection's read task) and a write half
//! (shared by the workers behind the connection's write lock).

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Any stream the broker can speak MQTT over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local and remote address of a transport, when it has them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Endpoints {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

impl Endpoints {
    pub fn of_tcp(stream: &TcpStream) -> Self {
        Self {
            local: stream.local_addr().ok(),
            remote: stream.peer_addr().ok(),
        }
    }
}

/// Split a stream into independently owned halves
pub fn split<T: Transport>(stream: T) -> (BoxedReader, BoxedWriter) {
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP nodelay
    pub tcp_nodelay: bool,
    /// TCP keepalive
    pub tcp_keepalive: Option<Duration>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

/// Configure a TCP stream
pub fn configure_stream(stream: &TcpStream, config: &TransportConfig) -> io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;

    if let Some(time) = config.tcp_keepalive {
        let sock_ref = socket2::SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(time);
        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}
