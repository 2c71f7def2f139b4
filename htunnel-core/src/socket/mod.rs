use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::Error;

mod acceptor;
mod connector;

pub use acceptor::Acceptor;
pub use connector::connect;

/// Largest payload one UDP datagram can carry.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Transport protocol of a forwarded connection.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("TCP"),
            Protocol::Udp => f.write_str("UDP"),
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else if s.eq_ignore_ascii_case("udp") {
            Ok(Protocol::Udp)
        } else {
            Err(Error::InvalidProtocol(s.to_string()))
        }
    }
}

/// A `host:port` pair naming the target of a forwarded connection.
///
/// The host is resolved only when the outbound socket is opened, so names that
/// are meaningful on the remote machine only (`localhost`, LAN names) work.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RemoteAddress {
    host: String,
    port: u16,
}

impl RemoteAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub async fn resolve(&self) -> io::Result<SocketAddr> {
        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }
        tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {}", self.host),
                )
            })
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(value: SocketAddr) -> Self {
        Self::new(value.ip().to_string(), value.port())
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for RemoteAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidAddress(s.to_string());
        let (host, port) = s.trim().rsplit_once(':').ok_or_else(invalid)?;
        // IPv6 literals must be bracketed
        let host = match host.strip_prefix('[') {
            Some(inner) => {
                let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
                inner.parse::<Ipv6Addr>().map_err(|_| invalid())?;
                inner
            }
            None if host.contains(':') => return Err(invalid()),
            None => host,
        };
        if host.is_empty() || host.chars().any(|c| c.is_whitespace() || c == '/') {
            return Err(invalid());
        }
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        if port == 0 {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

/// A connected socket driven by readiness, the way tokio exposes `TcpStream`
/// and `UdpSocket`.
///
/// `try_read` returning `Ok(0)` means end of stream. `try_read`/`try_write`
/// return `WouldBlock` when the socket is not ready; callers then wait on
/// `readable`/`writable`.
#[async_trait]
pub trait SocketStream: Send + Sync + 'static {
    async fn readable(&self) -> io::Result<()>;
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn writable(&self) -> io::Result<()>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
    fn peer_addr(&self) -> io::Result<SocketAddr>;
    /// Size of the largest single message for message oriented sockets. A
    /// read into a smaller buffer loses the rest of the message.
    fn max_message_size(&self) -> Option<usize> {
        None
    }
}

pub type BoxSocketStream = Box<dyn SocketStream>;

pub struct TcpSocketStream(TcpStream);

impl TcpSocketStream {
    pub fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay {e:?}");
        }
        Self(stream)
    }
}

#[async_trait]
impl SocketStream for TcpSocketStream {
    async fn readable(&self) -> io::Result<()> {
        self.0.readable().await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }

    async fn writable(&self) -> io::Result<()> {
        self.0.writable().await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }
}

/// A UDP socket connected to a single peer. Every read is one datagram and
/// every write sends one datagram, so message boundaries survive the tunnel.
pub struct UdpSocketStream(UdpSocket);

impl UdpSocketStream {
    pub fn new(socket: UdpSocket) -> Self {
        Self(socket)
    }
}

#[async_trait]
impl SocketStream for UdpSocketStream {
    async fn readable(&self) -> io::Result<()> {
        self.0.readable().await
    }

    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.try_recv(buf) {
            // an empty datagram is not end of stream
            Ok(0) => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            rs => rs,
        }
    }

    async fn writable(&self) -> io::Result<()> {
        self.0.writable().await
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_send(buf)
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.0.peer_addr()
    }

    fn max_message_size(&self) -> Option<usize> {
        Some(MAX_DATAGRAM_SIZE)
    }
}

pub(crate) fn create_tcp_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = if addr.is_ipv6() {
        let socket = socket2::Socket::new(socket2::Domain::IPV6, socket2::Type::STREAM, None)?;
        socket.set_only_v6(false)?;
        socket
    } else {
        socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None)?
    };
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Binds a UDP socket that can share its port with sockets connected to
/// individual peers.
pub(crate) fn bind_udp(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )?;
        socket.set_only_v6(false)?;
        socket
    };
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if let Err(e) = socket.set_reuse_port(true) {
        log::warn!("set_reuse_port {:?}", e)
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Address of the interface carrying the default route. No packet is sent.
pub async fn local_ipv4() -> io::Result<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect("8.8.8.8:80").await?;
    let addr = socket.local_addr()?;
    match addr.ip() {
        IpAddr::V4(ip) => Ok(ip),
        IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
    }
}
