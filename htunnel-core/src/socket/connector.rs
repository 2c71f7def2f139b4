use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};

use crate::socket::{BoxSocketStream, Protocol, RemoteAddress, TcpSocketStream, UdpSocketStream};

/// Opens the outbound socket of a lane. The host is resolved here, on the
/// machine that owns the target.
pub async fn connect(
    addr: &RemoteAddress,
    protocol: Protocol,
    timeout: Duration,
) -> io::Result<BoxSocketStream> {
    match tokio::time::timeout(timeout, connect0(addr, protocol)).await {
        Ok(rs) => rs,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connect {addr} timeout"),
        )),
    }
}

async fn connect0(addr: &RemoteAddress, protocol: Protocol) -> io::Result<BoxSocketStream> {
    let target = addr.resolve().await?;
    match protocol {
        Protocol::Tcp => {
            let stream = TcpStream::connect(target).await?;
            Ok(Box::new(TcpSocketStream::new(stream)))
        }
        Protocol::Udp => {
            let bind: SocketAddr = if target.is_ipv4() {
                "0.0.0.0:0".parse().map_err(io::Error::other)?
            } else {
                "[::]:0".parse().map_err(io::Error::other)?
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(target).await?;
            Ok(Box::new(UdpSocketStream::new(socket)))
        }
    }
}
