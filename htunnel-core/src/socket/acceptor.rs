use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, UdpSocket};

use crate::socket::{
    bind_udp, create_tcp_listener, BoxSocketStream, Protocol, TcpSocketStream, UdpSocketStream,
};

/// Listens on the local side of a forward and hands out one stream per
/// incoming connection.
///
/// For UDP every new source address is treated as a connection: the listening
/// socket is connected to that source and becomes the stream, and a fresh
/// socket is bound on the same port for the next source.
pub enum Acceptor {
    Tcp(TcpListener),
    Udp(UdpAcceptor),
}

pub struct UdpAcceptor {
    local_addr: SocketAddr,
    socket: Option<UdpSocket>,
}

impl Acceptor {
    pub async fn bind(addr: SocketAddr, protocol: Protocol) -> io::Result<Acceptor> {
        match protocol {
            Protocol::Tcp => {
                let listener = TcpListener::from_std(create_tcp_listener(addr)?)?;
                Ok(Acceptor::Tcp(listener))
            }
            Protocol::Udp => {
                let socket = UdpSocket::from_std(bind_udp(addr)?)?;
                Ok(Acceptor::Udp(UdpAcceptor {
                    local_addr: socket.local_addr()?,
                    socket: Some(socket),
                }))
            }
        }
    }
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Acceptor::Tcp(listener) => listener.local_addr(),
            Acceptor::Udp(udp) => Ok(udp.local_addr),
        }
    }
    pub async fn accept(&mut self) -> io::Result<(BoxSocketStream, SocketAddr)> {
        match self {
            Acceptor::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Box::new(TcpSocketStream::new(stream)), addr))
            }
            Acceptor::Udp(udp) => udp.accept().await,
        }
    }
}

impl UdpAcceptor {
    /// Cancel safe: the listening socket stays in place until a source has
    /// been seen.
    async fn accept(&mut self) -> io::Result<(BoxSocketStream, SocketAddr)> {
        let socket = match self.socket.take() {
            Some(socket) => socket,
            None => UdpSocket::from_std(bind_udp(self.local_addr)?)?,
        };
        let from = self.socket.insert(socket).peek_sender().await?;
        let Some(socket) = self.socket.take() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        socket.connect(from).await?;
        match bind_udp(self.local_addr).and_then(UdpSocket::from_std) {
            Ok(next) => {
                self.socket.replace(next);
            }
            Err(e) => {
                // retried on the next accept
                log::warn!("rebind udp {} {e:?}", self.local_addr);
            }
        }
        Ok((Box::new(UdpSocketStream::new(socket)), from))
    }
}
