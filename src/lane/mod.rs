//! One forwarded connection: a socket bridged to a data channel.
//!
//! Every lane runs as its own task. The owning session talks to it through
//! [`LaneCommand`]s and learns about it through [`LaneEvent`]s; a lane never
//! touches the control channel or the lane table itself.

use std::future::Future;
use std::io;
use std::pin::Pin;

use bytes::{Buf, Bytes};
use htunnel_core::socket::{connect, BoxSocketStream, Protocol, RemoteAddress};
use htunnel_core::transport::{ChannelRef, TrySendError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

use crate::config::LaneConfig;

mod name;
mod pending;
mod slot;

pub use name::ChannelName;
pub use pending::PendingWriteQueue;
pub use slot::Slot;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Created for a socket accepted on this side.
    LocalInitiated,
    /// Created for a channel the peer opened; the socket is connected here.
    RemoteInitiated,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CloseReason {
    SocketEof,
    SocketError(io::ErrorKind),
    ChannelClosed,
    /// The peer sent `DeleteChannel`.
    RemoteDelete,
    Overflow,
    ConnectFailed,
    SessionClosed,
}

impl CloseReason {
    /// The peer is done sending, so queued bytes are still worth writing.
    fn drains(&self) -> bool {
        matches!(self, CloseReason::RemoteDelete | CloseReason::ChannelClosed)
    }
}

pub enum LaneCommand {
    Connect {
        target: RemoteAddress,
        protocol: Protocol,
    },
    Attach(BoxSocketStream),
    /// A message received on the lane's channel.
    Message(Bytes),
    /// The `ServerSideReady` handshake completed.
    Ready,
    Close(CloseReason),
}

pub struct LaneExit {
    pub name: ChannelName,
    pub direction: Direction,
    pub reason: CloseReason,
    pub closed_by_remote: bool,
    /// Released by the session once `DeleteChannel` went out.
    pub channel: Option<ChannelRef>,
}

pub enum LaneEvent {
    /// The outbound socket of a remote initiated lane is attached.
    Connected(ChannelName),
    Exited(LaneExit),
}

type Connecting = Pin<Box<dyn Future<Output = io::Result<BoxSocketStream>> + Send>>;

pub struct Lane {
    name: ChannelName,
    direction: Direction,
    config: LaneConfig,
    channel: Slot<ChannelRef>,
    socket: Slot<BoxSocketStream>,
    pending: PendingWriteQueue,
    /// Message the channel refused while full.
    outbound: Option<Bytes>,
    connecting: Option<Connecting>,
    ready: bool,
    closing: Option<CloseReason>,
    closed_by_remote: bool,
    buf: Vec<u8>,
    inbox: UnboundedReceiver<LaneCommand>,
    events: UnboundedSender<LaneEvent>,
}

pub struct LaneHandle {
    name: ChannelName,
    direction: Direction,
    sender: UnboundedSender<LaneCommand>,
    /// Set when the peer asked for the close, suppresses `DeleteChannel`.
    pub closed_by_remote: bool,
    task: JoinHandle<()>,
}

impl LaneHandle {
    pub fn name(&self) -> ChannelName {
        self.name
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn send(&self, command: LaneCommand) -> bool {
        self.sender.send(command).is_ok()
    }
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            log::warn!("lane {} task {e:?}", self.name);
        }
    }
}

impl Lane {
    pub fn spawn(
        name: ChannelName,
        direction: Direction,
        channel: ChannelRef,
        socket: Option<BoxSocketStream>,
        config: LaneConfig,
        events: UnboundedSender<LaneEvent>,
    ) -> LaneHandle {
        let (sender, inbox) = mpsc::unbounded_channel();
        let mut lane = Lane {
            name,
            direction,
            pending: PendingWriteQueue::new(config.pending_queue_cap),
            buf: vec![0; config.read_buffer_size],
            config,
            channel: Slot::new(Some(channel)),
            socket: Slot::new(socket),
            outbound: None,
            connecting: None,
            ready: false,
            closing: None,
            closed_by_remote: false,
            inbox,
            events,
        };
        lane.fit_read_buffer();
        let task = tokio::spawn(lane.run());
        LaneHandle {
            name,
            direction,
            sender,
            closed_by_remote: false,
            task,
        }
    }

    async fn run(mut self) {
        log::debug!("lane {} {:?} started", self.name, self.direction);
        while self.closing.is_none() {
            let can_read = self.ready && self.socket.is_attached() && self.outbound.is_none();
            let can_flush = self.socket.is_attached() && !self.pending.is_empty();
            let blocked = self.outbound.is_some();
            let is_connecting = self.connecting.is_some();
            tokio::select! {
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle(command),
                    None => self.close(CloseReason::SessionClosed),
                },
                rs = socket_readable(&self.socket), if can_read => match rs {
                    Ok(()) => self.read_socket(),
                    Err(e) => self.close(CloseReason::SocketError(e.kind())),
                },
                rs = channel_writable(&self.channel), if blocked => match rs {
                    Ok(()) => {
                        if let Some(data) = self.outbound.take() {
                            self.send_channel(data);
                        }
                    }
                    Err(_) => self.close(CloseReason::ChannelClosed),
                },
                rs = socket_writable(&self.socket), if can_flush => match rs {
                    Ok(()) => self.flush_pending(),
                    Err(e) => self.close(CloseReason::SocketError(e.kind())),
                },
                rs = connecting(&mut self.connecting), if is_connecting => {
                    self.connecting = None;
                    self.on_connected(rs);
                }
            }
        }
        self.finish().await;
    }

    fn handle(&mut self, command: LaneCommand) {
        match command {
            LaneCommand::Connect { target, protocol } => {
                if self.socket.is_attached() || self.connecting.is_some() {
                    log::warn!("lane {} is already connecting", self.name);
                    return;
                }
                log::info!("lane {} connecting {protocol} {target}", self.name);
                let timeout = self.config.connect_timeout;
                self.connecting = Some(Box::pin(async move {
                    connect(&target, protocol, timeout).await
                }));
            }
            LaneCommand::Attach(socket) => {
                self.attach(socket);
            }
            LaneCommand::Message(data) => self.write_socket(data),
            LaneCommand::Ready => {
                log::debug!("lane {} ready", self.name);
                self.ready = true;
            }
            LaneCommand::Close(reason) => {
                if reason == CloseReason::RemoteDelete {
                    self.closed_by_remote = true;
                }
                self.close(reason);
            }
        }
    }

    fn attach(&mut self, socket: BoxSocketStream) -> bool {
        match self.socket.attach(socket) {
            Ok(()) => {
                self.fit_read_buffer();
                true
            }
            Err(_socket) => {
                log::warn!("lane {} refused a second socket", self.name);
                false
            }
        }
    }

    /// A datagram socket delivers whole messages only, so the buffer has to
    /// hold the largest one.
    fn fit_read_buffer(&mut self) {
        let required = self
            .socket
            .get()
            .and_then(|socket| socket.max_message_size())
            .unwrap_or(0);
        if self.buf.len() < required {
            self.buf.resize(required, 0);
        }
    }

    fn on_connected(&mut self, rs: io::Result<BoxSocketStream>) {
        match rs {
            Ok(socket) => {
                if self.attach(socket) {
                    let _ = self.events.send(LaneEvent::Connected(self.name));
                }
            }
            Err(e) => {
                log::warn!("lane {} connect failed {e:?}", self.name);
                self.close(CloseReason::ConnectFailed);
            }
        }
    }

    fn close(&mut self, reason: CloseReason) {
        if self.closing.is_none() {
            self.closing = Some(reason);
        }
    }

    fn read_socket(&mut self) {
        let Some(socket) = self.socket.get() else {
            return;
        };
        match socket.try_read(&mut self.buf) {
            Ok(0) => self.close(CloseReason::SocketEof),
            Ok(n) => {
                let data = Bytes::copy_from_slice(&self.buf[..n]);
                self.send_channel(data);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.close(CloseReason::SocketError(e.kind())),
        }
    }

    fn send_channel(&mut self, data: Bytes) {
        let Some(channel) = self.channel.get() else {
            self.close(CloseReason::ChannelClosed);
            return;
        };
        match channel.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => self.outbound = Some(data),
            Err(TrySendError::Closed) => self.close(CloseReason::ChannelClosed),
        }
    }

    fn write_socket(&mut self, mut data: Bytes) {
        if data.is_empty() {
            return;
        }
        if !self.pending.is_empty() {
            return self.enqueue(data);
        }
        let Some(socket) = self.socket.get() else {
            return self.enqueue(data);
        };
        loop {
            match socket.try_write(&data) {
                Ok(n) if n >= data.len() => return,
                Ok(0) => {
                    return self.close(CloseReason::SocketError(io::ErrorKind::WriteZero));
                }
                Ok(n) => data.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return self.enqueue(data),
                Err(e) => return self.close(CloseReason::SocketError(e.kind())),
            }
        }
    }

    fn enqueue(&mut self, data: Bytes) {
        if let Err(e) = self.pending.push(data) {
            log::warn!("lane {} {e}", self.name);
            self.close(CloseReason::Overflow);
        }
    }

    fn flush_pending(&mut self) {
        let Some(socket) = self.socket.get() else {
            return;
        };
        let rs = self.pending.flush(|buf| socket.try_write(buf));
        if let Err(e) = rs {
            self.close(CloseReason::SocketError(e.kind()));
        }
    }

    async fn drain(&mut self) {
        let timeout = self.config.drain_timeout;
        let drain = async {
            while !self.pending.is_empty() {
                let Some(socket) = self.socket.get() else {
                    return;
                };
                if socket.writable().await.is_err() {
                    return;
                }
                if self.pending.flush(|buf| socket.try_write(buf)).is_err() {
                    return;
                }
            }
        };
        if tokio::time::timeout(timeout, drain).await.is_err() {
            log::debug!("lane {} dropped {} queued bytes", self.name, self.pending.len());
        }
    }

    async fn finish(mut self) {
        let reason = self.closing.unwrap_or(CloseReason::SessionClosed);
        if reason.drains() && !self.pending.is_empty() {
            self.drain().await;
        }
        drop(self.socket.detach());
        let channel = self.channel.detach();
        log::info!(
            "lane {} closed {:?} closed_by_remote={}",
            self.name,
            reason,
            self.closed_by_remote
        );
        let _ = self.events.send(LaneEvent::Exited(LaneExit {
            name: self.name,
            direction: self.direction,
            reason,
            closed_by_remote: self.closed_by_remote,
            channel,
        }));
    }
}

async fn socket_readable(socket: &Slot<BoxSocketStream>) -> io::Result<()> {
    match socket.get() {
        Some(socket) => socket.readable().await,
        None => std::future::pending().await,
    }
}

async fn socket_writable(socket: &Slot<BoxSocketStream>) -> io::Result<()> {
    match socket.get() {
        Some(socket) => socket.writable().await,
        None => std::future::pending().await,
    }
}

async fn channel_writable(channel: &Slot<ChannelRef>) -> htunnel_core::error::Result<()> {
    match channel.get() {
        Some(channel) => channel.writable().await,
        None => std::future::pending().await,
    }
}

async fn connecting(connecting: &mut Option<Connecting>) -> io::Result<BoxSocketStream> {
    match connecting {
        Some(connecting) => connecting.await,
        None => std::future::pending().await,
    }
}
