use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::error::{Error, Result};
use crate::socket::{create_tcp_listener, local_ipv4};
use crate::transport::codec::{Frame, FrameCodec, DEFAULT_MAX_PAYLOAD, HEAD_LEN};
use crate::transport::{
    ChannelRef, DataChannel, Negotiation, Role, Transport, TransportEvent, TransportSession,
    TrySendError,
};
use crate::OwnedJoinHandle;

const DEFAULT_SEND_WINDOW: usize = 1024 * 1024;

/// Settings of the direct TCP transport.
#[derive(Clone, Debug)]
pub struct DirectConfig {
    listen_ip: IpAddr,
    advertise: Vec<IpAddr>,
    send_window: usize,
    max_payload: usize,
    establish_timeout: Duration,
    connect_timeout: Duration,
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise: Vec::new(),
            send_window: DEFAULT_SEND_WINDOW,
            max_payload: DEFAULT_MAX_PAYLOAD,
            establish_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

impl DirectConfig {
    /// Address the answerer listens on.
    pub fn set_listen_ip(mut self, listen_ip: IpAddr) -> Self {
        self.listen_ip = listen_ip;
        self
    }
    /// Addresses announced to the offerer. When empty they are guessed from
    /// the listen address.
    pub fn set_advertise(mut self, advertise: Vec<IpAddr>) -> Self {
        self.advertise = advertise;
        self
    }
    /// Bytes of channel data that may be queued for the connection before
    /// `try_send` reports the channel full.
    pub fn set_send_window(mut self, send_window: usize) -> Self {
        self.send_window = send_window.max(1);
        self
    }
    pub fn set_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }
    pub fn set_establish_timeout(mut self, establish_timeout: Duration) -> Self {
        self.establish_timeout = establish_timeout;
        self
    }
    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum DirectSignal {
    Offer {
        nonce: u64,
    },
    Answer {
        nonce: u64,
        candidates: Vec<SocketAddr>,
    },
}

/// Multiplexes channels over one TCP connection. The answerer listens and
/// sends its candidate addresses, the offerer dials them and proves the nonce
/// of the offer in its first frame.
#[derive(Clone, Default)]
pub struct DirectTransport {
    config: DirectConfig,
}

impl DirectTransport {
    pub fn new(config: DirectConfig) -> Self {
        Self { config }
    }

    async fn offer(&self, negotiation: &mut Negotiation) -> Result<TcpStream> {
        let nonce: u64 = rand::random();
        negotiation
            .signal
            .send(serde_json::to_value(DirectSignal::Offer { nonce })?)?;
        loop {
            match recv_signal(&mut negotiation.envelopes).await? {
                DirectSignal::Answer {
                    nonce: answer_nonce,
                    candidates,
                } if answer_nonce == nonce => {
                    return self.dial(nonce, candidates).await;
                }
                other => log::debug!("offerer ignores {other:?}"),
            }
        }
    }

    async fn dial(&self, nonce: u64, candidates: Vec<SocketAddr>) -> Result<TcpStream> {
        let mut hello = BytesMut::new();
        FrameCodec::new(self.config.max_payload).encode(Frame::Hello { nonce }, &mut hello)?;
        for addr in candidates {
            let mut stream =
                match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
                    .await
                {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        log::debug!("dial {addr} {e:?}");
                        continue;
                    }
                    Err(_) => {
                        log::debug!("dial {addr} timeout");
                        continue;
                    }
                };
            stream.write_all(&hello).await?;
            log::info!("direct connection to {addr}");
            return Ok(stream);
        }
        Err(Error::Negotiation("no candidate reachable".into()))
    }

    async fn answer(&self, negotiation: &mut Negotiation) -> Result<TcpStream> {
        let nonce = loop {
            match recv_signal(&mut negotiation.envelopes).await? {
                DirectSignal::Offer { nonce } => break nonce,
                other => log::debug!("answerer ignores {other:?}"),
            }
        };
        let listener =
            TcpListener::from_std(create_tcp_listener(SocketAddr::new(self.config.listen_ip, 0))?)?;
        let port = listener.local_addr()?.port();
        let candidates = self.candidates(port).await;
        log::debug!("answer candidates {candidates:?}");
        negotiation
            .signal
            .send(serde_json::to_value(DirectSignal::Answer { nonce, candidates })?)?;
        loop {
            let (mut stream, addr) = listener.accept().await?;
            let mut head = [0u8; HEAD_LEN + 8];
            match tokio::time::timeout(self.config.connect_timeout, stream.read_exact(&mut head))
                .await
            {
                Ok(Ok(_)) => {}
                _ => {
                    log::debug!("no hello from {addr}");
                    continue;
                }
            }
            let mut src = BytesMut::from(&head[..]);
            match FrameCodec::new(self.config.max_payload).decode(&mut src) {
                Ok(Some(Frame::Hello { nonce: hello })) if hello == nonce => {
                    log::info!("direct connection from {addr}");
                    return Ok(stream);
                }
                rs => log::warn!("reject {addr} {rs:?}"),
            }
        }
    }

    async fn candidates(&self, port: u16) -> Vec<SocketAddr> {
        if !self.config.advertise.is_empty() {
            return self
                .config
                .advertise
                .iter()
                .map(|ip| SocketAddr::new(*ip, port))
                .collect();
        }
        if !self.config.listen_ip.is_unspecified() {
            return vec![SocketAddr::new(self.config.listen_ip, port)];
        }
        let mut candidates = Vec::new();
        match local_ipv4().await {
            Ok(ip) if !ip.is_unspecified() => candidates.push(SocketAddr::new(ip.into(), port)),
            Ok(_) => {}
            Err(e) => log::debug!("local_ipv4 {e:?}"),
        }
        candidates.push(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port));
        candidates
    }
}

async fn recv_signal(envelopes: &mut UnboundedReceiver<serde_json::Value>) -> Result<DirectSignal> {
    loop {
        let payload = envelopes
            .recv()
            .await
            .ok_or_else(|| Error::Negotiation("signaling closed".into()))?;
        match serde_json::from_value(payload) {
            Ok(signal) => return Ok(signal),
            Err(e) => log::warn!("invalid signal payload {e:?}"),
        }
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn establish(&self, mut negotiation: Negotiation) -> Result<Box<dyn TransportSession>> {
        let role = negotiation.role;
        let connect = async {
            match role {
                Role::Offerer => self.offer(&mut negotiation).await,
                Role::Answerer => self.answer(&mut negotiation).await,
            }
        };
        let stream = match tokio::time::timeout(self.config.establish_timeout, connect).await {
            Ok(rs) => rs?,
            Err(_) => return Err(Error::Timeout),
        };
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("set_nodelay {e:?}");
        }
        Ok(Box::new(DirectSession::start(
            stream,
            negotiation.events,
            &self.config,
        )))
    }
}

struct Shared {
    frames: UnboundedSender<Frame>,
    window: Arc<Semaphore>,
    window_size: usize,
    events: UnboundedSender<TransportEvent>,
    channels: DashMap<String, Arc<DirectChannel>>,
    closed: AtomicBool,
}

impl Shared {
    fn permits_for(&self, len: usize) -> u32 {
        len.min(self.window_size) as u32
    }

    fn new_channel(self: &Arc<Self>, label: &str) -> Arc<DirectChannel> {
        Arc::new(DirectChannel {
            label: label.to_string(),
            closed: AtomicBool::new(false),
            shared: Arc::downgrade(self),
        })
    }

    fn remote_open(self: &Arc<Self>, label: String) {
        match self.channels.entry(label.clone()) {
            Entry::Occupied(_) => {
                log::warn!("remote opened {label} twice");
            }
            Entry::Vacant(entry) => {
                let channel = self.new_channel(&label);
                entry.insert(channel.clone());
                let _ = self.events.send(TransportEvent::ChannelOpened(channel));
            }
        }
    }

    fn remote_close(&self, label: &str) {
        if let Some((_, channel)) = self.channels.remove(label) {
            if !channel.closed.swap(true, Ordering::AcqRel) {
                let _ = self
                    .events
                    .send(TransportEvent::ChannelClosed(label.to_string()));
            }
        }
    }

    fn shutdown(&self, notify_peer: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let labels: Vec<String> = self.channels.iter().map(|v| v.key().clone()).collect();
        for label in labels {
            self.remote_close(&label);
        }
        if notify_peer {
            let _ = self.frames.send(Frame::Bye);
        }
        self.window.close();
        let _ = self.events.send(TransportEvent::SessionClosed);
    }
}

struct DirectSession {
    shared: Arc<Shared>,
    _reader: OwnedJoinHandle,
}

impl DirectSession {
    fn start(
        stream: TcpStream,
        events: UnboundedSender<TransportEvent>,
        config: &DirectConfig,
    ) -> Self {
        let (read, write) = stream.into_split();
        let (frames, frame_receiver) = mpsc::unbounded_channel();
        let window = Arc::new(Semaphore::new(config.send_window));
        let shared = Arc::new(Shared {
            frames,
            window: window.clone(),
            window_size: config.send_window,
            events,
            channels: DashMap::new(),
            closed: AtomicBool::new(false),
        });
        let codec = FrameCodec::new(config.max_payload);
        tokio::spawn(write_loop(
            FramedWrite::new(write, codec.clone()),
            frame_receiver,
            window,
            config.send_window,
        ));
        let reader = tokio::spawn(read_loop(
            FramedRead::new(read, codec),
            Arc::downgrade(&shared),
        ));
        Self {
            shared,
            _reader: OwnedJoinHandle::new(reader),
        }
    }
}

impl TransportSession for DirectSession {
    fn open_channel(&self, label: &str) -> Result<ChannelRef> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::SessionClosed);
        }
        let channel = match self.shared.channels.entry(label.to_string()) {
            Entry::Occupied(_) => return Err(Error::LabelInUse(label.to_string())),
            Entry::Vacant(entry) => {
                let channel = self.shared.new_channel(label);
                entry.insert(channel.clone());
                channel
            }
        };
        self.shared
            .frames
            .send(Frame::Open {
                label: label.to_string(),
            })
            .map_err(|_| Error::SessionClosed)?;
        Ok(channel)
    }

    fn close(&self) {
        self.shared.shutdown(true);
    }
}

impl Drop for DirectSession {
    fn drop(&mut self) {
        self.shared.shutdown(true);
    }
}

async fn write_loop(
    mut write: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut frames: UnboundedReceiver<Frame>,
    window: Arc<Semaphore>,
    window_size: usize,
) {
    while let Some(frame) = frames.recv().await {
        let credit = match &frame {
            Frame::Data { payload, .. } => payload.len().min(window_size),
            _ => 0,
        };
        let bye = matches!(frame, Frame::Bye);
        let rs = write.send(frame).await;
        if credit > 0 {
            window.add_permits(credit);
        }
        if let Err(e) = rs {
            log::warn!("direct write {e:?}");
            break;
        }
        if bye {
            break;
        }
    }
    if let Err(e) = write.get_mut().shutdown().await {
        log::debug!("direct write shutdown {e:?}");
    }
}

async fn read_loop(mut read: FramedRead<OwnedReadHalf, FrameCodec>, shared: Weak<Shared>) {
    while let Some(rs) = read.next().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match rs {
            Ok(Frame::Open { label }) => shared.remote_open(label),
            Ok(Frame::Data { label, payload }) => {
                if shared.channels.contains_key(&label) {
                    let _ = shared.events.send(TransportEvent::ChannelMessage {
                        label,
                        data: payload,
                    });
                } else {
                    log::debug!("data for unknown channel {label}");
                }
            }
            Ok(Frame::Close { label }) => shared.remote_close(&label),
            Ok(Frame::Bye) => break,
            Ok(Frame::Hello { .. }) => log::debug!("late hello"),
            Err(e) => {
                log::warn!("direct read {e:?}");
                break;
            }
        }
    }
    if let Some(shared) = shared.upgrade() {
        shared.shutdown(false);
    }
}

struct DirectChannel {
    label: String,
    closed: AtomicBool,
    shared: Weak<Shared>,
}

#[async_trait]
impl DataChannel for DirectChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn try_send(&self, data: Bytes) -> std::result::Result<(), TrySendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TrySendError::Closed);
        }
        let Some(shared) = self.shared.upgrade() else {
            return Err(TrySendError::Closed);
        };
        match shared.window.try_acquire_many(shared.permits_for(data.len())) {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Err(TrySendError::Full(data)),
            Err(TryAcquireError::Closed) => return Err(TrySendError::Closed),
        }
        shared
            .frames
            .send(Frame::Data {
                label: self.label.clone(),
                payload: data,
            })
            .map_err(|_| TrySendError::Closed)
    }

    async fn writable(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        let Some(shared) = self.shared.upgrade() else {
            return Err(Error::ChannelClosed);
        };
        // resolves once at least half of the window is free again
        let low_water = shared.permits_for(shared.window_size.div_ceil(2));
        let window = shared.window.clone();
        drop(shared);
        window
            .acquire_many(low_water)
            .await
            .map(drop)
            .map_err(|_| Error::SessionClosed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        shared.channels.remove(&self.label);
        let _ = shared.frames.send(Frame::Close {
            label: self.label.clone(),
        });
        let _ = shared
            .events
            .send(TransportEvent::ChannelClosed(self.label.clone()));
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
            || self
                .shared
                .upgrade()
                .map_or(true, |shared| shared.closed.load(Ordering::Acquire))
    }
}
