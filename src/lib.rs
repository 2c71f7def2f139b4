//! # htunnel
//!
//! Peer-to-peer TCP/UDP port forwarding. A server peer creates a room on a
//! signaling server; client peers join it and forward connections accepted on
//! a local port to a `host:port` reachable from the server.
//!
//! Each peer pair runs sessions over a peer-to-peer [`Transport`]; each
//! forwarded connection becomes a lane with its own data channel, negotiated
//! over the session's control channel.
//!
//! ```rust,no_run
//! use htunnel::config::{Mode, TunnelConfig};
//! use htunnel::Builder;
//!
//! # #[tokio::main]
//! # async fn main() -> htunnel::error::Result<()> {
//! let config = TunnelConfig::new(Mode::Server).set_password("secret".into());
//! let tunnel = Builder::new(config).build().await?;
//! if let Some(room_id) = tunnel.wait_room().await {
//!     println!("room {room_id}");
//! }
//! let reason = tunnel.wait().await;
//! log::info!("exit {reason:?}");
//! # Ok(())
//! # }
//! ```
//!
//! [`Transport`]: htunnel_core::transport::Transport

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_shutdown::{DelayShutdownToken, ShutdownManager};
use htunnel_core::signaling::{SignalingClient, SignalingEvent};
use htunnel_core::socket::Acceptor;
use htunnel_core::transport::{DirectConfig, DirectTransport, OutboundEnvelope, Transport};
use htunnel_core::OwnedJoinHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::{Mode, TunnelConfig};
use crate::orchestrator::Orchestrator;
use crate::session::{SessionEvent, SessionHandle};

pub mod config;
pub mod control;
pub mod error;
pub mod lane;
pub mod orchestrator;
pub mod session;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Why a tunnel stopped.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ExitReason {
    Shutdown,
    SignalingFailed(String),
}

pub struct Builder {
    config: TunnelConfig,
    transport: Option<Arc<dyn Transport>>,
}

impl Builder {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            transport: None,
        }
    }
    /// Defaults to [`DirectTransport`].
    pub fn transport<T: Transport>(mut self, transport: T) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }
    pub async fn build(self) -> error::Result<Tunnel> {
        let config = Arc::new(self.config);
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(DirectTransport::new(DirectConfig::default())),
        };
        let acceptor = match &config.mode {
            Mode::Client(target) => {
                if config.room_id.is_none() {
                    return Err(error::Error::InvalidArgument(
                        "room id is required in client mode".into(),
                    ));
                }
                let acceptor = Acceptor::bind(target.local_addr, target.protocol).await?;
                log::info!(
                    "forwarding {} {} -> {}",
                    target.protocol,
                    acceptor.local_addr()?,
                    target.remote
                );
                Some(acceptor)
            }
            Mode::Server => None,
        };
        let local_addr = match &acceptor {
            Some(acceptor) => Some(acceptor.local_addr()?),
            None => None,
        };

        let (signaling, signaling_events) = SignalingClient::connect(config.signal_server).await?;
        match (&config.mode, &config.room_id) {
            (Mode::Server, _) => signaling.create_room(&config.password)?,
            (Mode::Client(_), Some(room_id)) => signaling.sign_in(room_id, &config.password)?,
            (Mode::Client(_), None) => {}
        }

        let shutdown = ShutdownManager::<ExitReason>::new();
        let (room_sender, room) = watch::channel(None);
        let (signals, outbound) = mpsc::unbounded_channel();
        let (session_sender, session_events) = mpsc::unbounded_channel();
        let token = shutdown
            .delay_shutdown_token()
            .map_err(|_| error::Error::SessionClosed)?;
        let driver = Driver {
            orchestrator: Orchestrator::new(config.clone(), transport, signals, session_sender),
            config,
            signaling: Some(signaling),
            closing: Vec::new(),
            signaling_events,
            outbound,
            session_events,
            acceptor,
            accept_backoff: None,
            room: room_sender,
            shutdown: shutdown.clone(),
            _token: token,
        };
        let handle = tokio::spawn(driver.run());
        Ok(Tunnel {
            shutdown,
            room,
            local_addr,
            _driver: OwnedJoinHandle::new(handle),
        })
    }
}

/// A running tunnel. Dropping it stops every session abruptly; call
/// [`Tunnel::shutdown`] and [`Tunnel::wait`] for an orderly exit.
pub struct Tunnel {
    shutdown: ShutdownManager<ExitReason>,
    room: watch::Receiver<Option<String>>,
    local_addr: Option<SocketAddr>,
    _driver: OwnedJoinHandle,
}

impl Tunnel {
    pub fn room_id(&self) -> Option<String> {
        self.room.borrow().clone()
    }
    /// Resolves with the room id once joined, or `None` if the tunnel stops
    /// first.
    pub async fn wait_room(&self) -> Option<String> {
        let mut room = self.room.clone();
        let joined = async move {
            match room.wait_for(|room| room.is_some()).await {
                Ok(room) => room.clone(),
                Err(_) => None,
            }
        };
        self.shutdown.wrap_cancel(joined).await.ok().flatten()
    }
    /// Address of the local listener in client mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
    pub fn shutdown(&self) {
        _ = self.shutdown.trigger_shutdown(ExitReason::Shutdown);
    }
    /// Resolves once the tunnel stopped and every session is closed.
    pub async fn wait(&self) -> ExitReason {
        let reason = self.shutdown.wait_shutdown_triggered().await;
        self.shutdown.wait_shutdown_complete().await;
        reason
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        _ = self.shutdown.trigger_shutdown(ExitReason::Shutdown);
    }
}

struct Driver {
    config: Arc<TunnelConfig>,
    orchestrator: Orchestrator,
    signaling: Option<SignalingClient>,
    /// Sessions already told to close, awaited on stop.
    closing: Vec<SessionHandle>,
    signaling_events: flume::Receiver<SignalingEvent>,
    outbound: UnboundedReceiver<OutboundEnvelope>,
    session_events: UnboundedReceiver<SessionEvent>,
    acceptor: Option<Acceptor>,
    /// Accepting resumes at this instant after an accept error.
    accept_backoff: Option<Instant>,
    room: watch::Sender<Option<String>>,
    shutdown: ShutdownManager<ExitReason>,
    _token: DelayShutdownToken<ExitReason>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let signaling_alive = self.signaling.is_some();
            // connections wait in the listener until a session can carry them
            let can_accept = self.accept_backoff.is_none()
                && self.acceptor.is_some()
                && self.orchestrator.select_session().is_some();
            tokio::select! {
                _ = self.shutdown.wait_shutdown_triggered() => break,
                rs = self.signaling_events.recv_async(), if signaling_alive => match rs {
                    Ok(event) => self.on_signaling_event(event),
                    Err(_) => self.on_signaling_lost("signaling closed".into()),
                },
                Some(out) = self.outbound.recv() => {
                    if let Some(signaling) = &self.signaling {
                        if let Err(e) = signaling.send_envelope(out.peer, out.envelope) {
                            log::warn!("send envelope to {} {e:?}", out.peer);
                        }
                    }
                }
                Some(event) = self.session_events.recv() => {
                    self.orchestrator.on_session_event(event);
                }
                _ = backoff(self.accept_backoff) => self.accept_backoff = None,
                rs = accept(&mut self.acceptor), if can_accept => match rs {
                    Ok((socket, addr)) => {
                        match self.orchestrator.select_session() {
                            Some(session) => {
                                tokio::spawn(async move {
                                    match session.create_local_lane(socket).await {
                                        Ok(name) => log::info!("lane {name} for {addr}"),
                                        Err(e) => log::warn!("no lane for {addr} {e:?}"),
                                    }
                                });
                            }
                            None => {
                                log::warn!("no serving session, dropped connection from {addr}")
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("accept {e:?}");
                        self.accept_backoff = Some(Instant::now() + ACCEPT_BACKOFF);
                    }
                },
            }
        }
        self.stop().await;
    }

    fn on_signaling_event(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::RoomCreated { room_id } => {
                log::info!("room {room_id} created");
                let rs = match &self.signaling {
                    Some(signaling) => signaling.sign_in(&room_id, &self.config.password),
                    None => Ok(()),
                };
                if let Err(e) = rs {
                    self.on_signaling_lost(format!("sign in {e}"));
                }
            }
            SignalingEvent::RoomJoined {
                room_id,
                local_peer,
            } => {
                self.orchestrator.on_room_joined(room_id.clone(), local_peer);
                self.room.send_replace(Some(room_id));
            }
            SignalingEvent::PeerConnected(peer) => self.orchestrator.on_peer_connected(peer),
            SignalingEvent::PeerDisconnected(peer) => self.orchestrator.on_peer_disconnected(peer),
            SignalingEvent::Envelope { from, envelope } => {
                self.orchestrator.on_signaling_envelope(from, envelope);
            }
            SignalingEvent::Failure(reason) => {
                if self.orchestrator.room().room_id.is_none() {
                    self.fail(reason);
                } else {
                    log::warn!("signaling: {reason}");
                }
            }
            SignalingEvent::Disconnected => {
                self.on_signaling_lost("signal server went away".into())
            }
        }
    }

    fn on_signaling_lost(&mut self, reason: String) {
        self.signaling = None;
        if self.config.mode.is_server() && !self.config.exit_on_signaling_loss {
            log::warn!("{reason}, serving existing peers only");
            return;
        }
        self.fail(reason);
    }

    fn fail(&mut self, reason: String) {
        let sessions = self.orchestrator.on_signaling_failure(&reason);
        self.closing.extend(sessions);
        _ = self
            .shutdown
            .trigger_shutdown(ExitReason::SignalingFailed(reason));
    }

    async fn stop(mut self) {
        self.acceptor = None;
        let mut sessions = self.orchestrator.close_all();
        sessions.append(&mut self.closing);
        for session in sessions {
            session.closed().await;
        }
        if let (Some(signaling), Some(room_id)) =
            (&self.signaling, &self.orchestrator.room().room_id)
        {
            if let Err(e) = signaling.sign_out(room_id) {
                log::debug!("sign out {e:?}");
            }
        }
        log::info!("tunnel stopped");
    }
}

async fn backoff(until: Option<Instant>) {
    match until {
        Some(until) => tokio::time::sleep_until(until).await,
        None => std::future::pending().await,
    }
}

async fn accept(
    acceptor: &mut Option<Acceptor>,
) -> std::io::Result<(htunnel_core::socket::BoxSocketStream, SocketAddr)> {
    match acceptor {
        Some(acceptor) => acceptor.accept().await,
        None => std::future::pending().await,
    }
}
