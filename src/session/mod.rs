//! The per-peer session actor.
//!
//! A session owns one transport session, its control channel and the lane
//! table. Everything that touches the lane table runs on the session task, so
//! lane creation and removal are serialized without locks.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use htunnel_core::socket::{BoxSocketStream, Protocol, RemoteAddress};
use htunnel_core::transport::{
    ChannelRef, Negotiation, OutboundEnvelope, Role, Signaler, Transport, TransportEvent,
    TransportSession,
};
use htunnel_core::PeerId;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch};

use crate::config::{
    ChannelClosePolicy, Mode, TunnelConfig, CONTROL_CHANNEL_LABEL, MAX_PENDING_TARGETS,
};
use crate::control::{ControlChannel, ControlMessage};
use crate::error::{Error, Result};
use crate::lane::{
    ChannelName, CloseReason, Direction, Lane, LaneCommand, LaneEvent, LaneExit, LaneHandle,
};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SessionState {
    Idle,
    EstablishingTransport,
    ControlChannelOpening,
    Active,
    Closing,
    Closed,
}

pub enum SessionCommand {
    CreateLocalLane {
        socket: BoxSocketStream,
        reply: oneshot::Sender<Result<ChannelName>>,
    },
    /// Offer/answer payload from the remote counterpart.
    Envelope(serde_json::Value),
    Close,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SessionEvent {
    /// The server accepted the announced target; local connections can be
    /// carried from now on.
    Serving { peer: PeerId, role: Role },
    Closed { peer: PeerId, role: Role, id: u64 },
}

/// What every session of a tunnel shares.
#[derive(Clone)]
pub struct SessionContext {
    pub local_peer: PeerId,
    pub config: Arc<TunnelConfig>,
    pub transport: Arc<dyn Transport>,
    pub signals: UnboundedSender<OutboundEnvelope>,
    pub events: UnboundedSender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionHandle {
    peer: PeerId,
    role: Role,
    id: u64,
    commands: UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    serving: Arc<AtomicBool>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn peer(&self) -> PeerId {
        self.peer
    }
    pub fn role(&self) -> Role {
        self.role
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }
    /// The peer accepted this session's forwarding target.
    pub fn is_serving(&self) -> bool {
        self.serving.load(Ordering::Acquire)
    }
    pub fn deliver_envelope(&self, payload: serde_json::Value) -> bool {
        self.commands.send(SessionCommand::Envelope(payload)).is_ok()
    }
    /// Forwards an accepted local socket through this session.
    pub async fn create_local_lane(&self, socket: BoxSocketStream) -> Result<ChannelName> {
        let (reply, receiver) = oneshot::channel();
        self.commands
            .send(SessionCommand::CreateLocalLane { socket, reply })
            .map_err(|_| Error::SessionClosed)?;
        receiver.await.map_err(|_| Error::SessionClosed)?
    }
    /// Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }
    /// Resolves once every lane is gone and the transport is closed.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|state| *state == SessionState::Closed).await;
    }
}

pub struct PeerSession {
    peer: PeerId,
    role: Role,
    id: u64,
    context: SessionContext,
    state: watch::Sender<SessionState>,
    serving: Arc<AtomicBool>,
    transport: Option<Box<dyn TransportSession>>,
    control: Option<ControlChannel>,
    lanes: HashMap<ChannelName, LaneHandle>,
    /// Targets named by `CreateChannel` before the lane's channel opened.
    pending_targets: HashMap<ChannelName, (RemoteAddress, Protocol)>,
    next_serial: u64,
    commands: UnboundedReceiver<SessionCommand>,
    lane_sender: UnboundedSender<LaneEvent>,
    lane_events: UnboundedReceiver<LaneEvent>,
}

impl PeerSession {
    pub fn spawn(peer: PeerId, role: Role, context: SessionContext) -> SessionHandle {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SessionState::Idle);
        let (lane_sender, lane_events) = mpsc::unbounded_channel();
        let serving = Arc::new(AtomicBool::new(false));
        let session = PeerSession {
            peer,
            role,
            id,
            context,
            state,
            serving: serving.clone(),
            transport: None,
            control: None,
            lanes: HashMap::new(),
            pending_targets: HashMap::new(),
            next_serial: 1,
            commands,
            lane_sender,
            lane_events,
        };
        tokio::spawn(session.run());
        SessionHandle {
            peer,
            role,
            id,
            commands: commands_tx,
            state: state_rx,
            serving,
        }
    }

    fn set_state(&self, state: SessionState) {
        log::debug!("session {}/{} -> {:?}", self.peer, self.role, state);
        self.state.send_replace(state);
    }

    fn current_state(&self) -> SessionState {
        *self.state.borrow()
    }

    async fn run(mut self) {
        log::info!("session {}/{} started", self.peer, self.role);
        if let Some(events) = self.establish().await {
            self.serve(events).await;
            self.teardown().await;
        }
        self.set_state(SessionState::Closed);
        log::info!("session {}/{} closed", self.peer, self.role);
        let _ = self.context.events.send(SessionEvent::Closed {
            peer: self.peer,
            role: self.role,
            id: self.id,
        });
    }

    /// Returns the transport's event stream, or `None` when the session ends
    /// before the transport is up.
    async fn establish(&mut self) -> Option<UnboundedReceiver<TransportEvent>> {
        self.set_state(SessionState::EstablishingTransport);
        let (envelope_tx, envelopes) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let negotiation = Negotiation {
            local_peer: self.context.local_peer,
            remote_peer: self.peer,
            role: self.role,
            signal: Signaler::new(self.peer, self.role, self.context.signals.clone()),
            envelopes,
            events: events_tx,
        };
        let transport = self.context.transport.clone();
        let establish = transport.establish(negotiation);
        tokio::pin!(establish);
        let rs = loop {
            tokio::select! {
                rs = &mut establish => break rs,
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Envelope(payload)) => {
                        let _ = envelope_tx.send(payload);
                    }
                    Some(SessionCommand::CreateLocalLane { reply, .. }) => {
                        let _ = reply.send(Err(Error::NotServing));
                    }
                    Some(SessionCommand::Close) | None => {
                        log::info!(
                            "session {}/{} closed while establishing",
                            self.peer,
                            self.role
                        );
                        return None;
                    }
                },
            }
        };
        let transport = match rs {
            Ok(transport) => transport,
            Err(e) => {
                log::warn!("session {}/{} transport failed {e:?}", self.peer, self.role);
                return None;
            }
        };
        self.transport = Some(transport);
        self.set_state(SessionState::ControlChannelOpening);
        if self.role == Role::Offerer {
            let rs = match &self.transport {
                Some(transport) => transport.open_channel(CONTROL_CHANNEL_LABEL),
                None => return None,
            };
            match rs {
                Ok(channel) => self.on_control_opened(channel),
                Err(e) => {
                    log::warn!("session {}/{} control channel {e:?}", self.peer, self.role);
                    self.set_state(SessionState::Closing);
                }
            }
        }
        Some(events)
    }

    async fn serve(&mut self, mut events: UnboundedReceiver<TransportEvent>) {
        while !matches!(
            self.current_state(),
            SessionState::Closing | SessionState::Closed
        ) {
            let backlog = self.control.as_ref().is_some_and(|c| c.has_backlog());
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => self.set_state(SessionState::Closing),
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => self.set_state(SessionState::Closing),
                },
                Some(event) = self.lane_events.recv() => self.handle_lane_event(event),
                rs = control_writable(&self.control), if backlog => {
                    let rs = match rs {
                        Ok(()) => self.control.as_mut().map_or(Ok(()), |c| c.flush()),
                        Err(e) => Err(e),
                    };
                    if let Err(e) = rs {
                        log::warn!("session {}/{} control {e:?}", self.peer, self.role);
                        self.set_state(SessionState::Closing);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::CreateLocalLane { socket, reply } => {
                let _ = reply.send(self.create_local_lane(socket));
            }
            SessionCommand::Envelope(_) => {
                log::debug!("session {}/{} ignores late envelope", self.peer, self.role);
            }
            SessionCommand::Close => {
                log::info!("session {}/{} closing", self.peer, self.role);
                self.set_state(SessionState::Closing);
            }
        }
    }

    fn create_local_lane(&mut self, socket: BoxSocketStream) -> Result<ChannelName> {
        let target = match &self.context.config.mode {
            Mode::Client(target) => target.clone(),
            Mode::Server => return Err(Error::NotServing),
        };
        if self.current_state() != SessionState::Active
            || !self.serving.load(Ordering::Acquire)
        {
            return Err(Error::NotServing);
        }
        let name = ChannelName::local(self.context.local_peer, self.next_serial);
        self.next_serial += 1;
        let channel = match &self.transport {
            Some(transport) => transport.open_channel(&name.to_string())?,
            None => return Err(Error::SessionClosed),
        };
        let lane = Lane::spawn(
            name,
            Direction::LocalInitiated,
            channel,
            Some(socket),
            self.context.config.lane.clone(),
            self.lane_sender.clone(),
        );
        log::info!(
            "session {}/{} lane {} -> {} {}",
            self.peer,
            self.role,
            name,
            target.protocol,
            target.remote
        );
        let rs = self.send_control(&ControlMessage::CreateChannel {
            remote_address: target.remote,
            protocol: target.protocol,
            channel_name: Some(name),
        });
        if let Err(e) = rs {
            lane.send(LaneCommand::Close(CloseReason::SessionClosed));
            self.lanes.insert(name, lane);
            return Err(e);
        }
        self.lanes.insert(name, lane);
        Ok(name)
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::ChannelOpened(channel) => self.on_remote_channel_opened(channel),
            TransportEvent::ChannelClosed(label) => {
                if label == CONTROL_CHANNEL_LABEL {
                    log::info!("session {}/{} control channel closed", self.peer, self.role);
                    self.set_state(SessionState::Closing);
                } else if let Some(lane) = self.lane_by_label(&label) {
                    lane.send(LaneCommand::Close(CloseReason::ChannelClosed));
                }
            }
            TransportEvent::ChannelMessage { label, data } => {
                if label == CONTROL_CHANNEL_LABEL {
                    self.on_control_message(data);
                } else if let Some(lane) = self.lane_by_label(&label) {
                    lane.send(LaneCommand::Message(data));
                } else {
                    log::debug!(
                        "session {}/{} message for unknown lane {label}",
                        self.peer,
                        self.role
                    );
                }
            }
            TransportEvent::SessionClosed => {
                log::info!("session {}/{} transport closed", self.peer, self.role);
                self.set_state(SessionState::Closing);
            }
        }
    }

    fn lane_by_label(&self, label: &str) -> Option<&LaneHandle> {
        let name = label.parse::<ChannelName>().ok()?;
        self.lanes.get(&name)
    }

    fn on_remote_channel_opened(&mut self, channel: ChannelRef) {
        if channel.label() == CONTROL_CHANNEL_LABEL {
            if self.control.is_some() {
                log::warn!("session {}/{} second control channel", self.peer, self.role);
                channel.close();
                return;
            }
            self.on_control_opened(channel);
            return;
        }
        if !self.context.config.mode.is_server() {
            log::warn!(
                "session {}/{} refused channel {} opened by peer",
                self.peer,
                self.role,
                channel.label()
            );
            channel.close();
            return;
        }
        let name = match channel.label().parse::<ChannelName>() {
            Ok(name) => name,
            Err(e) => {
                log::warn!("session {}/{} {e}", self.peer, self.role);
                channel.close();
                return;
            }
        };
        if self.lanes.contains_key(&name) {
            log::warn!("session {}/{} lane {name} already exists", self.peer, self.role);
            channel.close();
            return;
        }
        let lane = Lane::spawn(
            name,
            Direction::RemoteInitiated,
            channel,
            None,
            self.context.config.lane.clone(),
            self.lane_sender.clone(),
        );
        if let Some((target, protocol)) = self.pending_targets.remove(&name) {
            lane.send(LaneCommand::Connect { target, protocol });
        }
        self.lanes.insert(name, lane);
    }

    fn on_control_opened(&mut self, channel: ChannelRef) {
        self.control = Some(ControlChannel::new(channel));
        self.set_state(SessionState::Active);
        if let Mode::Client(target) = &self.context.config.mode {
            let announce = ControlMessage::CreateChannel {
                remote_address: target.remote.clone(),
                protocol: target.protocol,
                channel_name: None,
            };
            if let Err(e) = self.send_control(&announce) {
                log::warn!("session {}/{} announce {e:?}", self.peer, self.role);
                self.set_state(SessionState::Closing);
            }
        }
    }

    /// A peer that stopped reading control messages ends the session once
    /// the backlog is full.
    fn send_control(&mut self, message: &ControlMessage) -> Result<()> {
        let rs = match self.control.as_mut() {
            Some(control) => control.send(message),
            None => Err(Error::SessionClosed),
        };
        let live = !matches!(
            self.current_state(),
            SessionState::Closing | SessionState::Closed
        );
        if live && matches!(rs, Err(Error::Overflow { .. })) {
            log::warn!("session {}/{} control backlog is full", self.peer, self.role);
            self.set_state(SessionState::Closing);
        }
        rs
    }

    fn on_control_message(&mut self, data: Bytes) {
        let message = match ControlMessage::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("session {}/{} dropped control message {e}", self.peer, self.role);
                return;
            }
        };
        log::debug!("control {}/{} <- {:?}", self.peer, self.role, message);
        let is_server = self.context.config.mode.is_server();
        match message {
            ControlMessage::CreateChannel {
                remote_address,
                protocol,
                channel_name: None,
            } => {
                if !is_server {
                    log::warn!("session {}/{} ignores CreateChannel", self.peer, self.role);
                    return;
                }
                log::info!(
                    "session {}/{} peer forwards to {protocol} {remote_address}",
                    self.peer,
                    self.role
                );
                if let Err(e) = self.send_control(&ControlMessage::ChannelCreated) {
                    log::warn!("session {}/{} {e:?}", self.peer, self.role);
                }
            }
            ControlMessage::CreateChannel {
                remote_address,
                protocol,
                channel_name: Some(name),
            } => {
                if !is_server {
                    log::warn!("session {}/{} ignores CreateChannel", self.peer, self.role);
                    return;
                }
                match self.lanes.get(&name) {
                    Some(lane) if lane.direction() == Direction::RemoteInitiated => {
                        lane.send(LaneCommand::Connect {
                            target: remote_address,
                            protocol,
                        });
                    }
                    Some(_) => {
                        log::warn!(
                            "session {}/{} CreateChannel for local lane {name}",
                            self.peer,
                            self.role
                        );
                    }
                    None => {
                        if self.pending_targets.len() >= MAX_PENDING_TARGETS {
                            log::warn!(
                                "session {}/{} too many pending lanes, dropped {name}",
                                self.peer,
                                self.role
                            );
                            return;
                        }
                        self.pending_targets.insert(name, (remote_address, protocol));
                    }
                }
            }
            ControlMessage::ChannelCreated => {
                if is_server {
                    return;
                }
                log::info!("session {}/{} serving", self.peer, self.role);
                self.serving.store(true, Ordering::Release);
                let _ = self.context.events.send(SessionEvent::Serving {
                    peer: self.peer,
                    role: self.role,
                });
            }
            ControlMessage::ServerSideReady { channel_name } => {
                match self.lanes.get(&channel_name) {
                    Some(lane) if lane.direction() == Direction::LocalInitiated => {
                        lane.send(LaneCommand::Ready);
                    }
                    _ => log::debug!(
                        "session {}/{} ServerSideReady for {channel_name} ignored",
                        self.peer,
                        self.role
                    ),
                }
            }
            ControlMessage::DeleteChannel { channel_name } => {
                self.pending_targets.remove(&channel_name);
                match self.lanes.get_mut(&channel_name) {
                    Some(lane) => {
                        lane.closed_by_remote = true;
                        lane.send(LaneCommand::Close(CloseReason::RemoteDelete));
                    }
                    None => log::debug!(
                        "session {}/{} DeleteChannel for {channel_name} ignored",
                        self.peer,
                        self.role
                    ),
                }
            }
        }
    }

    fn handle_lane_event(&mut self, event: LaneEvent) {
        match event {
            LaneEvent::Connected(name) => {
                if !self.lanes.contains_key(&name) {
                    return;
                }
                let ready = ControlMessage::ServerSideReady { channel_name: name };
                if let Err(e) = self.send_control(&ready) {
                    log::warn!("session {}/{} {e:?}", self.peer, self.role);
                }
                if let Some(lane) = self.lanes.get(&name) {
                    lane.send(LaneCommand::Ready);
                }
            }
            LaneEvent::Exited(exit) => {
                // the lane task has returned; its handle is no longer needed
                let _ = self.on_lane_exit(exit);
            }
        }
    }

    /// Removes the lane from the table and tells the peer, unless the peer
    /// asked for the close or the session is going away.
    fn on_lane_exit(&mut self, exit: LaneExit) -> Option<LaneHandle> {
        let lane = self.lanes.remove(&exit.name)?;
        self.pending_targets.remove(&exit.name);
        let active = self.current_state() == SessionState::Active;
        if active && !exit.closed_by_remote && !lane.closed_by_remote {
            let rs = self.send_control(&ControlMessage::DeleteChannel {
                channel_name: exit.name,
            });
            if let Err(e) = rs {
                log::warn!(
                    "session {}/{} DeleteChannel {} {e:?}",
                    self.peer,
                    self.role,
                    exit.name
                );
            }
        }
        if let Some(channel) = exit.channel {
            let policy = if active {
                self.context.config.lane.close_policy
            } else {
                ChannelClosePolicy::Immediate
            };
            release_channel(channel, policy);
        }
        Some(lane)
    }

    async fn teardown(&mut self) {
        self.set_state(SessionState::Closing);
        self.pending_targets.clear();
        for lane in self.lanes.values() {
            lane.send(LaneCommand::Close(CloseReason::SessionClosed));
        }
        while !self.lanes.is_empty() {
            match self.lane_events.recv().await {
                Some(LaneEvent::Exited(exit)) => {
                    if let Some(lane) = self.on_lane_exit(exit) {
                        lane.join().await;
                    }
                }
                Some(LaneEvent::Connected(_)) => {}
                None => break,
            }
        }
        if let Some(mut control) = self.control.take() {
            control.close();
        }
        if let Some(transport) = self.transport.take() {
            transport.close();
        }
    }
}

fn release_channel(channel: ChannelRef, policy: ChannelClosePolicy) {
    match policy {
        ChannelClosePolicy::Immediate => channel.close(),
        ChannelClosePolicy::Deferred(delay) => {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                channel.close();
            });
        }
    }
}

async fn control_writable(control: &Option<ControlChannel>) -> Result<()> {
    match control {
        Some(control) => control.writable().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use htunnel_core::socket::Protocol;
    use htunnel_core::transport::{
        ChannelRef, LoopbackNetwork, Negotiation, Role, Signaler, Transport, TransportEvent,
        TransportSession,
    };
    use htunnel_core::PeerId;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::{PeerSession, SessionContext, SessionEvent, SessionHandle, SessionState};
    use crate::config::{ForwardTarget, Mode, TunnelConfig, CONTROL_CHANNEL_LABEL};
    use crate::control::ControlMessage;
    use crate::error::Error;
    use crate::lane::tests::MemorySocket;
    use crate::lane::ChannelName;

    const WAIT: Duration = Duration::from_secs(5);

    /// The far end of a session, driven by hand over the loopback transport.
    struct FakePeer {
        session: Box<dyn TransportSession>,
        events: UnboundedReceiver<TransportEvent>,
        stash: VecDeque<TransportEvent>,
        control: Option<ChannelRef>,
    }

    impl FakePeer {
        async fn establish(network: &LoopbackNetwork, local: u64, remote: u64, role: Role) -> Self {
            let (signals, _) = mpsc::unbounded_channel();
            let (_envelopes_tx, envelopes) = mpsc::unbounded_channel();
            let (events_tx, events) = mpsc::unbounded_channel();
            let negotiation = Negotiation {
                local_peer: PeerId::new(local),
                remote_peer: PeerId::new(remote),
                role,
                signal: Signaler::new(PeerId::new(remote), role, signals),
                envelopes,
                events: events_tx,
            };
            let session = tokio::time::timeout(WAIT, network.transport().establish(negotiation))
                .await
                .unwrap()
                .unwrap();
            FakePeer {
                session,
                events,
                stash: VecDeque::new(),
                control: None,
            }
        }

        fn open_control(&mut self) {
            let channel = self.session.open_channel(CONTROL_CHANNEL_LABEL).unwrap();
            self.control = Some(channel);
        }

        fn send(&self, message: ControlMessage) {
            let control = self.control.as_ref().unwrap();
            control.try_send(message.encode().unwrap()).unwrap();
        }

        async fn expect<T>(&mut self, mut f: impl FnMut(&TransportEvent) -> Option<T>) -> T {
            if let Some(index) = self.stash.iter().position(|e| f(e).is_some()) {
                let event = self.stash.remove(index).unwrap();
                return f(&event).unwrap();
            }
            loop {
                let event = tokio::time::timeout(WAIT, self.events.recv())
                    .await
                    .expect("event timed out")
                    .expect("transport gone");
                if let TransportEvent::ChannelOpened(channel) = &event {
                    if channel.label() == CONTROL_CHANNEL_LABEL {
                        self.control = Some(channel.clone());
                        continue;
                    }
                }
                match f(&event) {
                    Some(value) => return value,
                    None => self.stash.push_back(event),
                }
            }
        }

        async fn control_message(&mut self) -> ControlMessage {
            self.expect(|event| match event {
                TransportEvent::ChannelMessage { label, data }
                    if label == CONTROL_CHANNEL_LABEL =>
                {
                    Some(ControlMessage::decode(data).unwrap())
                }
                _ => None,
            })
            .await
        }

        async fn lane_opened(&mut self) -> ChannelRef {
            self.expect(|event| match event {
                TransportEvent::ChannelOpened(channel) => Some(channel.clone()),
                _ => None,
            })
            .await
        }

        async fn lane_message(&mut self, name: &str) -> Bytes {
            self.expect(|event| match event {
                TransportEvent::ChannelMessage { label, data } if label == name => {
                    Some(data.clone())
                }
                _ => None,
            })
            .await
        }

        async fn channel_closed(&mut self, name: &str) {
            self.expect(|event| match event {
                TransportEvent::ChannelClosed(label) if label == name => Some(()),
                _ => None,
            })
            .await
        }

        /// Control messages seen within `window`.
        async fn quiet_control(&mut self, window: Duration) -> Vec<ControlMessage> {
            tokio::time::sleep(window).await;
            let mut seen = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                self.stash.push_back(event);
            }
            self.stash.retain(|event| match event {
                TransportEvent::ChannelMessage { label, data }
                    if label == CONTROL_CHANNEL_LABEL =>
                {
                    seen.push(ControlMessage::decode(data).unwrap());
                    false
                }
                _ => true,
            });
            seen
        }
    }

    fn context(
        network: &LoopbackNetwork,
        local: u64,
        mode: Mode,
    ) -> (SessionContext, UnboundedReceiver<SessionEvent>) {
        let (signals, _) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let context = SessionContext {
            local_peer: PeerId::new(local),
            config: Arc::new(TunnelConfig::new(mode)),
            transport: Arc::new(network.transport()),
            signals,
            events,
        };
        (context, events_rx)
    }

    fn client_mode(remote: &str) -> Mode {
        Mode::Client(ForwardTarget {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote: remote.parse().unwrap(),
            protocol: Protocol::Tcp,
        })
    }

    async fn wait_state(handle: &SessionHandle, state: SessionState) {
        for _ in 0..500 {
            if handle.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("session never reached {state:?}, now {:?}", handle.state());
    }

    /// A client session offering to peer 1, with the fake server behind it.
    async fn serving_client(network: &LoopbackNetwork) -> (SessionHandle, FakePeer) {
        let (context, _events) = context(network, 2, client_mode("127.0.0.1:22"));
        let handle = PeerSession::spawn(PeerId::new(1), Role::Offerer, context);
        let mut server = FakePeer::establish(network, 1, 2, Role::Answerer).await;
        let announce = server.control_message().await;
        assert!(matches!(
            announce,
            ControlMessage::CreateChannel { channel_name: None, protocol: Protocol::Tcp, .. }
        ));
        server.send(ControlMessage::ChannelCreated);
        for _ in 0..500 {
            if handle.is_serving() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_serving());
        (handle, server)
    }

    #[tokio::test]
    async fn client_lane_relays_after_server_side_ready() {
        let network = LoopbackNetwork::new();
        let (handle, mut server) = serving_client(&network).await;

        let socket = MemorySocket::default();
        socket.feed(b"hello");
        let name = handle.create_local_lane(socket.boxed()).await.unwrap();
        assert_eq!(name.to_string(), "2|1");
        let lane = server.lane_opened().await;
        assert_eq!(lane.label(), "2|1");
        match server.control_message().await {
            ControlMessage::CreateChannel {
                remote_address,
                channel_name,
                ..
            } => {
                assert_eq!(remote_address.to_string(), "127.0.0.1:22");
                assert_eq!(channel_name, Some(name));
            }
            other => panic!("unexpected {other:?}"),
        }

        server.send(ControlMessage::ServerSideReady { channel_name: name });
        assert_eq!(&server.lane_message("2|1").await[..], b"hello");

        lane.try_send(Bytes::from_static(b"world")).unwrap();
        for _ in 0..500 {
            if socket.written() == b"world" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(socket.written(), b"world");
    }

    #[tokio::test]
    async fn remote_delete_is_not_echoed() {
        let network = LoopbackNetwork::new();
        let (handle, mut server) = serving_client(&network).await;

        let name = handle
            .create_local_lane(MemorySocket::default().boxed())
            .await
            .unwrap();
        let lane = server.lane_opened().await;
        let _create = server.control_message().await;

        server.send(ControlMessage::DeleteChannel { channel_name: name });
        lane.close();
        server.channel_closed(&name.to_string()).await;
        let seen = server.quiet_control(Duration::from_millis(100)).await;
        assert!(seen.is_empty(), "unexpected {seen:?}");
        assert_eq!(handle.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn socket_eof_racing_channel_close_deletes_once() {
        let network = LoopbackNetwork::new();
        let (handle, mut server) = serving_client(&network).await;

        let socket = MemorySocket::default();
        let name = handle.create_local_lane(socket.boxed()).await.unwrap();
        let lane = server.lane_opened().await;
        let _create = server.control_message().await;
        server.send(ControlMessage::ServerSideReady { channel_name: name });

        socket.eof();
        lane.close();
        let seen = server.quiet_control(Duration::from_millis(200)).await;
        let deletes = seen
            .iter()
            .filter(|m| matches!(m, ControlMessage::DeleteChannel { .. }))
            .count();
        assert_eq!(deletes, 1, "unexpected {seen:?}");
    }

    #[tokio::test]
    async fn lanes_wait_for_channel_created() {
        let network = LoopbackNetwork::new();
        let (context, _events) = context(&network, 2, client_mode("127.0.0.1:22"));
        let handle = PeerSession::spawn(PeerId::new(1), Role::Offerer, context);
        let mut server = FakePeer::establish(&network, 1, 2, Role::Answerer).await;
        let _announce = server.control_message().await;
        wait_state(&handle, SessionState::Active).await;
        let rs = handle
            .create_local_lane(MemorySocket::default().boxed())
            .await;
        assert!(matches!(rs, Err(Error::NotServing)));
    }

    #[tokio::test]
    async fn server_connects_and_reports_ready() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        let network = LoopbackNetwork::new();
        let (context, _events) = context(&network, 1, Mode::Server);
        let _handle = PeerSession::spawn(PeerId::new(2), Role::Answerer, context);
        let mut client = FakePeer::establish(&network, 2, 1, Role::Offerer).await;
        client.open_control();

        client.send(ControlMessage::CreateChannel {
            remote_address: target.into(),
            protocol: Protocol::Tcp,
            channel_name: None,
        });
        assert_eq!(client.control_message().await, ControlMessage::ChannelCreated);

        let name: ChannelName = "3".parse().unwrap();
        let lane = client.session.open_channel("3").unwrap();
        client.send(ControlMessage::CreateChannel {
            remote_address: target.into(),
            protocol: Protocol::Tcp,
            channel_name: Some(name),
        });
        let (mut stream, _) = tokio::time::timeout(WAIT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            client.control_message().await,
            ControlMessage::ServerSideReady { channel_name: name }
        );

        lane.try_send(Bytes::from_static(b"ping")).unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        stream.write_all(b"pong").await.unwrap();
        assert_eq!(&client.lane_message("3").await[..], b"pong");

        drop(stream);
        assert_eq!(
            client.control_message().await,
            ControlMessage::DeleteChannel { channel_name: name }
        );
        client.channel_closed("3").await;
    }

    #[tokio::test]
    async fn failed_connect_deletes_the_lane() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let target = closed.local_addr().unwrap();
        drop(closed);
        let network = LoopbackNetwork::new();
        let (context, _events) = context(&network, 1, Mode::Server);
        let _handle = PeerSession::spawn(PeerId::new(2), Role::Answerer, context);
        let mut client = FakePeer::establish(&network, 2, 1, Role::Offerer).await;
        client.open_control();

        // the target may arrive before the channel
        let name: ChannelName = "2|7".parse().unwrap();
        client.send(ControlMessage::CreateChannel {
            remote_address: target.into(),
            protocol: Protocol::Tcp,
            channel_name: Some(name),
        });
        let _lane = client.session.open_channel("2|7").unwrap();
        assert_eq!(
            client.control_message().await,
            ControlMessage::DeleteChannel { channel_name: name }
        );
        client.channel_closed("2|7").await;
    }

    #[tokio::test]
    async fn malformed_control_messages_are_dropped() {
        let network = LoopbackNetwork::new();
        let (context, _events) = context(&network, 1, Mode::Server);
        let handle = PeerSession::spawn(PeerId::new(2), Role::Answerer, context);
        let mut client = FakePeer::establish(&network, 2, 1, Role::Offerer).await;
        client.open_control();
        let control = client.control.clone().unwrap();
        control.try_send(Bytes::from_static(b"{not json")).unwrap();
        control
            .try_send(Bytes::from_static(
                br#"{"id":0,"data":{"remoteAddress":"x:1","protocol":"SCTP"}}"#,
            ))
            .unwrap();
        client.send(ControlMessage::CreateChannel {
            remote_address: "127.0.0.1:22".parse().unwrap(),
            protocol: Protocol::Tcp,
            channel_name: None,
        });
        assert_eq!(client.control_message().await, ControlMessage::ChannelCreated);
        assert_eq!(handle.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn close_tears_down_lanes_and_transport() {
        let network = LoopbackNetwork::new();
        let (context, mut events) = context(&network, 2, client_mode("127.0.0.1:22"));
        let handle = PeerSession::spawn(PeerId::new(1), Role::Offerer, context);
        let mut server = FakePeer::establish(&network, 1, 2, Role::Answerer).await;
        let _announce = server.control_message().await;
        server.send(ControlMessage::ChannelCreated);
        wait_state(&handle, SessionState::Active).await;
        for _ in 0..500 {
            if handle.is_serving() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let name = handle
            .create_local_lane(MemorySocket::default().boxed())
            .await
            .unwrap();
        let _lane = server.lane_opened().await;

        handle.close();
        handle.close();
        tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
        assert_eq!(handle.state(), SessionState::Closed);
        server.channel_closed(&name.to_string()).await;
        server
            .expect(|event| matches!(event, TransportEvent::SessionClosed).then_some(()))
            .await;
        assert!(matches!(
            events.recv().await,
            Some(SessionEvent::Serving { role: Role::Offerer, .. })
        ));
        match events.recv().await.unwrap() {
            SessionEvent::Closed { peer, role, .. } => {
                assert_eq!(peer, PeerId::new(1));
                assert_eq!(role, Role::Offerer);
            }
            SessionEvent::Serving { .. } => panic!("serving twice"),
        }
        assert!(matches!(
            handle.create_local_lane(MemorySocket::default().boxed()).await,
            Err(Error::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn failed_transport_goes_straight_to_closed() {
        let network = LoopbackNetwork::new();
        network.fail_establish(PeerId::new(2), PeerId::new(1));
        let (context, mut events) = context(&network, 2, Mode::Server);
        let handle = PeerSession::spawn(PeerId::new(1), Role::Offerer, context);
        tokio::time::timeout(WAIT, handle.closed()).await.unwrap();
        assert!(matches!(events.recv().await, Some(SessionEvent::Closed { .. })));
    }
}
