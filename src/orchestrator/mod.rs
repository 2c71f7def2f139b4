//! Registry of peer sessions for one room.
//!
//! The orchestrator turns signaling events into sessions: every peer in the
//! room gets an offerer and an answerer session, envelopes are routed to the
//! session they address, and sessions are dropped from the registry once they
//! report `Closed`.

use std::collections::HashMap;
use std::sync::Arc;

use htunnel_core::transport::{OutboundEnvelope, Role, SignalEnvelope, Transport};
use htunnel_core::PeerId;
use tokio::sync::mpsc::UnboundedSender;

use crate::config::TunnelConfig;
use crate::session::{PeerSession, SessionContext, SessionEvent, SessionHandle};

/// Sessions held for one remote peer.
#[derive(Debug, Default)]
pub struct PeerEntry {
    pub offerer: Option<SessionHandle>,
    pub answerer: Option<SessionHandle>,
}

impl PeerEntry {
    pub fn get(&self, role: Role) -> Option<&SessionHandle> {
        match role {
            Role::Offerer => self.offerer.as_ref(),
            Role::Answerer => self.answerer.as_ref(),
        }
    }
    fn slot(&mut self, role: Role) -> &mut Option<SessionHandle> {
        match role {
            Role::Offerer => &mut self.offerer,
            Role::Answerer => &mut self.answerer,
        }
    }
    pub fn sessions(&self) -> impl Iterator<Item = &SessionHandle> {
        self.offerer.iter().chain(self.answerer.iter())
    }
    fn is_empty(&self) -> bool {
        self.offerer.is_none() && self.answerer.is_none()
    }
}

#[derive(Debug, Default)]
pub struct RoomState {
    pub room_id: Option<String>,
    pub local_peer: PeerId,
    pub peers: HashMap<PeerId, PeerEntry>,
}

pub struct Orchestrator {
    config: Arc<TunnelConfig>,
    transport: Arc<dyn Transport>,
    signals: UnboundedSender<OutboundEnvelope>,
    events: UnboundedSender<SessionEvent>,
    room: RoomState,
}

impl Orchestrator {
    pub fn new(
        config: Arc<TunnelConfig>,
        transport: Arc<dyn Transport>,
        signals: UnboundedSender<OutboundEnvelope>,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            config,
            transport,
            signals,
            events,
            room: RoomState::default(),
        }
    }

    pub fn room(&self) -> &RoomState {
        &self.room
    }

    pub fn on_room_joined(&mut self, room_id: String, local_peer: PeerId) {
        log::info!("joined room {room_id} as peer {local_peer}");
        self.room.room_id = Some(room_id);
        self.room.local_peer = local_peer;
    }

    fn roles_for(&self, peer: PeerId) -> Vec<Role> {
        if self.config.dual_role {
            return vec![Role::Answerer, Role::Offerer];
        }
        // both ends must agree on who offers
        if self.room.local_peer < peer {
            vec![Role::Offerer]
        } else {
            vec![Role::Answerer]
        }
    }

    pub fn on_peer_connected(&mut self, peer: PeerId) {
        if peer == self.room.local_peer {
            return;
        }
        if self.room.peers.contains_key(&peer) {
            log::debug!("peer {peer} is already known");
            return;
        }
        log::info!("peer {peer} connected");
        let context = SessionContext {
            local_peer: self.room.local_peer,
            config: self.config.clone(),
            transport: self.transport.clone(),
            signals: self.signals.clone(),
            events: self.events.clone(),
        };
        let mut entry = PeerEntry::default();
        for role in self.roles_for(peer) {
            *entry.slot(role) = Some(PeerSession::spawn(peer, role, context.clone()));
        }
        self.room.peers.insert(peer, entry);
    }

    pub fn on_peer_disconnected(&mut self, peer: PeerId) {
        let Some(entry) = self.room.peers.remove(&peer) else {
            log::debug!("unknown peer {peer} disconnected");
            return;
        };
        log::info!("peer {peer} disconnected");
        for session in entry.sessions() {
            session.close();
        }
    }

    /// Returns false when no session of `from` takes the envelope.
    pub fn on_signaling_envelope(&mut self, from: PeerId, envelope: SignalEnvelope) -> bool {
        let session = self
            .room
            .peers
            .get(&from)
            .and_then(|entry| entry.get(envelope.target));
        match session {
            Some(session) => session.deliver_envelope(envelope.payload),
            None => {
                log::warn!("dropped envelope from {from} for {}", envelope.target);
                false
            }
        }
    }

    pub fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Serving { peer, role } => {
                log::debug!("session {peer}/{role} carries local connections");
            }
            SessionEvent::Closed { peer, role, id } => {
                let Some(entry) = self.room.peers.get_mut(&peer) else {
                    return;
                };
                let slot = entry.slot(role);
                if slot.as_ref().is_some_and(|session| session.id() == id) {
                    slot.take();
                    log::info!("session {peer}/{role} removed");
                }
                if entry.is_empty() {
                    self.room.peers.remove(&peer);
                }
            }
        }
    }

    /// A session able to carry a new local connection. With both sessions of
    /// a peer serving, the offerer is used so each accept creates one lane.
    pub fn select_session(&self) -> Option<SessionHandle> {
        self.serving(Role::Offerer)
            .or_else(|| self.serving(Role::Answerer))
            .cloned()
    }

    fn serving(&self, role: Role) -> Option<&SessionHandle> {
        self.room
            .peers
            .values()
            .filter_map(|entry| entry.get(role))
            .find(|session| session.is_serving())
    }

    /// Closes every session, see [`Orchestrator::close_all`].
    pub fn on_signaling_failure(&mut self, reason: &str) -> Vec<SessionHandle> {
        log::error!("signaling failed: {reason}");
        self.close_all()
    }

    /// Closes every session; the returned handles resolve `closed()` once
    /// their lanes are gone.
    pub fn close_all(&mut self) -> Vec<SessionHandle> {
        let mut sessions = Vec::new();
        for (_, entry) in self.room.peers.drain() {
            for session in entry.sessions() {
                session.close();
                sessions.push(session.clone());
            }
        }
        sessions
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use htunnel_core::socket::Protocol;
    use htunnel_core::transport::{LoopbackNetwork, Role, SignalEnvelope};
    use htunnel_core::PeerId;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    use super::Orchestrator;
    use crate::config::{ForwardTarget, Mode, TunnelConfig};
    use crate::lane::tests::MemorySocket;
    use crate::session::{SessionEvent, SessionState};

    fn orchestrator(
        network: &LoopbackNetwork,
        config: TunnelConfig,
    ) -> (Orchestrator, UnboundedReceiver<SessionEvent>) {
        let (signals, _) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator::new(
            Arc::new(config),
            Arc::new(network.transport()),
            signals,
            events,
        );
        (orchestrator, events_rx)
    }

    fn client_config(remote: std::net::SocketAddr) -> TunnelConfig {
        TunnelConfig::new(Mode::Client(ForwardTarget {
            local_addr: "127.0.0.1:0".parse().unwrap(),
            remote: remote.into(),
            protocol: Protocol::Tcp,
        }))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..500 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn one_lane_per_accept_with_both_sessions_serving() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let network = LoopbackNetwork::new();
        let (mut server, _server_events) =
            orchestrator(&network, TunnelConfig::new(Mode::Server));
        let (mut client, _client_events) =
            orchestrator(&network, client_config(listener.local_addr().unwrap()));
        server.on_room_joined("room".into(), PeerId::new(1));
        client.on_room_joined("room".into(), PeerId::new(2));
        server.on_peer_connected(PeerId::new(2));
        client.on_peer_connected(PeerId::new(1));
        client.on_peer_connected(PeerId::new(1));
        assert_eq!(client.room().peers.len(), 1);

        let entry = &client.room().peers[&PeerId::new(1)];
        let offerer = entry.offerer.clone().unwrap();
        let answerer = entry.answerer.clone().unwrap();
        eventually(|| offerer.is_serving() && answerer.is_serving()).await;

        let session = client.select_session().unwrap();
        assert_eq!(session.role(), Role::Offerer);
        session
            .create_local_lane(MemorySocket::default().boxed())
            .await
            .unwrap();

        let accepted = tokio::time::timeout(Duration::from_secs(5), listener.accept()).await;
        assert!(accepted.unwrap().is_ok());
        let second = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(second.is_err(), "a second outbound socket was opened");
    }

    #[tokio::test]
    async fn single_role_sessions_pair_up() {
        let network = LoopbackNetwork::new();
        let (mut server, _server_events) =
            orchestrator(&network, TunnelConfig::new(Mode::Server).set_dual_role(false));
        let (mut client, _client_events) = orchestrator(
            &network,
            client_config("127.0.0.1:22".parse().unwrap()).set_dual_role(false),
        );
        server.on_room_joined("room".into(), PeerId::new(1));
        client.on_room_joined("room".into(), PeerId::new(2));
        server.on_peer_connected(PeerId::new(2));
        client.on_peer_connected(PeerId::new(1));

        let entry = &client.room().peers[&PeerId::new(1)];
        assert!(entry.offerer.is_none());
        let answerer = entry.answerer.clone().unwrap();
        eventually(|| answerer.is_serving()).await;
        assert!(server.room().peers[&PeerId::new(2)].answerer.is_none());
    }

    #[tokio::test]
    async fn envelopes_are_routed_by_role() {
        let network = LoopbackNetwork::new();
        let (mut orchestrator, _events) = orchestrator(&network, TunnelConfig::new(Mode::Server));
        orchestrator.on_room_joined("room".into(), PeerId::new(1));
        let envelope = SignalEnvelope {
            target: Role::Answerer,
            payload: serde_json::json!({"type": "offer"}),
        };
        assert!(!orchestrator.on_signaling_envelope(PeerId::new(9), envelope.clone()));
        orchestrator.on_peer_connected(PeerId::new(9));
        assert!(orchestrator.on_signaling_envelope(PeerId::new(9), envelope));
    }

    #[tokio::test]
    async fn disconnect_closes_and_forgets_sessions() {
        let network = LoopbackNetwork::new();
        let (mut server, mut server_events) =
            orchestrator(&network, TunnelConfig::new(Mode::Server));
        let (mut client, _client_events) =
            orchestrator(&network, client_config("127.0.0.1:22".parse().unwrap()));
        server.on_room_joined("room".into(), PeerId::new(1));
        client.on_room_joined("room".into(), PeerId::new(2));
        server.on_peer_connected(PeerId::new(2));
        client.on_peer_connected(PeerId::new(1));

        let sessions: Vec<_> = server.room().peers[&PeerId::new(2)]
            .sessions()
            .cloned()
            .collect();
        assert_eq!(sessions.len(), 2);
        server.on_peer_disconnected(PeerId::new(2));
        assert!(server.room().peers.is_empty());
        for session in &sessions {
            tokio::time::timeout(Duration::from_secs(5), session.closed())
                .await
                .unwrap();
            assert_eq!(session.state(), SessionState::Closed);
        }
        // late Closed events for forgotten sessions are harmless
        for _ in 0..2 {
            let event = server_events.recv().await.unwrap();
            server.on_session_event(event);
        }
        assert!(server.room().peers.is_empty());
    }

    #[tokio::test]
    async fn closed_sessions_leave_the_registry() {
        let network = LoopbackNetwork::new();
        network.fail_establish(PeerId::new(1), PeerId::new(2));
        network.fail_establish(PeerId::new(2), PeerId::new(1));
        let (mut server, mut events) = orchestrator(&network, TunnelConfig::new(Mode::Server));
        server.on_room_joined("room".into(), PeerId::new(1));
        server.on_peer_connected(PeerId::new(2));
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            server.on_session_event(event);
        }
        assert!(server.room().peers.is_empty());
        assert!(server.select_session().is_none());
    }
}
