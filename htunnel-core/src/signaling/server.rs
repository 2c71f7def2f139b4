use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinSet;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::Result;
use crate::signaling::{
    CreateRoom, ErrorNotice, MessageId, Offer, PeerNotice, RoomCreated, SignIn, SignOut,
    SignalMessage, SignedIn, MAX_LINE_LENGTH,
};
use crate::socket::create_tcp_listener;
use crate::PeerId;

struct Room {
    password: String,
    members: HashSet<PeerId>,
}

#[derive(Default)]
struct ServerState {
    rooms: DashMap<String, Room>,
    clients: DashMap<PeerId, UnboundedSender<String>>,
    next_peer: AtomicU64,
}

/// A room server for [`SignalingClient`](crate::signaling::SignalingClient)s.
pub struct SignalServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl SignalServer {
    pub async fn bind(addr: SocketAddr) -> io::Result<SignalServer> {
        let listener = TcpListener::from_std(create_tcp_listener(addr)?)?;
        Ok(SignalServer {
            listener,
            state: Arc::new(ServerState::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves until the listener fails. Dropping the future disconnects every
    /// client.
    pub async fn run(self) -> io::Result<()> {
        let mut clients = JoinSet::new();
        loop {
            tokio::select! {
                rs = self.listener.accept() => {
                    let (stream, addr) = rs?;
                    let state = self.state.clone();
                    clients.spawn(async move {
                        let peer =
                            PeerId::new(state.next_peer.fetch_add(1, Ordering::Relaxed) + 1);
                        log::info!("signal client {addr} is peer {peer}");
                        state.serve(peer, stream).await;
                        log::info!("signal client {addr} peer {peer} left");
                    });
                }
                Some(_) = clients.join_next() => {}
            }
        }
    }
}

impl ServerState {
    async fn serve(&self, peer: PeerId, stream: TcpStream) {
        let (read, write) = stream.into_split();
        let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
        let mut write = FramedWrite::new(write, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let writer = tokio::spawn(async move {
            while let Some(line) = receiver.recv().await {
                if let Err(e) = write.send(line).await {
                    log::debug!("signal server write {e:?}");
                    break;
                }
            }
        });
        self.clients.insert(peer, sender);
        let mut joined = HashSet::new();
        let mut read = FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        while let Some(rs) = read.next().await {
            let line = match rs {
                Ok(line) => line,
                Err(e) => {
                    log::debug!("signal server read {e:?}");
                    break;
                }
            };
            if let Err(e) = self.handle(peer, &line, &mut joined) {
                log::warn!("peer {peer} sent {line:?}: {e:?}");
                self.send(
                    peer,
                    MessageId::Error,
                    &ErrorNotice {
                        message: e.to_string(),
                    },
                );
            }
        }
        for room_id in joined {
            self.leave(peer, &room_id);
        }
        self.clients.remove(&peer);
        // the writer drains what is queued and ends once the sender is gone
        drop(writer);
    }

    fn handle(&self, peer: PeerId, line: &str, joined: &mut HashSet<String>) -> Result<()> {
        let message: SignalMessage = serde_json::from_str(line)?;
        match MessageId::from(message.id) {
            MessageId::CreateRoom => {
                let request: CreateRoom = message.data()?;
                let room_id = self.new_room(request.password);
                log::info!("peer {peer} created room {room_id}");
                self.send(
                    peer,
                    MessageId::CreateRoom,
                    &RoomCreated {
                        successful: true,
                        room_id,
                    },
                );
            }
            MessageId::SignIn => {
                let request: SignIn = message.data()?;
                let others = match self.rooms.get_mut(&request.room_id) {
                    Some(mut room) if room.password == request.password => {
                        let others: Vec<PeerId> = room.members.iter().copied().collect();
                        room.members.insert(peer);
                        Some(others)
                    }
                    _ => None,
                };
                let Some(others) = others else {
                    self.send(
                        peer,
                        MessageId::SignIn,
                        &SignedIn {
                            successful: false,
                            room_id: request.room_id,
                            peer_id: peer,
                            message: "no such room or wrong password".into(),
                        },
                    );
                    return Ok(());
                };
                joined.insert(request.room_id.clone());
                self.send(
                    peer,
                    MessageId::SignIn,
                    &SignedIn {
                        successful: true,
                        room_id: request.room_id,
                        peer_id: peer,
                        message: String::new(),
                    },
                );
                for other in others {
                    self.send(other, MessageId::PeerConnected, &PeerNotice { peer_id: peer });
                    self.send(peer, MessageId::PeerConnected, &PeerNotice { peer_id: other });
                }
            }
            MessageId::SignOut => {
                let request: SignOut = message.data()?;
                if joined.remove(&request.room_id) {
                    self.leave(peer, &request.room_id);
                }
            }
            MessageId::SendOffer => {
                let offer: Offer = message.data()?;
                let to = offer.peer_id;
                let relayed = Offer {
                    peer_id: peer,
                    payload: offer.payload,
                };
                if !self.send(to, MessageId::ReceivedOffer, &relayed) {
                    self.send(
                        peer,
                        MessageId::Error,
                        &ErrorNotice {
                            message: format!("peer {to} is not connected"),
                        },
                    );
                }
            }
            id => log::debug!("peer {peer} sent unexpected {id:?}"),
        }
        Ok(())
    }

    fn new_room(&self, password: String) -> String {
        loop {
            let room_id = format!("{:08x}", rand::thread_rng().gen::<u32>());
            if let dashmap::mapref::entry::Entry::Vacant(entry) = self.rooms.entry(room_id.clone())
            {
                entry.insert(Room {
                    password,
                    members: HashSet::new(),
                });
                return room_id;
            }
        }
    }

    fn leave(&self, peer: PeerId, room_id: &str) {
        let remaining = match self.rooms.get_mut(room_id) {
            Some(mut room) => {
                room.members.remove(&peer);
                room.members.iter().copied().collect::<Vec<_>>()
            }
            None => return,
        };
        if remaining.is_empty() {
            self.rooms.remove_if(room_id, |_, room| room.members.is_empty());
            log::info!("room {room_id} closed");
        }
        for other in remaining {
            self.send(other, MessageId::PeerDisconnected, &PeerNotice { peer_id: peer });
        }
    }

    fn send<T: serde::Serialize>(&self, peer: PeerId, id: MessageId, data: &T) -> bool {
        let line = match SignalMessage::new(id, data) {
            Ok(line) => line,
            Err(e) => {
                log::error!("encode {id:?} {e:?}");
                return false;
            }
        };
        match self.clients.get(&peer) {
            Some(sender) => sender.send(line).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::SignalServer;
    use crate::signaling::{SignalingClient, SignalingEvent};
    use crate::transport::{Role, SignalEnvelope};

    async fn next(events: &flume::Receiver<SignalingEvent>) -> SignalingEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv_async())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn room_lifecycle() {
        let server = SignalServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let (host, host_events) = SignalingClient::connect(addr).await.unwrap();
        host.create_room("secret").unwrap();
        let room_id = match next(&host_events).await {
            SignalingEvent::RoomCreated { room_id } => room_id,
            other => panic!("unexpected {other:?}"),
        };
        host.sign_in(&room_id, "secret").unwrap();
        let host_id = match next(&host_events).await {
            SignalingEvent::RoomJoined { local_peer, .. } => local_peer,
            other => panic!("unexpected {other:?}"),
        };

        let (intruder, intruder_events) = SignalingClient::connect(addr).await.unwrap();
        intruder.sign_in(&room_id, "wrong").unwrap();
        assert!(matches!(
            next(&intruder_events).await,
            SignalingEvent::Failure(_)
        ));

        let (guest, guest_events) = SignalingClient::connect(addr).await.unwrap();
        guest.sign_in(&room_id, "secret").unwrap();
        let guest_id = match next(&guest_events).await {
            SignalingEvent::RoomJoined { local_peer, .. } => local_peer,
            other => panic!("unexpected {other:?}"),
        };
        assert!(matches!(
            next(&guest_events).await,
            SignalingEvent::PeerConnected(id) if id == host_id
        ));
        assert!(matches!(
            next(&host_events).await,
            SignalingEvent::PeerConnected(id) if id == guest_id
        ));

        let envelope = SignalEnvelope {
            target: Role::Answerer,
            payload: serde_json::json!({"type": "offer", "nonce": 1}),
        };
        guest.send_envelope(host_id, envelope.clone()).unwrap();
        match next(&host_events).await {
            SignalingEvent::Envelope { from, envelope: got } => {
                assert_eq!(from, guest_id);
                assert_eq!(got, envelope);
            }
            other => panic!("unexpected {other:?}"),
        }

        drop(guest);
        assert!(matches!(
            next(&host_events).await,
            SignalingEvent::PeerDisconnected(id) if id == guest_id
        ));
    }

    #[tokio::test]
    async fn stopping_the_server_disconnects_clients() {
        let server = SignalServer::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let task = tokio::spawn(server.run());

        let (client, events) = SignalingClient::connect(addr).await.unwrap();
        client.create_room("").unwrap();
        assert!(matches!(
            next(&events).await,
            SignalingEvent::RoomCreated { .. }
        ));
        task.abort();
        assert!(matches!(next(&events).await, SignalingEvent::Disconnected));
    }
}
