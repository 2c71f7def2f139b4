//! Rendezvous through a signaling server.
//!
//! Peers meet in password protected rooms. The server assigns every member a
//! [`PeerId`], tells members about each other and relays offer/answer
//! envelopes between them. Messages are JSON objects `{"id": <u8>, "data": {..}}`,
//! one per line, over TCP.

use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::error::{Error, Result};
use crate::transport::SignalEnvelope;
use crate::{OwnedJoinHandle, PeerId};

mod server;

pub use server::SignalServer;

pub const DEFAULT_SIGNAL_SERVER: &str = "127.0.0.1:8888";
const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum MessageId {
    CreateRoom = 1,
    SignIn = 2,
    SignOut = 3,
    PeerConnected = 4,
    PeerDisconnected = 5,
    SendOffer = 6,
    ReceivedOffer = 7,
    Error = 8,
    Unknown = 255,
}

impl From<u8> for MessageId {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageId::CreateRoom,
            2 => MessageId::SignIn,
            3 => MessageId::SignOut,
            4 => MessageId::PeerConnected,
            5 => MessageId::PeerDisconnected,
            6 => MessageId::SendOffer,
            7 => MessageId::ReceivedOffer,
            8 => MessageId::Error,
            _ => MessageId::Unknown,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignalMessage {
    id: u8,
    #[serde(default)]
    data: serde_json::Value,
}

impl SignalMessage {
    fn new<T: Serialize>(id: MessageId, data: &T) -> Result<String> {
        let message = SignalMessage {
            id: id as u8,
            data: serde_json::to_value(data)?,
        };
        Ok(serde_json::to_string(&message)?)
    }
    fn data<T: DeserializeOwned>(self) -> Result<T> {
        Ok(serde_json::from_value(self.data)?)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CreateRoom {
    password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RoomCreated {
    successful: bool,
    #[serde(default)]
    room_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignIn {
    room_id: String,
    password: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignedIn {
    successful: bool,
    room_id: String,
    #[serde(default)]
    peer_id: PeerId,
    #[serde(default)]
    message: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SignOut {
    room_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct PeerNotice {
    peer_id: PeerId,
}

/// `peer_id` is the destination on `SendOffer` and the source on
/// `ReceivedOffer`.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct Offer {
    peer_id: PeerId,
    payload: SignalEnvelope,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ErrorNotice {
    message: String,
}

#[derive(Clone, Debug)]
pub enum SignalingEvent {
    RoomCreated { room_id: String },
    RoomJoined { room_id: String, local_peer: PeerId },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    Envelope { from: PeerId, envelope: SignalEnvelope },
    /// The server refused a request.
    Failure(String),
    /// The connection to the server is gone.
    Disconnected,
}

/// Connection to a signaling server. Events arrive on the receiver returned by
/// [`SignalingClient::connect`]; the last event is always `Disconnected`.
pub struct SignalingClient {
    sender: UnboundedSender<String>,
    _reader: OwnedJoinHandle,
    _writer: OwnedJoinHandle,
}

impl SignalingClient {
    pub async fn connect(
        addr: SocketAddr,
    ) -> Result<(SignalingClient, flume::Receiver<SignalingEvent>)> {
        let stream = TcpStream::connect(addr).await?;
        log::info!("connected to signal server {addr}");
        let (read, write) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = flume::unbounded();
        let writer = tokio::spawn(write_lines(
            FramedWrite::new(write, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            receiver,
        ));
        let reader = tokio::spawn(read_events(
            FramedRead::new(read, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
            event_sender,
        ));
        let client = SignalingClient {
            sender,
            _reader: OwnedJoinHandle::new(reader),
            _writer: OwnedJoinHandle::new(writer),
        };
        Ok((client, event_receiver))
    }

    pub fn create_room(&self, password: &str) -> Result<()> {
        self.send(SignalMessage::new(
            MessageId::CreateRoom,
            &CreateRoom {
                password: password.to_string(),
            },
        )?)
    }

    pub fn sign_in(&self, room_id: &str, password: &str) -> Result<()> {
        self.send(SignalMessage::new(
            MessageId::SignIn,
            &SignIn {
                room_id: room_id.to_string(),
                password: password.to_string(),
            },
        )?)
    }

    pub fn sign_out(&self, room_id: &str) -> Result<()> {
        self.send(SignalMessage::new(
            MessageId::SignOut,
            &SignOut {
                room_id: room_id.to_string(),
            },
        )?)
    }

    pub fn send_envelope(&self, peer: PeerId, envelope: SignalEnvelope) -> Result<()> {
        self.send(SignalMessage::new(
            MessageId::SendOffer,
            &Offer {
                peer_id: peer,
                payload: envelope,
            },
        )?)
    }

    fn send(&self, line: String) -> Result<()> {
        self.sender
            .send(line)
            .map_err(|_| Error::Signaling("connection closed".into()))
    }
}

async fn write_lines(
    mut write: FramedWrite<OwnedWriteHalf, LinesCodec>,
    mut lines: UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = write.send(line).await {
            log::warn!("signal write {e:?}");
            break;
        }
    }
}

async fn read_events(
    mut read: FramedRead<OwnedReadHalf, LinesCodec>,
    events: flume::Sender<SignalingEvent>,
) {
    while let Some(rs) = read.next().await {
        let line = match rs {
            Ok(line) => line,
            Err(e) => {
                log::warn!("signal read {e:?}");
                break;
            }
        };
        match parse_event(&line) {
            Ok(Some(event)) => {
                if events.send_async(event).await.is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("invalid signal message {line:?} {e:?}"),
        }
    }
    log::info!("signal server connection closed");
    let _ = events.send_async(SignalingEvent::Disconnected).await;
}

fn parse_event(line: &str) -> Result<Option<SignalingEvent>> {
    let message: SignalMessage = serde_json::from_str(line)?;
    let event = match MessageId::from(message.id) {
        MessageId::CreateRoom => {
            let reply: RoomCreated = message.data()?;
            if reply.successful {
                SignalingEvent::RoomCreated {
                    room_id: reply.room_id,
                }
            } else {
                SignalingEvent::Failure("room creation failed".into())
            }
        }
        MessageId::SignIn => {
            let reply: SignedIn = message.data()?;
            if reply.successful {
                SignalingEvent::RoomJoined {
                    room_id: reply.room_id,
                    local_peer: reply.peer_id,
                }
            } else {
                SignalingEvent::Failure(format!("sign in failed: {}", reply.message))
            }
        }
        MessageId::PeerConnected => {
            SignalingEvent::PeerConnected(message.data::<PeerNotice>()?.peer_id)
        }
        MessageId::PeerDisconnected => {
            SignalingEvent::PeerDisconnected(message.data::<PeerNotice>()?.peer_id)
        }
        MessageId::ReceivedOffer => {
            let offer: Offer = message.data()?;
            SignalingEvent::Envelope {
                from: offer.peer_id,
                envelope: offer.payload,
            }
        }
        MessageId::Error => SignalingEvent::Failure(message.data::<ErrorNotice>()?.message),
        id => {
            log::debug!("unexpected signal message {id:?}");
            return Ok(None);
        }
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::{parse_event, MessageId, SignalingEvent};
    use crate::transport::Role;
    use crate::PeerId;

    #[test]
    fn message_id_from_u8() {
        assert_eq!(MessageId::from(7), MessageId::ReceivedOffer);
        assert_eq!(MessageId::from(0), MessageId::Unknown);
    }

    #[test]
    fn parse_server_messages() {
        let event = parse_event(
            r#"{"id":2,"data":{"successful":true,"room_id":"ab12","peer_id":3,"message":""}}"#,
        )
        .unwrap();
        assert!(matches!(
            event,
            Some(SignalingEvent::RoomJoined { ref room_id, local_peer })
                if room_id == "ab12" && local_peer == PeerId::new(3)
        ));

        let event = parse_event(
            r#"{"id":7,"data":{"peer_id":5,"payload":{"target":"answerer","payload":{"x":1}}}}"#,
        )
        .unwrap();
        match event {
            Some(SignalingEvent::Envelope { from, envelope }) => {
                assert_eq!(from, PeerId::new(5));
                assert_eq!(envelope.target, Role::Answerer);
            }
            other => panic!("unexpected {other:?}"),
        }

        let event = parse_event(r#"{"id":1,"data":{"successful":false}}"#).unwrap();
        assert!(matches!(event, Some(SignalingEvent::Failure(_))));
        assert!(parse_event(r#"{"id":99}"#).unwrap().is_none());
        assert!(parse_event("not json").is_err());
    }
}
