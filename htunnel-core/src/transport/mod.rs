//! The peer-to-peer transport as seen by a session.
//!
//! A [`Transport`] turns a [`Negotiation`] into a [`TransportSession`]. Offer
//! and answer payloads travel through the signaling service as
//! [`SignalEnvelope`]s; everything that happens on the established session is
//! reported as [`TransportEvent`]s on the channel handed in with the
//! negotiation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::{Error, Result};
use crate::PeerId;

pub mod codec;
mod direct;
mod loopback;

pub use direct::{DirectConfig, DirectTransport};
pub use loopback::{LoopbackNetwork, LoopbackTransport};

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Actively initiates the transport.
    Offerer,
    /// Waits for the remote offerer.
    Answerer,
}

impl Role {
    pub fn opposite(&self) -> Role {
        match self {
            Role::Offerer => Role::Answerer,
            Role::Answerer => Role::Offerer,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Offerer => f.write_str("offerer"),
            Role::Answerer => f.write_str("answerer"),
        }
    }
}

#[derive(Debug)]
pub enum TrySendError {
    /// The send window is used up; the message is handed back.
    Full(Bytes),
    Closed,
}

/// A reliable, ordered, message oriented channel inside a transport session.
#[async_trait]
pub trait DataChannel: Send + Sync + 'static {
    fn label(&self) -> &str;
    fn try_send(&self, data: Bytes) -> std::result::Result<(), TrySendError>;
    /// Resolves once `try_send` is expected to accept data again.
    /// Fails with [`Error::ChannelClosed`] after the channel closed.
    async fn writable(&self) -> Result<()>;
    /// Closing is idempotent. Both ends observe `ChannelClosed`.
    fn close(&self);
    fn is_closed(&self) -> bool;
}

pub type ChannelRef = Arc<dyn DataChannel>;

pub enum TransportEvent {
    /// The remote side opened a channel.
    ChannelOpened(ChannelRef),
    ChannelClosed(String),
    ChannelMessage { label: String, data: Bytes },
    SessionClosed,
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::ChannelOpened(channel) => {
                write!(f, "ChannelOpened({})", channel.label())
            }
            TransportEvent::ChannelClosed(label) => write!(f, "ChannelClosed({label})"),
            TransportEvent::ChannelMessage { label, data } => {
                write!(f, "ChannelMessage({label}, {} bytes)", data.len())
            }
            TransportEvent::SessionClosed => f.write_str("SessionClosed"),
        }
    }
}

pub trait TransportSession: Send + Sync + 'static {
    /// Opens a channel that can be used right away. Fails with
    /// [`Error::LabelInUse`] if a channel with the same label is open.
    fn open_channel(&self, label: &str) -> Result<ChannelRef>;
    /// Closes every channel and the session. Idempotent.
    fn close(&self);
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn establish(&self, negotiation: Negotiation) -> Result<Box<dyn TransportSession>>;
}

/// Everything a transport needs to bring up one session with one peer.
pub struct Negotiation {
    pub local_peer: PeerId,
    pub remote_peer: PeerId,
    pub role: Role,
    /// Sends offer/answer payloads to the remote counterpart.
    pub signal: Signaler,
    /// Payloads the remote counterpart sent to this session.
    pub envelopes: UnboundedReceiver<serde_json::Value>,
    pub events: UnboundedSender<TransportEvent>,
}

/// An offer/answer payload addressed to the session with role `target` on the
/// receiving peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub target: Role,
    pub payload: serde_json::Value,
}

#[derive(Clone, Debug)]
pub struct OutboundEnvelope {
    pub peer: PeerId,
    pub envelope: SignalEnvelope,
}

#[derive(Clone)]
pub struct Signaler {
    peer: PeerId,
    role: Role,
    sender: UnboundedSender<OutboundEnvelope>,
}

impl Signaler {
    pub fn new(peer: PeerId, role: Role, sender: UnboundedSender<OutboundEnvelope>) -> Self {
        Self { peer, role, sender }
    }
    pub fn send(&self, payload: serde_json::Value) -> Result<()> {
        let envelope = SignalEnvelope {
            target: self.role.opposite(),
            payload,
        };
        self.sender
            .send(OutboundEnvelope {
                peer: self.peer,
                envelope,
            })
            .map_err(|_| Error::Signaling("signaling output closed".into()))
    }
}
