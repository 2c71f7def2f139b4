//! Messages exchanged on the control channel.
//!
//! Every message is one JSON object `{"id": <u8>, "data": {..}}` sent as a
//! single channel message. Both peers use the same ids.

use bytes::Bytes;
use htunnel_core::socket::{Protocol, RemoteAddress};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lane::ChannelName;

mod channel;

pub use channel::ControlChannel;

#[derive(Eq, PartialEq, Copy, Clone, Debug)]
#[repr(u8)]
pub enum MessageId {
    CreateChannel,
    DeleteChannel,
    ChannelCreated,
    ServerSideReady,
    Unknown = 255,
}

impl From<u8> for MessageId {
    fn from(value: u8) -> Self {
        match value {
            0 => MessageId::CreateChannel,
            1 => MessageId::DeleteChannel,
            2 => MessageId::ChannelCreated,
            3 => MessageId::ServerSideReady,
            _ => MessageId::Unknown,
        }
    }
}

impl From<MessageId> for u8 {
    fn from(value: MessageId) -> Self {
        value as u8
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ControlMessage {
    /// Without a channel name this announces the forwarding target of a
    /// client session; with one it asks the peer to connect the lane of that
    /// name.
    CreateChannel {
        remote_address: RemoteAddress,
        protocol: Protocol,
        channel_name: Option<ChannelName>,
    },
    ChannelCreated,
    ServerSideReady {
        channel_name: ChannelName,
    },
    DeleteChannel {
        channel_name: ChannelName,
    },
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    id: u8,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChannelData {
    remote_address: String,
    protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    channel_name: Option<String>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelNameData {
    channel_name: String,
}

impl ControlMessage {
    pub fn id(&self) -> MessageId {
        match self {
            ControlMessage::CreateChannel { .. } => MessageId::CreateChannel,
            ControlMessage::ChannelCreated => MessageId::ChannelCreated,
            ControlMessage::ServerSideReady { .. } => MessageId::ServerSideReady,
            ControlMessage::DeleteChannel { .. } => MessageId::DeleteChannel,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let data = match self {
            ControlMessage::CreateChannel {
                remote_address,
                protocol,
                channel_name,
            } => serde_json::to_value(CreateChannelData {
                remote_address: remote_address.to_string(),
                protocol: protocol.to_string(),
                channel_name: channel_name.map(|name| name.to_string()),
            })?,
            ControlMessage::ChannelCreated => serde_json::Value::Object(Default::default()),
            ControlMessage::ServerSideReady { channel_name }
            | ControlMessage::DeleteChannel { channel_name } => {
                serde_json::to_value(ChannelNameData {
                    channel_name: channel_name.to_string(),
                })?
            }
        };
        let envelope = Envelope {
            id: self.id().into(),
            data,
        };
        Ok(Bytes::from(serde_json::to_vec(&envelope)?))
    }

    /// Validates the whole message; nothing half-parsed is returned.
    pub fn decode(buf: &[u8]) -> Result<ControlMessage> {
        let envelope: Envelope = serde_json::from_slice(buf)?;
        let invalid = |e: Error| Error::InvalidMessage(e.to_string());
        match MessageId::from(envelope.id) {
            MessageId::CreateChannel => {
                let data: CreateChannelData = serde_json::from_value(envelope.data)?;
                let protocol = data
                    .protocol
                    .parse::<Protocol>()
                    .map_err(|e| invalid(e.into()))?;
                let remote_address = data
                    .remote_address
                    .parse::<RemoteAddress>()
                    .map_err(|e| invalid(e.into()))?;
                let channel_name = match data.channel_name {
                    Some(name) => Some(name.parse::<ChannelName>().map_err(invalid)?),
                    None => None,
                };
                Ok(ControlMessage::CreateChannel {
                    remote_address,
                    protocol,
                    channel_name,
                })
            }
            MessageId::ChannelCreated => Ok(ControlMessage::ChannelCreated),
            MessageId::ServerSideReady => {
                let data: ChannelNameData = serde_json::from_value(envelope.data)?;
                Ok(ControlMessage::ServerSideReady {
                    channel_name: data.channel_name.parse()?,
                })
            }
            MessageId::DeleteChannel => {
                let data: ChannelNameData = serde_json::from_value(envelope.data)?;
                Ok(ControlMessage::DeleteChannel {
                    channel_name: data.channel_name.parse()?,
                })
            }
            MessageId::Unknown => Err(Error::InvalidMessage(format!(
                "unknown id {}",
                envelope.id
            ))),
        }
    }
}
