use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("channel closed")]
    ChannelClosed,
    #[error("channel label already in use: {0}")]
    LabelInUse(String),
    #[error("session closed")]
    SessionClosed,
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid protocol: {0}")]
    InvalidProtocol(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("timeout")]
    Timeout,
    #[error("signaling: {0}")]
    Signaling(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = ::std::result::Result<T, E>;
