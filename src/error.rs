use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("out of the storage: capacity is {cap} required is at least {required}")]
    Overflow { cap: usize, required: usize },
    #[error("invalid argument:{0}")]
    InvalidArgument(String),
    #[error("invalid control message:{0}")]
    InvalidMessage(String),
    #[error("invalid channel name:{0}")]
    InvalidChannelName(String),
    #[error("session is not serving")]
    NotServing,
    #[error("session closed")]
    SessionClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Core(#[from] htunnel_core::error::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
