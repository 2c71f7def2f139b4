//! # htunnel-core
//!
//! Building blocks shared by the `htunnel` session layer:
//!
//! - [`socket`] - local acceptor and outbound connector for TCP and UDP
//! - [`transport`] - the peer-to-peer transport seam, with an in-memory
//!   loopback and a direct TCP implementation
//! - [`signaling`] - room based rendezvous used to bootstrap a transport
//! - [`error`] - error type shared by all of the above
//!
//! ```rust,no_run
//! use htunnel_core::socket::{Acceptor, Protocol};
//!
//! # #[tokio::main]
//! # async fn main() -> std::io::Result<()> {
//! let mut acceptor = Acceptor::bind("127.0.0.1:8080".parse().unwrap(), Protocol::Tcp).await?;
//! while let Ok((stream, addr)) = acceptor.accept().await {
//!     log::info!("accepted {addr} {:?}", stream.peer_addr());
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
mod peer_id;
pub mod signaling;
pub mod socket;
pub mod transport;

pub use peer_id::PeerId;

/// Aborts the task when dropped.
pub struct OwnedJoinHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl OwnedJoinHandle {
    pub fn new(handle: tokio::task::JoinHandle<()>) -> Self {
        Self { handle }
    }
}

impl Drop for OwnedJoinHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
