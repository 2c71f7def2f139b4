use std::net::SocketAddr;
use std::time::Duration;

use htunnel_core::signaling::DEFAULT_SIGNAL_SERVER;
use htunnel_core::socket::{Protocol, RemoteAddress};

/// Label of the channel carrying control messages. Lane labels are channel
/// names and never collide with it.
pub const CONTROL_CHANNEL_LABEL: &str = "control_label";
pub(crate) const READ_BUFFER_SIZE: usize = 32 * 1024;
pub(crate) const PENDING_QUEUE_CAP: usize = 16 * 1024 * 1024;
/// Control messages waiting for a full control channel, in bytes.
pub(crate) const CONTROL_BACKLOG_CAP: usize = 1024 * 1024;
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Lane targets announced before their channel opened.
pub(crate) const MAX_PENDING_TARGETS: usize = 1024;

/// What a client forwards: connections accepted on `local_addr` are carried to
/// the server peer, which connects them to `remote`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ForwardTarget {
    pub local_addr: SocketAddr,
    pub remote: RemoteAddress,
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Mode {
    /// Creates a room and opens outbound sockets on behalf of clients.
    Server,
    /// Joins a room and forwards local connections.
    Client(ForwardTarget),
}

impl Mode {
    pub fn is_server(&self) -> bool {
        matches!(self, Mode::Server)
    }
}

/// When a lane's data channel is closed after the lane finished.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum ChannelClosePolicy {
    #[default]
    Immediate,
    /// Keep the channel open for a while so that messages still in flight are
    /// not cut off.
    Deferred(Duration),
}

#[derive(Clone, Debug)]
pub struct LaneConfig {
    pub read_buffer_size: usize,
    pub pending_queue_cap: usize,
    pub close_policy: ChannelClosePolicy,
    pub connect_timeout: Duration,
    /// How long a lane closed by its peer keeps flushing queued bytes into
    /// its socket.
    pub drain_timeout: Duration,
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: READ_BUFFER_SIZE,
            pending_queue_cap: PENDING_QUEUE_CAP,
            close_policy: ChannelClosePolicy::default(),
            connect_timeout: CONNECT_TIMEOUT,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }
}

impl LaneConfig {
    pub fn set_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size.max(1);
        self
    }
    pub fn set_pending_queue_cap(mut self, pending_queue_cap: usize) -> Self {
        self.pending_queue_cap = pending_queue_cap;
        self
    }
    pub fn set_close_policy(mut self, close_policy: ChannelClosePolicy) -> Self {
        self.close_policy = close_policy;
        self
    }
    pub fn set_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
    pub fn set_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }
}

#[derive(Clone, Debug)]
pub struct TunnelConfig {
    pub mode: Mode,
    pub lane: LaneConfig,
    /// Run an offerer and an answerer session per peer.
    pub dual_role: bool,
    pub signal_server: SocketAddr,
    pub password: String,
    /// Room to join in client mode.
    pub room_id: Option<String>,
    pub exit_on_signaling_loss: bool,
}

impl TunnelConfig {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            lane: LaneConfig::default(),
            dual_role: true,
            signal_server: default_signal_server(),
            password: String::new(),
            room_id: None,
            exit_on_signaling_loss: true,
        }
    }
    pub fn set_lane_config(mut self, lane: LaneConfig) -> Self {
        self.lane = lane;
        self
    }
    pub fn set_dual_role(mut self, dual_role: bool) -> Self {
        self.dual_role = dual_role;
        self
    }
    pub fn set_signal_server(mut self, signal_server: SocketAddr) -> Self {
        self.signal_server = signal_server;
        self
    }
    pub fn set_password(mut self, password: String) -> Self {
        self.password = password;
        self
    }
    pub fn set_room_id(mut self, room_id: String) -> Self {
        self.room_id.replace(room_id);
        self
    }
    pub fn set_exit_on_signaling_loss(mut self, exit_on_signaling_loss: bool) -> Self {
        self.exit_on_signaling_loss = exit_on_signaling_loss;
        self
    }
}

fn default_signal_server() -> SocketAddr {
    DEFAULT_SIGNAL_SERVER
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8888)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{ChannelClosePolicy, LaneConfig, Mode, TunnelConfig};

    #[test]
    fn defaults() {
        let config = TunnelConfig::new(Mode::Server);
        assert!(config.dual_role);
        assert!(config.exit_on_signaling_loss);
        assert_eq!(config.signal_server.to_string(), "127.0.0.1:8888");
        assert_eq!(config.lane.read_buffer_size, 32 * 1024);
        assert_eq!(config.lane.pending_queue_cap, 16 * 1024 * 1024);
        assert_eq!(config.lane.close_policy, ChannelClosePolicy::Immediate);
    }

    #[test]
    fn setters() {
        let lane = LaneConfig::default()
            .set_read_buffer_size(0)
            .set_close_policy(ChannelClosePolicy::Deferred(Duration::from_millis(50)));
        assert_eq!(lane.read_buffer_size, 1);
        let config = TunnelConfig::new(Mode::Server)
            .set_lane_config(lane)
            .set_room_id("abc".into())
            .set_dual_role(false);
        assert_eq!(config.room_id.as_deref(), Some("abc"));
        assert!(!config.dual_role);
    }
}
