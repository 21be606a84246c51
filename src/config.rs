//! Hub and session tunables

use std::time::Duration;

/// Maximum payload accepted from a peer, in bytes
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;
/// Capacity of each session's outbound queue
pub const DEFAULT_SEND_BUFFER: usize = 1024;
/// Capacity of the hub's broadcast intake queue
pub const DEFAULT_BROADCAST_BUFFER: usize = 2048;
/// Capacity of the register and unregister intake queues
pub const DEFAULT_CONTROL_BUFFER: usize = 3;
/// Time allowed to read the next frame from a peer
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(60);
/// Time allowed to write a frame to a peer
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(20);

/// Configuration shared by the hub and every session it serves
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Largest message a peer may send before the connection is torn down
    pub max_message_size: usize,

    /// Outbound queue capacity per session; a full queue gets the session evicted
    pub send_buffer: usize,

    /// Broadcast intake capacity; inbound pumps wait when it is full
    pub broadcast_buffer: usize,

    /// Register/unregister intake capacity
    pub control_buffer: usize,

    /// Read deadline, refreshed on every received frame
    pub pong_wait: Duration,

    /// Write deadline applied to every frame the server sends
    pub write_wait: Duration,

    /// Upper bound on registered sessions (unbounded when `None`)
    pub max_sessions: Option<usize>,

    /// Whether a peer receives its own broadcasts
    pub echo_to_sender: bool,
}

impl HubConfig {
    /// Heartbeat interval: 9/10 of the pong wait, so a ping always lands
    /// before the peer's read deadline.
    pub fn ping_period(&self) -> Duration {
        self.pong_wait * 9 / 10
    }

    /// Set the maximum accepted message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the per-session outbound queue capacity
    pub fn send_buffer(mut self, capacity: usize) -> Self {
        self.send_buffer = capacity.max(1);
        self
    }

    /// Set the broadcast intake capacity
    pub fn broadcast_buffer(mut self, capacity: usize) -> Self {
        self.broadcast_buffer = capacity.max(1);
        self
    }

    /// Set the read and write deadlines
    pub fn deadlines(mut self, pong_wait: Duration, write_wait: Duration) -> Self {
        self.pong_wait = pong_wait;
        self.write_wait = write_wait;
        self
    }

    /// Cap the number of concurrently registered sessions
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = Some(max);
        self
    }

    /// Enable or disable delivering a broadcast back to its sender
    pub fn echo_to_sender(mut self, echo: bool) -> Self {
        self.echo_to_sender = echo;
        self
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            send_buffer: DEFAULT_SEND_BUFFER,
            broadcast_buffer: DEFAULT_BROADCAST_BUFFER,
            control_buffer: DEFAULT_CONTROL_BUFFER,
            pong_wait: DEFAULT_PONG_WAIT,
            write_wait: DEFAULT_WRITE_WAIT,
            max_sessions: None,
            echo_to_sender: true,
        }
    }
}
