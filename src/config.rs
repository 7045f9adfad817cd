use std::time::Duration;

/// Parameters governing the connection layer
///
/// Defaults match the capabilities of common GSM/GPRS modems: six
/// multiplexed sockets and a 1460-byte maximum payload per send command.
/// Timeouts are generous for data-bearing commands and short for
/// status/close commands, which the modem answers immediately.
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) max_conns: usize,
    pub(crate) max_chunk: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) send_timeout: Duration,
    pub(crate) status_timeout: Duration,
    pub(crate) queue_depth: usize,
    pub(crate) buffer_memory: usize,
    pub(crate) manual_receive: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_conns: 6,
            max_chunk: 1460,
            poll_interval: Duration::from_millis(500),
            send_timeout: Duration::from_secs(60),
            status_timeout: Duration::from_secs(1),
            queue_depth: 16,
            buffer_memory: 64 * 1024,
            manual_receive: false,
        }
    }
}

impl Config {
    /// Number of connection slots the modem exposes
    pub fn max_conns(&mut self, value: usize) -> &mut Self {
        self.max_conns = value;
        self
    }

    /// Maximum payload carried by a single send command
    ///
    /// Application writes are coalesced into chunks of this size before they
    /// are handed to the command executor.
    pub fn max_chunk(&mut self, value: usize) -> &mut Self {
        self.max_chunk = value;
        self
    }

    /// Interval between synthetic poll events on an active connection
    pub fn poll_interval(&mut self, value: Duration) -> &mut Self {
        self.poll_interval = value;
        self
    }

    /// Deadline for blocking start and send commands
    pub fn send_timeout(&mut self, value: Duration) -> &mut Self {
        self.send_timeout = value;
        self
    }

    /// Deadline for blocking status and close commands
    pub fn status_timeout(&mut self, value: Duration) -> &mut Self {
        self.status_timeout = value;
        self
    }

    /// Capacity of the producer command queue
    ///
    /// A full queue means no command envelope can be allocated and is
    /// reported as [`Error::Memory`].
    ///
    /// [`Error::Memory`]: crate::Error::Memory
    pub fn queue_depth(&mut self, value: usize) -> &mut Self {
        self.queue_depth = value;
        self
    }

    /// Total bytes of write-staging buffers the layer may hold at once
    ///
    /// Buffers handed off to the command executor no longer count against
    /// this budget.
    pub fn buffer_memory(&mut self, value: usize) -> &mut Self {
        self.buffer_memory = value;
        self
    }

    /// Enable manual acknowledgment of received data
    ///
    /// When set, received bytes accumulate against each connection until the
    /// application acknowledges them via [`Connection::ack_received`].
    ///
    /// [`Connection::ack_received`]: crate::Connection::ack_received
    pub fn manual_receive(&mut self, value: bool) -> &mut Self {
        self.manual_receive = value;
        self
    }
}
