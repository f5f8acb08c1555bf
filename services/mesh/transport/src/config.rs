//! Configuration structures for the PDU transport.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Behavior of [`PduQueue::enqueue_pdu`](crate::PduQueue::enqueue_pdu) when the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Fail immediately with `QueueFull`, queue unchanged
    #[default]
    Throw,
    /// Block the producer until a slot frees
    Block,
    /// Drop the new PDU and report it through a `SendError` event
    Callback,
}

impl FromStr for QueueMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "throw" => Ok(QueueMode::Throw),
            "block" => Ok(QueueMode::Block),
            "callback" => Ok(QueueMode::Callback),
            other => Err(format!(
                "invalid queue mode: {} (expected throw, block or callback)",
                other
            )),
        }
    }
}

impl fmt::Display for QueueMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueueMode::Throw => "throw",
            QueueMode::Block => "block",
            QueueMode::Callback => "callback",
        };
        f.write_str(name)
    }
}

/// Per-peer outbound queue configuration
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum number of queued PDUs
    pub max_size: usize,
    /// Overflow behavior
    pub mode: QueueMode,
    /// Queued PDUs older than this are dropped on dequeue; `None` disables expiry
    pub pdu_timeout: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            mode: QueueMode::Throw,
            pdu_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Receive buffer sizing for socket endpoints
#[derive(Clone, Debug)]
pub struct RecvBufferConfig {
    /// Initial capacity in bytes
    pub initial_size: usize,
    /// Growth step in bytes
    pub step_size: usize,
    /// Maximum unconsumed bytes before the peer is considered desynchronized
    pub max_size: usize,
}

impl Default for RecvBufferConfig {
    fn default() -> Self {
        Self {
            initial_size: 64 * 1024,
            step_size: 64 * 1024,
            max_size: 16 * 1024 * 1024, // 16 MiB
        }
    }
}

/// Configuration for the transport stack of one mesh node
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// Outbound queue settings applied to every peer
    pub queue: QueueConfig,
    /// Receive buffer settings applied to every socket endpoint
    pub recv_buffer: RecvBufferConfig,
    /// Upper bound of one monitor wait, bounds shutdown latency
    pub poll_timeout: Duration,
    /// Maximum time a single synchronous send may wait for socket space
    pub send_timeout: Duration,
    /// Timeout of one outbound connection attempt
    pub connect_timeout: Duration,
    /// Initial delay before redialing a connector peer
    pub reconnect_initial: Duration,
    /// Maximum delay between redial attempts
    pub reconnect_max: Duration,
    /// Time an accepted socket has to send its identification PDU
    pub identify_timeout: Duration,
    /// Worker threads of the inbound connection dispatcher
    pub inbound_workers: usize,
    /// Maximum inbound connections handled concurrently
    pub max_inbound_handlers: usize,
    /// Received PDUs kept per peer for polling when no callback is set
    pub max_inbound_pdus: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            recv_buffer: RecvBufferConfig::default(),
            poll_timeout: Duration::from_millis(100),
            send_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(30),
            identify_timeout: Duration::from_secs(5),
            inbound_workers: 2,
            max_inbound_handlers: 16,
            max_inbound_pdus: 1000,
        }
    }
}

impl TransportConfig {
    /// Configuration with short timers for loopback clusters and tests
    pub fn local_network() -> Self {
        Self {
            poll_timeout: Duration::from_millis(20),
            send_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_millis(500),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(500),
            identify_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}
