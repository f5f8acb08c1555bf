//! Transport error types.

use crate::endpoint::EndpointKind;
use pdu_wire::{PeerId, WireError};
use std::os::fd::RawFd;
use thiserror::Error;

/// Errors raised by the PDU transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// File descriptor is already registered with the monitor
    #[error("fd {0} already registered")]
    DuplicateFd(RawFd),

    /// File descriptor is not registered with the monitor
    #[error("fd {0} not registered")]
    UnknownFd(RawFd),

    /// Outbound queue is at capacity (throw mode)
    #[error("pdu queue full ({0} entries)")]
    QueueFull(usize),

    /// Callback overflow mode requires an event callback
    #[error("no event callback registered")]
    NoEventCallback,

    /// Unconsumed receive bytes would exceed the configured maximum
    #[error("peer receive buffer overflow: {buffered} bytes buffered, max {max}")]
    PeerBufferOverflow {
        /// Bytes that would be buffered
        buffered: usize,
        /// Configured maximum
        max: usize,
    },

    /// Synchronous send failed; the caller decides whether to retry
    #[error("send to peer failed: {0}")]
    PeerSendFailed(#[source] std::io::Error),

    /// Opcode belongs to the range reserved for transport control PDUs
    #[error("opcode {0:#x} is reserved for the transport")]
    ReservedOpcode(u32),

    /// No peer with this identifier exists in the set
    #[error("unknown peer {0}")]
    UnknownPeer(PeerId),

    /// Operation not supported by this endpoint variant
    #[error("unsupported on {0} endpoint")]
    Unsupported(EndpointKind),

    /// Address could not be used for the mesh
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Component was already started
    #[error("already started")]
    AlreadyStarted,

    /// Component is shutting down or already shut down
    #[error("shut down")]
    Shutdown,

    /// Wire protocol error; fatal to the connection
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
