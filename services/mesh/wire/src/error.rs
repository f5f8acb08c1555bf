//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Unsupported PDU version; payload layout is version dependent so this is fatal
    #[error("invalid pdu version: {0}")]
    InvalidVersion(u32),

    /// Declared section size exceeds the hard limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Malformed PDU structure
    #[error("malformed pdu: {0}")]
    Malformed(&'static str),

    /// Address could not be mapped to a peer identity
    #[error("invalid peer address: {0}")]
    Address(String),

    /// I/O failure while reading or writing a PDU on a blocking stream
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
