//! PDU framing, encoding/decoding and peer identity for the PDU mesh.
//!
//! This crate is the pure codec layer of the mesh transport: it has no I/O
//! beyond the blocking `read_from`/`write_to` helpers.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 version          | must be PDU_VERSION        |
//! +----------------------+----------------------------+
//! | u32 opcode           | application message type   |
//! +----------------------+----------------------------+
//! | u32 payload_size     |                            |
//! +----------------------+----------------------------+
//! | payload              | payload_size bytes         |
//! +----------------------+----------------------------+
//! | u32 optional_size    | 0 when absent              |
//! +----------------------+----------------------------+
//! | u32 payload_version  | optional data layout tag   |
//! +----------------------+----------------------------+
//! | optional_data        | optional_size bytes        |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are big-endian.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod identify;
pub mod pdu;
pub mod peer_id;

// Re-export main types
pub use error::WireError;
pub use identify::{IDENTIFY_OPCODE, RESERVED_OPCODE_BASE};
pub use pdu::{
    OptionalDataHeader, Pdu, PduHeader, MAX_SECTION_SIZE, OPTIONAL_HEADER_SIZE, PDU_HEADER_SIZE,
    PDU_VERSION,
};
pub use peer_id::PeerId;
