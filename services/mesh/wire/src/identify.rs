//! Identification PDU sent by the dialing side right after connecting.
//!
//! The accepting side reads it to route the fresh socket to the logical peer
//! instead of treating the connection as anonymous.

use crate::{Pdu, PeerId};
use bytes::{Buf, Bytes};

/// First opcode of the range reserved for transport control PDUs
pub const RESERVED_OPCODE_BASE: u32 = 0xFFFF_FF00;

/// Opcode of the identification PDU
pub const IDENTIFY_OPCODE: u32 = 0xFFFF_FF01;

impl Pdu {
    /// Build the identification PDU announcing `id`
    pub fn identify(id: PeerId) -> Pdu {
        Pdu::new(IDENTIFY_OPCODE, Bytes::copy_from_slice(&id.as_u64().to_be_bytes()))
    }

    /// Peer identity carried by an identification PDU
    pub fn as_identify(&self) -> Option<PeerId> {
        if self.opcode() != IDENTIFY_OPCODE || self.payload().len() != 8 {
            return None;
        }
        let mut payload = self.payload().clone();
        Some(PeerId::from_raw(payload.get_u64()))
    }

    /// Whether the opcode falls into the reserved control range
    pub fn is_reserved(&self) -> bool {
        self.opcode() >= RESERVED_OPCODE_BASE
    }
}
