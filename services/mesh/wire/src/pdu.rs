//! PDU framing for the wire protocol.
//!
//! A PDU is a fixed 12-byte header, the fixed payload, then an 8-byte
//! optional-data header followed by the optional data itself. The optional-data
//! header is always present (size 0 when there is no trailing data), so the total
//! frame length is known as soon as both fixed headers have arrived.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Supported PDU version
pub const PDU_VERSION: u32 = 1;

/// PDU header size in bytes
pub const PDU_HEADER_SIZE: usize = 12;

/// Optional-data header size in bytes
pub const OPTIONAL_HEADER_SIZE: usize = 8;

/// Hard limit for a single payload or optional-data section (64 MiB)
pub const MAX_SECTION_SIZE: usize = 64 * 1024 * 1024;

/// Fixed PDU header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PduHeader {
    /// Wire version, must equal [`PDU_VERSION`]
    pub version: u32,
    /// Application-defined message type
    pub opcode: u32,
    /// Size of the fixed payload that follows
    pub payload_size: u32,
}

impl PduHeader {
    /// Encode the header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.version);
        buf.put_u32(self.opcode);
        buf.put_u32(self.payload_size);
    }

    /// Decode and validate a header from the first [`PDU_HEADER_SIZE`] bytes of `buf`
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < PDU_HEADER_SIZE {
            return Err(WireError::Malformed("short pdu header"));
        }

        let version = buf.get_u32();
        if version != PDU_VERSION {
            return Err(WireError::InvalidVersion(version));
        }

        let opcode = buf.get_u32();
        let payload_size = buf.get_u32();
        if payload_size as usize > MAX_SECTION_SIZE {
            return Err(WireError::Size(payload_size as usize));
        }

        Ok(Self {
            version,
            opcode,
            payload_size,
        })
    }
}

/// Header of the trailing optional-data block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionalDataHeader {
    /// Number of optional-data bytes that follow
    pub size: u32,
    /// Secondary version tag describing the optional data layout
    pub payload_version: u32,
}

impl OptionalDataHeader {
    /// Encode the optional-data header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.size);
        buf.put_u32(self.payload_version);
    }

    /// Decode the optional-data header from the first [`OPTIONAL_HEADER_SIZE`] bytes of `buf`
    pub fn decode(mut buf: &[u8]) -> Result<Self, WireError> {
        if buf.len() < OPTIONAL_HEADER_SIZE {
            return Err(WireError::Malformed("short optional-data header"));
        }

        let size = buf.get_u32();
        if size as usize > MAX_SECTION_SIZE {
            return Err(WireError::Size(size as usize));
        }
        let payload_version = buf.get_u32();

        Ok(Self {
            size,
            payload_version,
        })
    }
}

/// One protocol data unit
///
/// Immutable once built; share it between queues and send paths as `Arc<Pdu>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    version: u32,
    opcode: u32,
    payload: Bytes,
    payload_version: u32,
    optional_data: Bytes,
}

impl Pdu {
    /// Create a PDU with the given opcode and payload and no optional data
    pub fn new(opcode: u32, payload: impl Into<Bytes>) -> Self {
        Self {
            version: PDU_VERSION,
            opcode,
            payload: payload.into(),
            payload_version: 0,
            optional_data: Bytes::new(),
        }
    }

    /// Attach a trailing optional-data block tagged with `payload_version`
    pub fn with_optional_data(mut self, payload_version: u32, data: impl Into<Bytes>) -> Self {
        self.payload_version = payload_version;
        self.optional_data = data.into();
        self
    }

    /// Wire version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Application-defined message type
    pub fn opcode(&self) -> u32 {
        self.opcode
    }

    /// Fixed payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Version tag of the optional data block
    pub fn payload_version(&self) -> u32 {
        self.payload_version
    }

    /// Optional trailing data (empty when absent)
    pub fn optional_data(&self) -> &Bytes {
        &self.optional_data
    }

    /// Whether a non-empty optional data block is attached
    pub fn has_optional_data(&self) -> bool {
        !self.optional_data.is_empty()
    }

    /// Header describing this PDU
    pub fn header(&self) -> PduHeader {
        PduHeader {
            version: self.version,
            opcode: self.opcode,
            payload_size: u32::try_from(self.payload.len()).unwrap_or(u32::MAX),
        }
    }

    /// Check both sections against [`MAX_SECTION_SIZE`]
    pub fn validate(&self) -> Result<(), WireError> {
        for len in [self.payload.len(), self.optional_data.len()] {
            if len > MAX_SECTION_SIZE {
                return Err(WireError::Size(len));
            }
        }
        Ok(())
    }

    /// Total size on the wire
    pub fn encoded_size(&self) -> usize {
        PDU_HEADER_SIZE + self.payload.len() + OPTIONAL_HEADER_SIZE + self.optional_data.len()
    }

    /// Encode into an existing buffer
    ///
    /// Fails with [`WireError::Size`] before writing anything if a section is
    /// larger than a peer would accept.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), WireError> {
        self.validate()?;
        buf.reserve(self.encoded_size());
        self.header().encode(buf);
        buf.put_slice(&self.payload);
        OptionalDataHeader {
            size: self.optional_data.len() as u32,
            payload_version: self.payload_version,
        }
        .encode(buf);
        buf.put_slice(&self.optional_data);
        Ok(())
    }

    /// Encode to a contiguous buffer
    pub fn encode(&self) -> Result<Bytes, WireError> {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one PDU from the front of `buf`
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold the complete PDU,
    /// otherwise the PDU and the number of bytes to drop from the front.
    pub fn decode(buf: &[u8]) -> Result<Option<(Pdu, usize)>, WireError> {
        if buf.len() < PDU_HEADER_SIZE {
            return Ok(None);
        }

        let header = PduHeader::decode(buf)?;
        let optional_at = PDU_HEADER_SIZE + header.payload_size as usize;
        if buf.len() < optional_at + OPTIONAL_HEADER_SIZE {
            return Ok(None);
        }

        let optional = OptionalDataHeader::decode(&buf[optional_at..])?;
        let data_at = optional_at + OPTIONAL_HEADER_SIZE;
        let total = data_at + optional.size as usize;
        if buf.len() < total {
            return Ok(None);
        }

        let pdu = Pdu {
            version: header.version,
            opcode: header.opcode,
            payload: Bytes::copy_from_slice(&buf[PDU_HEADER_SIZE..optional_at]),
            payload_version: optional.payload_version,
            optional_data: Bytes::copy_from_slice(&buf[data_at..total]),
        };

        Ok(Some((pdu, total)))
    }

    /// Read exactly one PDU from a blocking reader
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Pdu, WireError> {
        let mut header_buf = [0u8; PDU_HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;
        let header = PduHeader::decode(&header_buf)?;

        let mut payload = vec![0u8; header.payload_size as usize];
        reader.read_exact(&mut payload)?;

        let mut optional_buf = [0u8; OPTIONAL_HEADER_SIZE];
        reader.read_exact(&mut optional_buf)?;
        let optional = OptionalDataHeader::decode(&optional_buf)?;

        let mut optional_data = vec![0u8; optional.size as usize];
        reader.read_exact(&mut optional_data)?;

        Ok(Pdu {
            version: header.version,
            opcode: header.opcode,
            payload: Bytes::from(payload),
            payload_version: optional.payload_version,
            optional_data: Bytes::from(optional_data),
        })
    }

    /// Write the encoded PDU to a blocking writer
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), WireError> {
        writer.write_all(&self.encode()?)?;
        writer.flush()?;
        Ok(())
    }
}
