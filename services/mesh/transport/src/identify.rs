//! Identification exchange that opens every mesh connection.
//!
//! The dialing side writes one identification PDU carrying its own peer
//! identifier before any application traffic. The accepting side reads exactly
//! that PDU and nothing more, so the socket can be handed to the peer's endpoint
//! with the application stream intact.

use crate::error::Result;
use pdu_wire::{
    Pdu, PduHeader, PeerId, WireError, IDENTIFY_OPCODE, OPTIONAL_HEADER_SIZE, PDU_HEADER_SIZE,
};
use std::io::Write;
use std::net::TcpStream;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Size of the identification PDU on the wire
pub const IDENTIFY_PDU_SIZE: usize = PDU_HEADER_SIZE + 8 + OPTIONAL_HEADER_SIZE;

/// Write the identification PDU on a freshly connected blocking socket
pub fn send_identify(stream: &mut TcpStream, local: PeerId, timeout: Duration) -> Result<()> {
    stream.set_write_timeout(Some(timeout))?;
    stream.write_all(&Pdu::identify(local).encode()?)?;
    stream.set_write_timeout(None)?;
    debug!("Sent identification as {}", local);
    Ok(())
}

/// Read the identification PDU from a freshly accepted socket
pub async fn recv_identify<R: AsyncReadExt + Unpin>(reader: &mut R) -> Result<PeerId> {
    let mut buf = [0u8; IDENTIFY_PDU_SIZE];
    reader.read_exact(&mut buf[..PDU_HEADER_SIZE]).await?;

    // reject before reading further so a stray client cannot stall the handler
    let header = PduHeader::decode(&buf[..PDU_HEADER_SIZE])?;
    if header.opcode != IDENTIFY_OPCODE || header.payload_size != 8 {
        return Err(WireError::Malformed("expected identification pdu").into());
    }

    reader.read_exact(&mut buf[PDU_HEADER_SIZE..]).await?;
    let peer = match Pdu::decode(&buf)? {
        Some((pdu, _)) => pdu.as_identify(),
        None => None,
    };
    let peer = peer.ok_or(WireError::Malformed("identification carries optional data"))?;

    debug!("Received identification from {}", peer);
    Ok(peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_reads_exactly_the_identification() {
        let id = PeerId::from_addr("127.0.0.1:13001".parse().unwrap());
        let mut stream = Pdu::identify(id).encode().unwrap().to_vec();
        let trailing = Pdu::new(1, Bytes::from_static(b"app")).encode().unwrap();
        stream.extend_from_slice(&trailing);

        let mut reader = stream.as_slice();
        assert_eq!(recv_identify(&mut reader).await.unwrap(), id);
        assert_eq!(reader, &trailing[..]);
    }

    #[tokio::test]
    async fn test_rejects_application_pdu() {
        let bytes = Pdu::new(1, Bytes::from(vec![0u8; 8])).encode().unwrap();
        let mut reader = &bytes[..];
        assert!(matches!(
            recv_identify(&mut reader).await,
            Err(TransportError::Wire(WireError::Malformed(_)))
        ));
    }

    #[tokio::test]
    async fn test_short_stream_is_io_error() {
        let bytes = Pdu::identify(PeerId::from_raw(5)).encode().unwrap();
        let mut reader = &bytes[..10];
        assert!(matches!(
            recv_identify(&mut reader).await,
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn test_blocking_send() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        let id = PeerId::from_raw(0xABCD);
        send_identify(&mut client, id, Duration::from_secs(1)).unwrap();
        assert_eq!(Pdu::read_from(&mut server).unwrap().as_identify(), Some(id));
    }
}
