//! Growable receive buffer with explicit consumed and high-water indices.

use crate::config::RecvBufferConfig;
use crate::error::{Result, TransportError};
use pdu_wire::Pdu;

/// Receive buffer of one socket endpoint
///
/// Bytes in `data[start..end]` are received but not yet decoded. Space is
/// reclaimed by compacting the live region to the front before growing.
#[derive(Debug)]
pub struct RecvBuffer {
    data: Vec<u8>,
    start: usize,
    end: usize,
    config: RecvBufferConfig,
}

impl RecvBuffer {
    /// Create a buffer with the configured initial capacity
    pub fn new(config: RecvBufferConfig) -> Self {
        let initial = config.initial_size.min(config.max_size);
        Self {
            data: vec![0; initial],
            start: 0,
            end: 0,
            config,
        }
    }

    /// Received bytes not yet consumed by the decoder
    pub fn unconsumed(&self) -> usize {
        self.end - self.start
    }

    /// Bytes that can still be accepted before overflowing
    pub fn remaining_room(&self) -> usize {
        self.config.max_size - self.unconsumed()
    }

    /// Current allocated capacity
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Append received bytes
    ///
    /// Fails with `PeerBufferOverflow` when the unconsumed bytes would exceed the
    /// configured maximum; the buffer is left unchanged in that case.
    pub fn extend(&mut self, bytes: &[u8]) -> Result<()> {
        let needed = self.unconsumed() + bytes.len();
        if needed > self.config.max_size {
            return Err(TransportError::PeerBufferOverflow {
                buffered: needed,
                max: self.config.max_size,
            });
        }

        if self.end + bytes.len() > self.data.len() {
            self.compact();
        }
        if needed > self.data.len() {
            let mut capacity = self.data.len();
            while capacity < needed {
                capacity = (capacity + self.config.step_size.max(1)).min(self.config.max_size);
            }
            self.data.resize(capacity, 0);
        }

        self.data[self.end..self.end + bytes.len()].copy_from_slice(bytes);
        self.end += bytes.len();
        Ok(())
    }

    /// Decode the next complete PDU and drop its bytes from the front
    pub fn next_pdu(&mut self) -> Result<Option<Pdu>> {
        match Pdu::decode(&self.data[self.start..self.end])? {
            Some((pdu, used)) => {
                self.start += used;
                if self.start == self.end {
                    self.start = 0;
                    self.end = 0;
                }
                Ok(Some(pdu))
            }
            None => Ok(None),
        }
    }

    /// Discard everything, keeping the current allocation
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.data.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use proptest::collection;
    use proptest::prelude::*;

    fn config(initial: usize, step: usize, max: usize) -> RecvBufferConfig {
        RecvBufferConfig {
            initial_size: initial,
            step_size: step,
            max_size: max,
        }
    }

    #[test]
    fn test_exactly_max_is_accepted() {
        let mut buf = RecvBuffer::new(config(16, 16, 64));
        buf.extend(&[0u8; 40]).unwrap();
        buf.extend(&[0u8; 24]).unwrap();
        assert_eq!(buf.unconsumed(), 64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.remaining_room(), 0);
    }

    #[test]
    fn test_beyond_max_overflows() {
        let mut buf = RecvBuffer::new(config(16, 16, 64));
        buf.extend(&[0u8; 64]).unwrap();
        match buf.extend(&[0u8; 1]) {
            Err(TransportError::PeerBufferOverflow { buffered, max }) => {
                assert_eq!(buffered, 65);
                assert_eq!(max, 64);
            }
            other => panic!("expected overflow, got {:?}", other),
        }
        assert_eq!(buf.unconsumed(), 64);
    }

    #[test]
    fn test_grows_by_step() {
        let mut buf = RecvBuffer::new(config(8, 8, 1024));
        buf.extend(&[1u8; 9]).unwrap();
        assert_eq!(buf.capacity(), 16);
        buf.extend(&[1u8; 10]).unwrap();
        assert_eq!(buf.capacity(), 24);
    }

    #[test]
    fn test_decode_and_compact() {
        let pdu = Pdu::new(5, Bytes::from_static(b"abcdef"));
        let encoded = pdu.encode().unwrap();
        let mut buf = RecvBuffer::new(config(32, 32, 256));

        // two PDUs fed byte by byte
        let mut decoded = Vec::new();
        for byte in encoded.iter().chain(encoded.iter()) {
            buf.extend(&[*byte]).unwrap();
            while let Some(pdu) = buf.next_pdu().unwrap() {
                decoded.push(pdu);
            }
        }
        assert_eq!(decoded, vec![pdu.clone(), pdu]);
        assert_eq!(buf.unconsumed(), 0);
    }

    #[test]
    fn test_consumed_space_is_reused() {
        let pdu = Pdu::new(5, Bytes::from_static(b"0123456789"));
        let encoded = pdu.encode().unwrap();
        let max = encoded.len() + 2;
        let mut buf = RecvBuffer::new(config(max, 4, max));

        for _ in 0..10 {
            buf.extend(&encoded).unwrap();
            assert_eq!(buf.next_pdu().unwrap(), Some(pdu.clone()));
        }

        // partial leftover is compacted to the front on the next extend
        buf.extend(&encoded[..3]).unwrap();
        buf.extend(&encoded).unwrap_err();
        buf.extend(&encoded[3..]).unwrap();
        assert_eq!(buf.next_pdu().unwrap(), Some(pdu));
    }

    #[test]
    fn test_invalid_version_surfaces() {
        let mut bytes = Pdu::new(1, Bytes::new()).encode().unwrap().to_vec();
        bytes[0] = 0xFF;
        let mut buf = RecvBuffer::new(RecvBufferConfig::default());
        buf.extend(&bytes).unwrap();
        assert!(matches!(buf.next_pdu(), Err(TransportError::Wire(_))));
    }

    fn arb_pdu() -> impl Strategy<Value = Pdu> {
        (
            any::<u32>(),
            collection::vec(any::<u8>(), 0..300),
            any::<u32>(),
            collection::vec(any::<u8>(), 0..100),
        )
            .prop_map(|(opcode, payload, payload_version, optional)| {
                Pdu::new(opcode, payload).with_optional_data(payload_version, optional)
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128, .. ProptestConfig::default()
        })]

        #[test]
        fn test_reassembles_across_any_split(
            pdus in collection::vec(arb_pdu(), 1..6),
            cuts in collection::vec(any::<prop::sample::Index>(), 0..16),
            initial in 1usize..64,
            step in 1usize..64,
        ) {
            let mut stream = BytesMut::new();
            for pdu in &pdus {
                pdu.encode_into(&mut stream).unwrap();
            }
            let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len() + 1)).collect();
            points.push(stream.len());
            points.sort_unstable();

            // room for the whole stream, so only framing is under test
            let mut buf = RecvBuffer::new(config(initial, step, stream.len()));
            let mut decoded = Vec::new();
            let mut from = 0;
            for to in points {
                buf.extend(&stream[from..to]).unwrap();
                from = to;
                while let Some(pdu) = buf.next_pdu().unwrap() {
                    decoded.push(pdu);
                }
            }
            prop_assert_eq!(decoded, pdus);
            prop_assert_eq!(buf.unconsumed(), 0);
            prop_assert!(buf.capacity() <= stream.len());
        }
    }
}
