//! Poll queue for received PDUs when no callback consumes them.

use parking_lot::Mutex;
use pdu_wire::{Pdu, PeerId};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Bounded FIFO of received PDUs; the oldest entry is dropped on overflow
#[derive(Debug)]
pub(crate) struct InboundQueue {
    peer_id: PeerId,
    limit: usize,
    pdus: Mutex<VecDeque<Arc<Pdu>>>,
}

impl InboundQueue {
    pub(crate) fn new(peer_id: PeerId, limit: usize) -> Self {
        Self {
            peer_id,
            limit: limit.max(1),
            pdus: Mutex::new(VecDeque::new()),
        }
    }

    /// Append `pdu`; returns the PDU evicted to make room, if any
    pub(crate) fn push(&self, pdu: Arc<Pdu>) -> Option<Arc<Pdu>> {
        let mut pdus = self.pdus.lock();
        let evicted = if pdus.len() >= self.limit {
            pdus.pop_front()
        } else {
            None
        };
        pdus.push_back(pdu);
        drop(pdus);

        if let Some(old) = &evicted {
            warn!(
                "Poll queue of peer {} is full ({} PDUs), dropped PDU opcode {}",
                self.peer_id,
                self.limit,
                old.opcode()
            );
        }
        evicted
    }

    pub(crate) fn pop(&self) -> Option<Arc<Pdu>> {
        self.pdus.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pdus.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.pdus.lock().len()
    }

    pub(crate) fn clear(&self) {
        self.pdus.lock().clear();
    }
}
