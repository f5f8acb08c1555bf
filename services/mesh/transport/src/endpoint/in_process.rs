//! Loopback endpoint for the local node.

use super::inbound::InboundQueue;
use super::{EndpointKind, PduPeerEndpoint};
use crate::error::{Result, TransportError};
use crate::event::{CallbackSlot, EndpointCallback, EndpointEvent};
use pdu_wire::{Pdu, PeerId};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Endpoint whose sends are delivered straight back as received PDUs
#[derive(Debug)]
pub struct InProcessEndpoint {
    peer_id: PeerId,
    connected: AtomicBool,
    inbound: InboundQueue,
    callback: CallbackSlot<EndpointEvent>,
}

impl InProcessEndpoint {
    /// Create a stopped loopback endpoint keeping up to `inbound_limit` unpolled PDUs
    pub fn new(peer_id: PeerId, inbound_limit: usize) -> Self {
        Self {
            peer_id,
            connected: AtomicBool::new(false),
            inbound: InboundQueue::new(peer_id, inbound_limit),
            callback: CallbackSlot::new(),
        }
    }
}

impl PduPeerEndpoint for InProcessEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::InProcess
    }

    fn set_event_callback(&self, callback: EndpointCallback) {
        self.callback.set(callback);
    }

    fn start(&self) -> Result<()> {
        if !self.connected.swap(true, Ordering::AcqRel) {
            info!("Local peer {} connected in process", self.peer_id);
            self.callback.fire(EndpointEvent::connected());
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn is_pdu_ready(&self) -> bool {
        !self.inbound.is_empty()
    }

    fn recv_pdu(&self) -> Option<Arc<Pdu>> {
        self.inbound.pop()
    }

    fn send_pdu(&self, pdu: &Arc<Pdu>) -> Result<()> {
        if !self.is_connected() {
            return Err(TransportError::PeerSendFailed(io::Error::new(
                io::ErrorKind::NotConnected,
                "local peer not started",
            )));
        }
        debug!("Looping back PDU opcode {} to {}", pdu.opcode(), self.peer_id);
        if !self.callback.fire(EndpointEvent::received(pdu.clone())) {
            self.inbound.push(pdu.clone());
        }
        Ok(())
    }

    fn shutdown(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.callback.fire(EndpointEvent::disconnected());
        }
        self.inbound.clear();
    }
}
