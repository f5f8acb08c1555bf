//! Application-facing peer: one outbound queue, one endpoint, one send thread.

use crate::config::QueueConfig;
use crate::endpoint::{EndpointKind, PduPeerEndpoint};
use crate::error::{Result, TransportError};
use crate::event::{CallbackSlot, EndpointEvent, PduEventType, PduPeerEvent, PeerEventCallback};
use crate::queue::PduQueue;
use crate::stats::{PeerCounters, PeerStats};
use parking_lot::Mutex;
use pdu_wire::{Pdu, PeerId};
use std::fmt;
use std::net::{SocketAddrV4, TcpStream};
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// One logical peer of the mesh
///
/// Events from the endpoint and the queue are stamped with this peer before they
/// reach the application, so consumers never see which endpoint variant produced
/// them. Without an event callback, received PDUs stay in the endpoint for
/// [`recv_pdu`](Self::recv_pdu) polling and only the send path updates the
/// connection-independent counters.
pub struct PduPeer {
    me: Weak<PduPeer>,
    id: PeerId,
    queue: PduQueue,
    endpoint: Arc<dyn PduPeerEndpoint>,
    callback: CallbackSlot<PduPeerEvent>,
    counters: PeerCounters,
    sender: Mutex<Option<JoinHandle<()>>>,
}

impl PduPeer {
    /// Create a stopped peer around `endpoint`
    pub fn new(id: PeerId, endpoint: Arc<dyn PduPeerEndpoint>, queue: QueueConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            id,
            queue: PduQueue::new(queue),
            endpoint,
            callback: CallbackSlot::new(),
            counters: PeerCounters::default(),
            sender: Mutex::new(None),
        })
    }

    /// Peer identifier
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Listen address the identifier was derived from
    pub fn addr(&self) -> SocketAddrV4 {
        self.id.socket_addr()
    }

    /// Variant of the owned endpoint
    pub fn endpoint_kind(&self) -> EndpointKind {
        self.endpoint.kind()
    }

    /// Register the application callback and route endpoint and queue events to it
    pub fn set_event_callback(&self, callback: PeerEventCallback) {
        self.callback.set(callback);

        let me = self.me.clone();
        let forward = Arc::new(move |event: EndpointEvent| {
            if let Some(peer) = me.upgrade() {
                peer.forward(event);
            }
        });
        self.endpoint.set_event_callback(forward.clone());
        self.queue.set_event_callback(forward);
    }

    /// Start the endpoint and the send thread
    pub fn start(&self) -> Result<()> {
        let mut sender = self.sender.lock();
        if sender.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let me = self.me.upgrade().ok_or(TransportError::Shutdown)?;

        self.endpoint.start()?;
        let handle = std::thread::Builder::new()
            .name(format!("pdu-send-{}", self.id))
            .spawn(move || me.run_sender())?;
        *sender = Some(handle);

        info!("Peer {} started ({} endpoint)", self.id, self.endpoint.kind());
        Ok(())
    }

    /// Stop the send thread and close the endpoint; queued PDUs are discarded
    pub fn shutdown(&self) {
        self.queue.close();
        self.endpoint.shutdown();

        let handle = self.sender.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Send thread of peer {} panicked", self.id);
            }
        }
        debug!("Peer {} shut down", self.id);
    }

    /// Queue a PDU for this peer
    ///
    /// Opcodes in the reserved control range and sections a peer would refuse
    /// to decode are rejected here, before anything is queued.
    pub fn enqueue_pdu(&self, pdu: Arc<Pdu>) -> Result<()> {
        if pdu.is_reserved() {
            return Err(TransportError::ReservedOpcode(pdu.opcode()));
        }
        pdu.validate()?;
        self.queue.enqueue_pdu(pdu)
    }

    /// Number of PDUs waiting to be sent
    pub fn queue_size(&self) -> usize {
        self.queue.len()
    }

    /// Whether the endpoint is connected
    pub fn is_connected(&self) -> bool {
        self.endpoint.is_connected()
    }

    /// Whether a received PDU is waiting to be polled
    pub fn is_pdu_ready(&self) -> bool {
        self.endpoint.is_pdu_ready()
    }

    /// Poll the next received PDU
    pub fn recv_pdu(&self) -> Option<Arc<Pdu>> {
        let pdu = self.endpoint.recv_pdu()?;
        self.counters.record_received(pdu.encoded_size());
        Some(pdu)
    }

    /// Attach an accepted socket to this peer's endpoint
    pub fn add_fd(&self, stream: TcpStream) -> Result<()> {
        self.endpoint.set_fd(stream)
    }

    /// Whether the endpoint currently holds `fd`
    pub fn owns_fd(&self, fd: RawFd) -> bool {
        self.endpoint.owns_fd(fd)
    }

    /// Snapshot of this peer's counters
    pub fn stats(&self) -> PeerStats {
        self.counters.snapshot()
    }

    /// Report `pdu` as undeliverable through this peer's event stream
    pub fn report_send_error(&self, pdu: Arc<Pdu>) {
        self.forward(EndpointEvent::send_error(pdu));
    }

    fn run_sender(&self) {
        debug!("Send loop for peer {} running", self.id);
        while let Some(holder) = self.queue.wait_for_next_pdu() {
            let pdu = holder.into_pdu();
            match self.endpoint.send_pdu(&pdu) {
                Ok(()) => self.counters.record_sent(pdu.encoded_size()),
                Err(e) => {
                    debug!("Send of opcode {} to peer {} failed: {}", pdu.opcode(), self.id, e);
                    self.report_send_error(pdu);
                }
            }
        }
        debug!("Send loop for peer {} exited", self.id);
    }

    fn forward(&self, event: EndpointEvent) {
        match event.kind {
            PduEventType::ReceivedPdu => {
                let size = event.pdu.as_ref().map_or(0, |pdu| pdu.encoded_size());
                self.counters.record_received(size);
            }
            PduEventType::SendError => self.counters.record_send_error(),
            PduEventType::Connected => self.counters.record_connect(),
            PduEventType::Disconnected => self.counters.record_disconnect(),
        }

        let Some(peer) = self.me.upgrade() else {
            return;
        };
        let kind = event.kind;
        let delivered = self.callback.fire(PduPeerEvent {
            kind,
            peer,
            pdu: event.pdu,
        });
        if !delivered && kind == PduEventType::SendError {
            warn!("PDU to peer {} dropped without an event callback", self.id);
        }
    }
}

impl fmt::Debug for PduPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduPeer")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint.kind())
            .field("connected", &self.is_connected())
            .field("queued", &self.queue_size())
            .finish()
    }
}
