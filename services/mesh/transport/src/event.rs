//! Lifecycle and traffic events delivered to the application.

use crate::peer::PduPeer;
use parking_lot::RwLock;
use pdu_wire::Pdu;
use std::fmt;
use std::sync::Arc;

/// Kind of a transport event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PduEventType {
    /// A complete PDU arrived from the peer
    ReceivedPdu,
    /// A PDU could not be queued or sent
    SendError,
    /// The endpoint became connected
    Connected,
    /// The endpoint lost its connection
    Disconnected,
}

/// Event produced by an endpoint or a queue, before it is stamped with its peer
#[derive(Debug, Clone)]
pub struct EndpointEvent {
    /// Event kind
    pub kind: PduEventType,
    /// PDU concerned by the event, if any
    pub pdu: Option<Arc<Pdu>>,
}

impl EndpointEvent {
    /// Connection established
    pub fn connected() -> Self {
        Self {
            kind: PduEventType::Connected,
            pdu: None,
        }
    }

    /// Connection lost
    pub fn disconnected() -> Self {
        Self {
            kind: PduEventType::Disconnected,
            pdu: None,
        }
    }

    /// PDU received
    pub fn received(pdu: Arc<Pdu>) -> Self {
        Self {
            kind: PduEventType::ReceivedPdu,
            pdu: Some(pdu),
        }
    }

    /// PDU could not be delivered
    pub fn send_error(pdu: Arc<Pdu>) -> Self {
        Self {
            kind: PduEventType::SendError,
            pdu: Some(pdu),
        }
    }
}

/// Event as seen by the application, stamped with the originating peer
#[derive(Clone)]
pub struct PduPeerEvent {
    /// Event kind
    pub kind: PduEventType,
    /// Peer the event belongs to
    pub peer: Arc<PduPeer>,
    /// PDU concerned by the event, if any
    pub pdu: Option<Arc<Pdu>>,
}

impl fmt::Debug for PduPeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PduPeerEvent")
            .field("kind", &self.kind)
            .field("peer", &self.peer.id())
            .field("pdu", &self.pdu.as_ref().map(|pdu| pdu.opcode()))
            .finish()
    }
}

/// Callback receiving endpoint events
pub type EndpointCallback = Arc<dyn Fn(EndpointEvent) + Send + Sync>;

/// Callback receiving application events
pub type PeerEventCallback = Arc<dyn Fn(PduPeerEvent) + Send + Sync>;

/// Replaceable single-consumer callback
pub(crate) struct CallbackSlot<E> {
    callback: RwLock<Option<Arc<dyn Fn(E) + Send + Sync>>>,
}

impl<E> CallbackSlot<E> {
    pub(crate) fn new() -> Self {
        Self {
            callback: RwLock::new(None),
        }
    }

    pub(crate) fn set(&self, callback: Arc<dyn Fn(E) + Send + Sync>) {
        *self.callback.write() = Some(callback);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Invoke the callback outside the lock; returns `false` when none is registered
    pub(crate) fn fire(&self, event: E) -> bool {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                callback(event);
                true
            }
            None => false,
        }
    }
}

impl<E> fmt::Debug for CallbackSlot<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackSlot")
            .field("set", &self.is_set())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    #[test]
    fn test_callback_slot() {
        let slot: CallbackSlot<EndpointEvent> = CallbackSlot::new();
        assert!(!slot.fire(EndpointEvent::connected()));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        slot.set(Arc::new(move |event: EndpointEvent| {
            sink.lock().push(event.kind)
        }));

        let pdu = Arc::new(Pdu::new(1, Bytes::from_static(b"x")));
        assert!(slot.fire(EndpointEvent::received(pdu.clone())));
        assert!(slot.fire(EndpointEvent::send_error(pdu)));
        assert!(slot.is_set());
        assert_eq!(
            *seen.lock(),
            vec![PduEventType::ReceivedPdu, PduEventType::SendError]
        );
    }
}
