//! The set of peers making up one node's view of the mesh.

use crate::config::TransportConfig;
use crate::endpoint::{
    ConnectorEndpoint, EndpointKind, FdEndpoint, InProcessEndpoint, PduPeerEndpoint,
};
use crate::error::{Result, TransportError};
use crate::event::PeerEventCallback;
use crate::monitor::EpollMonitor;
use crate::peer::PduPeer;
use parking_lot::RwLock;
use dashmap::DashMap;
use pdu_wire::{Pdu, PeerId};
use std::net::TcpStream;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Map of peer identifier to peer, plus broadcast and inbound routing
pub struct PduPeerSet {
    local: PeerId,
    config: TransportConfig,
    monitor: Arc<EpollMonitor>,
    peers: DashMap<PeerId, Arc<PduPeer>>,
    callback: RwLock<Option<PeerEventCallback>>,
    running: AtomicBool,
}

impl PduPeerSet {
    /// Create an empty set for the node listening as `local`
    pub fn new(local: PeerId, config: TransportConfig, monitor: Arc<EpollMonitor>) -> Self {
        Self {
            local,
            config,
            monitor,
            peers: DashMap::new(),
            callback: RwLock::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Identifier of the local node
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Register the application callback on every current and future peer
    pub fn set_event_callback(&self, callback: PeerEventCallback) {
        *self.callback.write() = Some(callback.clone());
        for peer in self.peers() {
            peer.set_event_callback(callback.clone());
        }
    }

    /// Create the peer for `id`, choosing its endpoint from the address order
    ///
    /// Returns the existing peer when `id` is already known. Peers created while
    /// the set is running are started immediately.
    pub fn peer_create(&self, id: PeerId) -> Result<Arc<PduPeer>> {
        if let Some(existing) = self.get_peer(id) {
            debug!("Peer {} already exists", id);
            return Ok(existing);
        }

        let kind = EndpointKind::for_pair(self.local, id);
        let peer = PduPeer::new(id, self.make_endpoint(kind, id), self.config.queue.clone());
        if let Some(callback) = self.callback.read().clone() {
            peer.set_event_callback(callback);
        }

        let peer = self.peers.entry(id).or_insert(peer).clone();
        info!("Created peer {} with {} endpoint", id, kind);

        if self.running.load(Ordering::Acquire) {
            match peer.start() {
                Ok(()) | Err(TransportError::AlreadyStarted) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(peer)
    }

    /// Look up a peer
    pub fn get_peer(&self, id: PeerId) -> Option<Arc<PduPeer>> {
        self.peers.get(&id).map(|entry| entry.value().clone())
    }

    /// Shut a peer down and remove it
    pub fn peer_delete(&self, id: PeerId) -> Option<Arc<PduPeer>> {
        let peer = self.get_peer(id)?;
        peer.shutdown();
        self.peers.remove(&id);
        info!("Deleted peer {}", id);
        Some(peer)
    }

    /// Attach an accepted, already identified socket to the passive peer `id`
    pub fn peer_add_fd(&self, id: PeerId, stream: TcpStream) -> Result<()> {
        let peer = self.get_peer(id).ok_or(TransportError::UnknownPeer(id))?;
        let fd = stream.as_raw_fd();
        peer.add_fd(stream)?;
        debug!("Attached fd {} to peer {}", fd, id);
        Ok(())
    }

    /// Peer whose endpoint currently holds `fd`
    pub fn owner_of_fd(&self, fd: RawFd) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|entry| entry.value().owns_fd(fd))
            .map(|entry| *entry.key())
    }

    /// Queue the same PDU on every peer
    ///
    /// Per-peer failures are reported as `SendError` on that peer's event stream.
    pub fn broadcast_async(&self, pdu: Arc<Pdu>) {
        for peer in self.peers() {
            if let Err(e) = peer.enqueue_pdu(pdu.clone()) {
                debug!("Broadcast to peer {} failed: {}", peer.id(), e);
                peer.report_send_error(pdu.clone());
            }
        }
    }

    /// Number of connected peers, the local node included
    pub fn connected_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|entry| entry.value().is_connected())
            .count()
    }

    /// Number of peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the set has no peers
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Identifiers of all peers in ascending order
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.peers.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    /// Start every peer
    pub fn start_all(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        for peer in self.peers() {
            match peer.start() {
                Ok(()) | Err(TransportError::AlreadyStarted) => {}
                Err(e) => {
                    warn!("Failed to start peer {}: {}", peer.id(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Shut every peer down and empty the set
    pub fn shutdown_all(&self) {
        self.running.store(false, Ordering::Release);
        for peer in self.peers() {
            peer.shutdown();
        }
        self.peers.clear();
    }

    // snapshot so no map shard lock is held while a peer blocks
    fn peers(&self) -> Vec<Arc<PduPeer>> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    fn make_endpoint(&self, kind: EndpointKind, id: PeerId) -> Arc<dyn PduPeerEndpoint> {
        match kind {
            EndpointKind::Passive => FdEndpoint::new(id, self.monitor.clone(), &self.config),
            EndpointKind::InProcess => {
                Arc::new(InProcessEndpoint::new(id, self.config.max_inbound_pdus))
            }
            EndpointKind::Connector => Arc::new(ConnectorEndpoint::new(
                self.local,
                id,
                self.monitor.clone(),
                &self.config,
            )),
        }
    }
}

impl std::fmt::Debug for PduPeerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PduPeerSet")
            .field("local", &self.local)
            .field("peers", &self.peer_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PduEventType, PduPeerEvent};
    use bytes::Bytes;
    use std::net::TcpListener;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn id(s: &str) -> PeerId {
        PeerId::from_addr(s.parse().unwrap())
    }

    fn set(local: &str) -> (PduPeerSet, Arc<EpollMonitor>) {
        let monitor = Arc::new(EpollMonitor::new(Duration::from_millis(10)).unwrap());
        monitor.start().unwrap();
        let set = PduPeerSet::new(id(local), TransportConfig::local_network(), monitor.clone());
        (set, monitor)
    }

    #[test]
    fn test_endpoint_variant_follows_address_order() {
        let (set, monitor) = set("10.0.0.2:7000");
        let lower = set.peer_create(id("10.0.0.1:7000")).unwrap();
        let me = set.peer_create(id("10.0.0.2:7000")).unwrap();
        let higher = set.peer_create(id("10.0.0.3:7000")).unwrap();

        assert_eq!(lower.endpoint_kind(), EndpointKind::Connector);
        assert_eq!(me.endpoint_kind(), EndpointKind::InProcess);
        assert_eq!(higher.endpoint_kind(), EndpointKind::Passive);

        // creating again returns the same peer
        let again = set.peer_create(id("10.0.0.3:7000")).unwrap();
        assert!(Arc::ptr_eq(&again, &higher));
        assert_eq!(set.len(), 3);

        set.shutdown_all();
        assert!(set.is_empty());
        monitor.shutdown();
    }

    #[test]
    fn test_broadcast_queues_once_per_peer() {
        let (set, monitor) = set("10.0.0.1:7000");
        for addr in ["10.0.0.2:7000", "10.0.0.3:7000", "10.0.0.4:7000"] {
            set.peer_create(id(addr)).unwrap();
        }

        // peers are not started, so the PDU stays queued
        set.broadcast_async(Arc::new(Pdu::new(9, Bytes::from_static(b"all"))));
        for peer_id in set.peer_ids() {
            assert_eq!(set.get_peer(peer_id).unwrap().queue_size(), 1);
        }

        set.shutdown_all();
        monitor.shutdown();
    }

    #[test]
    fn test_broadcast_failures_stay_per_peer() {
        let (set, monitor) = set("10.0.0.1:7000");
        let mut config = TransportConfig::local_network();
        config.queue.max_size = 1;
        let set = PduPeerSet { config, ..set };

        let events: Arc<Mutex<Vec<(PduEventType, PeerId)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        set.set_event_callback(Arc::new(move |event: PduPeerEvent| {
            sink.lock().push((event.kind, event.peer.id()))
        }));

        let full = set.peer_create(id("10.0.0.2:7000")).unwrap();
        full.enqueue_pdu(Arc::new(Pdu::new(1, Bytes::new()))).unwrap();
        set.peer_create(id("10.0.0.3:7000")).unwrap();

        set.broadcast_async(Arc::new(Pdu::new(2, Bytes::new())));
        assert_eq!(
            events.lock().as_slice(),
            &[(PduEventType::SendError, full.id())]
        );
        assert_eq!(set.get_peer(id("10.0.0.3:7000")).unwrap().queue_size(), 1);

        set.shutdown_all();
        monitor.shutdown();
    }

    #[test]
    fn test_add_fd_routing() {
        let (set, monitor) = set("127.0.0.1:7000");
        let passive = set.peer_create(id("127.0.0.1:7001")).unwrap();
        set.peer_create(id("127.0.0.1:6999")).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        let fd = accepted.as_raw_fd();

        let stranger = id("127.0.0.1:5000");
        let extra = accepted.try_clone().unwrap();
        assert!(matches!(
            set.peer_add_fd(stranger, extra),
            Err(TransportError::UnknownPeer(p)) if p == stranger
        ));

        let connector_side = accepted.try_clone().unwrap();
        assert!(matches!(
            set.peer_add_fd(id("127.0.0.1:6999"), connector_side),
            Err(TransportError::Unsupported(EndpointKind::Connector))
        ));

        set.peer_add_fd(passive.id(), accepted).unwrap();
        assert!(passive.is_connected());
        assert_eq!(set.owner_of_fd(fd), Some(passive.id()));
        assert_eq!(set.connected_count(), 1);

        let deleted = set.peer_delete(passive.id()).unwrap();
        assert!(!deleted.is_connected());
        assert!(set.get_peer(passive.id()).is_none());
        assert_eq!(set.owner_of_fd(fd), None);

        set.shutdown_all();
        monitor.shutdown();
    }
}
