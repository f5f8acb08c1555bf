//! Mesh construction from a listen address and the full peer list.

use crate::acceptor::InboundAcceptor;
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::event::PeerEventCallback;
use crate::monitor::EpollMonitor;
use crate::peer::PduPeer;
use crate::peer_set::PduPeerSet;
use pdu_wire::{Pdu, PeerId};
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

enum Listen {
    Addr(String),
    Bound(TcpListener),
}

/// Builder for one node of a PDU mesh
///
/// Every node is given the same peer list. Each node creates one peer per
/// address and picks the endpoint variant from the address order, so exactly one
/// side of every pair dials.
///
/// ```no_run
/// use pdu_transport::PduPeerSetBuilder;
///
/// let mesh = PduPeerSetBuilder::new()
///     .with_listen_addr("127.0.0.1:13001")
///     .with_peers(["127.0.0.1:13001", "127.0.0.1:13002", "127.0.0.1:13003"])
///     .build()?;
/// mesh.start()?;
/// # Ok::<(), pdu_transport::TransportError>(())
/// ```
pub struct PduPeerSetBuilder {
    listen: Option<Listen>,
    peers: Vec<String>,
    include_self: bool,
    config: TransportConfig,
    callback: Option<PeerEventCallback>,
}

impl Default for PduPeerSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduPeerSetBuilder {
    /// Create a builder with default configuration
    pub fn new() -> Self {
        Self {
            listen: None,
            peers: Vec::new(),
            include_self: true,
            config: TransportConfig::default(),
            callback: None,
        }
    }

    /// Address to listen on, `host:port` resolving to IPv4
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(Listen::Addr(addr.into()));
        self
    }

    /// Use an already bound listener; its local address is the node identity
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listen = Some(Listen::Bound(listener));
        self
    }

    /// Add one mesh member
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        self.peers.push(addr.into());
        self
    }

    /// Add mesh members
    pub fn with_peers<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.peers.extend(addrs.into_iter().map(Into::into));
        self
    }

    /// Whether the local node gets an in-process peer even if not listed
    pub fn with_self_peer(mut self, include: bool) -> Self {
        self.include_self = include;
        self
    }

    /// Transport configuration
    pub fn with_config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Application event callback
    pub fn with_event_callback(mut self, callback: PeerEventCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Resolve addresses, bind the listener and create every peer
    pub fn build(self) -> Result<PduMesh> {
        let listener = match self.listen {
            Some(Listen::Bound(listener)) => listener,
            Some(Listen::Addr(addr)) => {
                let (_, resolved) = resolve(&addr)?;
                TcpListener::bind(resolved)?
            }
            None => {
                return Err(TransportError::InvalidAddress(
                    "no listen address configured".to_string(),
                ))
            }
        };

        let local_addr = listener.local_addr()?;
        let local = PeerId::from_socket_addr(local_addr)
            .map_err(|e| TransportError::InvalidAddress(format!("{}: {}", local_addr, e)))?;
        if local.socket_addr().ip().is_unspecified() {
            return Err(TransportError::InvalidAddress(format!(
                "{}: listen address must be a concrete IPv4 address",
                local_addr
            )));
        }

        let mut ids = Vec::with_capacity(self.peers.len() + 1);
        for addr in &self.peers {
            let (id, _) = resolve(addr)?;
            ids.push(id);
        }
        if self.include_self {
            ids.push(local);
        }
        ids.sort();
        ids.dedup();

        let monitor = Arc::new(EpollMonitor::new(self.config.poll_timeout)?);
        let peers = Arc::new(PduPeerSet::new(local, self.config.clone(), monitor.clone()));
        if let Some(callback) = self.callback {
            peers.set_event_callback(callback);
        }
        for id in ids {
            peers.peer_create(id)?;
        }

        let acceptor = InboundAcceptor::new(listener, self.config)?;
        info!("Built mesh node {} with {} peers", local, peers.len());

        Ok(PduMesh {
            local,
            monitor,
            peers,
            acceptor,
            started: AtomicBool::new(false),
        })
    }
}

fn resolve(addr: &str) -> Result<(PeerId, std::net::SocketAddrV4)> {
    PeerId::resolve(addr).map_err(|e| TransportError::InvalidAddress(format!("{}: {}", addr, e)))
}

/// One running node of the mesh
pub struct PduMesh {
    local: PeerId,
    monitor: Arc<EpollMonitor>,
    peers: Arc<PduPeerSet>,
    acceptor: InboundAcceptor,
    started: AtomicBool,
}

impl PduMesh {
    /// Start the monitor, the acceptor and every peer, in that order
    ///
    /// If any step fails, whatever already started is stopped again and the
    /// error is returned. The listener and the monitor are consumed by the
    /// attempt, so a node whose start failed cannot be started again.
    pub fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(TransportError::AlreadyStarted);
        }
        if let Err(e) = self.start_components() {
            warn!("Mesh node {} failed to start: {}", self.local, e);
            self.stop_components();
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        info!("Mesh node {} started", self.local);
        Ok(())
    }

    fn start_components(&self) -> Result<()> {
        self.monitor.start()?;
        self.acceptor.start(self.peers.clone())?;
        self.peers.start_all()
    }

    fn stop_components(&self) {
        self.peers.shutdown_all();
        self.acceptor.shutdown();
        self.monitor.shutdown();
    }

    /// Stop every peer, the acceptor and the monitor, in that order
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop_components();
        info!("Mesh node {} stopped", self.local);
    }

    /// Queue `pdu` on every peer, the local node included
    pub fn broadcast_async(&self, pdu: impl Into<Arc<Pdu>>) {
        let pdu = pdu.into();
        debug!("Broadcasting PDU opcode {}", pdu.opcode());
        self.peers.broadcast_async(pdu);
    }

    /// Look up a peer
    pub fn get_peer(&self, id: PeerId) -> Option<Arc<PduPeer>> {
        self.peers.get_peer(id)
    }

    /// Number of connected peers, the local node included
    pub fn connected_count(&self) -> usize {
        self.peers.connected_count()
    }

    /// Identity of this node
    pub fn local_id(&self) -> PeerId {
        self.local
    }

    /// Address the node accepts connections on
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    /// Register or replace the application event callback
    pub fn set_event_callback(&self, callback: PeerEventCallback) {
        self.peers.set_event_callback(callback);
    }

    /// The underlying peer set
    pub fn peer_set(&self) -> &Arc<PduPeerSet> {
        &self.peers
    }
}

impl Drop for PduMesh {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKind;

    #[test]
    fn test_build_from_address_list() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let me = format!("127.0.0.1:{}", port);

        let mesh = PduPeerSetBuilder::new()
            .with_listener(listener)
            .with_peers(["127.0.0.2:1000", "127.0.0.0:1000"])
            .with_peer(me.clone())
            .with_config(TransportConfig::local_network())
            .build()
            .unwrap();

        let ids = mesh.peer_set().peer_ids();
        assert_eq!(ids.len(), 3);
        let kind = |addr: &str| {
            let id = PeerId::resolve(addr).unwrap().0;
            mesh.get_peer(id).unwrap().endpoint_kind()
        };
        assert_eq!(kind(&me), EndpointKind::InProcess);
        assert_eq!(kind("127.0.0.2:1000"), EndpointKind::Passive);
        assert_eq!(kind("127.0.0.0:1000"), EndpointKind::Connector);
        assert_eq!(mesh.local_id(), PeerId::resolve(&me).unwrap().0);
    }

    #[test]
    fn test_self_is_added_unless_disabled() {
        let with_self = PduPeerSetBuilder::new()
            .with_listener(TcpListener::bind("127.0.0.1:0").unwrap())
            .build()
            .unwrap();
        assert_eq!(with_self.peer_set().len(), 1);

        let without_self = PduPeerSetBuilder::new()
            .with_listener(TcpListener::bind("127.0.0.1:0").unwrap())
            .with_self_peer(false)
            .build()
            .unwrap();
        assert!(without_self.peer_set().is_empty());
    }

    #[test]
    fn test_rejects_bad_addresses() {
        assert!(matches!(
            PduPeerSetBuilder::new().build(),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            PduPeerSetBuilder::new()
                .with_listener(TcpListener::bind("0.0.0.0:0").unwrap())
                .build(),
            Err(TransportError::InvalidAddress(_))
        ));
        assert!(matches!(
            PduPeerSetBuilder::new()
                .with_listener(TcpListener::bind("127.0.0.1:0").unwrap())
                .with_peer("not an address")
                .build(),
            Err(TransportError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_start_and_shutdown_single_node() {
        let mesh = PduPeerSetBuilder::new()
            .with_listener(TcpListener::bind("127.0.0.1:0").unwrap())
            .with_config(TransportConfig::local_network())
            .build()
            .unwrap();
        mesh.start().unwrap();
        assert!(matches!(mesh.start(), Err(TransportError::AlreadyStarted)));

        let me = mesh.get_peer(mesh.local_id()).unwrap();
        assert_eq!(mesh.connected_count(), 1);

        mesh.broadcast_async(Pdu::new(7, bytes::Bytes::from_static(b"self")));
        let start = std::time::Instant::now();
        while !me.is_pdu_ready() && start.elapsed() < std::time::Duration::from_secs(3) {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(me.recv_pdu().map(|pdu| pdu.opcode()), Some(7));

        mesh.shutdown();
        assert_eq!(mesh.connected_count(), 0);
    }

    #[test]
    fn test_failed_start_rolls_back() {
        let mesh = PduPeerSetBuilder::new()
            .with_listener(TcpListener::bind("127.0.0.1:0").unwrap())
            .with_config(TransportConfig::local_network())
            .build()
            .unwrap();
        // consume the listener so the acceptor step fails after the monitor started
        mesh.acceptor.start(mesh.peers.clone()).unwrap();
        mesh.acceptor.shutdown();

        assert!(matches!(mesh.start(), Err(TransportError::Shutdown)));
        assert!(!mesh.monitor.is_running());
        assert!(!mesh.acceptor.is_running());
        assert!(mesh.peer_set().is_empty());
        assert_eq!(mesh.connected_count(), 0);

        // the monitor was shut down by the rollback
        assert!(matches!(mesh.start(), Err(TransportError::Shutdown)));
        mesh.shutdown();
    }
}
