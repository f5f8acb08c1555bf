//! Peer-to-peer PDU transport: readiness monitor, peer endpoints, outbound
//! queues and mesh construction.
//!
//! Every node of a mesh is given its own listen address and the full list of
//! member addresses. For each member it creates one [`PduPeer`] owning a bounded
//! [`PduQueue`] and one endpoint. The endpoint variant follows from the address
//! order of the pair, so exactly one side of every pair dials.
//!
//! ## Features
//!
//! - **Readiness monitor**: one `mio` poll instance and one thread shared by all sockets
//! - **Endpoints**: passive socket, in-process loopback, and redialing connector
//! - **Queues**: throw, block or callback overflow modes with lazy expiry
//! - **Acceptor**: tokio-hosted dispatcher routing identified sockets to their peer
//!
//! ## Threads
//!
//! One monitor thread, one send thread per peer, one dial thread per connector
//! peer, and the worker threads of the inbound dispatcher.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pdu_transport::{PduEventType, PduPeerEvent, PduPeerSetBuilder, TransportConfig};
//! use pdu_wire::Pdu;
//! use std::sync::Arc;
//!
//! # fn example() -> Result<(), pdu_transport::TransportError> {
//! let mesh = PduPeerSetBuilder::new()
//!     .with_listen_addr("127.0.0.1:13001")
//!     .with_peers(["127.0.0.1:13001", "127.0.0.1:13002"])
//!     .with_config(TransportConfig::default())
//!     .with_event_callback(Arc::new(|event: PduPeerEvent| {
//!         if event.kind == PduEventType::ReceivedPdu {
//!             println!("PDU from {}", event.peer.id());
//!         }
//!     }))
//!     .build()?;
//!
//! mesh.start()?;
//! mesh.broadcast_async(Pdu::new(1, &b"hello"[..]));
//! mesh.shutdown();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod acceptor;
pub mod builder;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod identify;
pub mod monitor;
pub mod peer;
pub mod peer_set;
pub mod queue;
pub mod recv_buffer;
pub mod stats;

mod sync;

// Re-export main types
pub use acceptor::InboundAcceptor;
pub use builder::{PduMesh, PduPeerSetBuilder};
pub use config::{QueueConfig, QueueMode, RecvBufferConfig, TransportConfig};
pub use endpoint::{
    ConnectorEndpoint, EndpointKind, FdEndpoint, InProcessEndpoint, PduPeerEndpoint,
};
pub use error::{Result, TransportError};
pub use event::{EndpointCallback, EndpointEvent, PduEventType, PduPeerEvent, PeerEventCallback};
pub use monitor::{EpollMonitor, Readiness, ReadinessHandler};
pub use peer::PduPeer;
pub use peer_set::PduPeerSet;
pub use queue::{PduHolder, PduQueue};
pub use stats::PeerStats;
