//! Per-peer I/O endpoints.
//!
//! Every peer owns exactly one endpoint for its lifetime. The variant is chosen by
//! the mesh builder from the address order of the pair and never changes:
//!
//! - [`FdEndpoint`]: passive socket endpoint, the remote side dials and the
//!   accepted socket is attached with `set_fd`
//! - [`InProcessEndpoint`]: this node itself, PDUs loop back in memory
//! - [`ConnectorEndpoint`]: actively dials the remote address and redials after
//!   every disconnect

mod connector;
mod fd;
mod in_process;
mod inbound;

pub use connector::ConnectorEndpoint;
pub use fd::FdEndpoint;
pub use in_process::InProcessEndpoint;

use crate::error::{Result, TransportError};
use crate::event::EndpointCallback;
use pdu_wire::{Pdu, PeerId};
use std::fmt;
use std::net::TcpStream;
use std::os::fd::RawFd;
use std::sync::Arc;

/// Endpoint variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// Waits for the remote side to connect
    Passive,
    /// Loopback to this node
    InProcess,
    /// Dials the remote side
    Connector,
}

impl EndpointKind {
    /// Variant a node listening as `local` uses for the peer `remote`
    ///
    /// The lower address accepts and the higher address dials, so exactly one
    /// side of every pair connects.
    pub fn for_pair(local: PeerId, remote: PeerId) -> Self {
        match local.cmp(&remote) {
            std::cmp::Ordering::Less => EndpointKind::Passive,
            std::cmp::Ordering::Equal => EndpointKind::InProcess,
            std::cmp::Ordering::Greater => EndpointKind::Connector,
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndpointKind::Passive => "passive",
            EndpointKind::InProcess => "in-process",
            EndpointKind::Connector => "connector",
        };
        f.write_str(name)
    }
}

/// Capability set shared by every endpoint variant
pub trait PduPeerEndpoint: Send + Sync {
    /// Variant of this endpoint
    fn kind(&self) -> EndpointKind;

    /// Wire the callback receiving this endpoint's events
    fn set_event_callback(&self, callback: EndpointCallback);

    /// Begin operating (dialing for connectors, loopback for in-process)
    fn start(&self) -> Result<()>;

    /// Take ownership of a connected socket
    fn set_fd(&self, _stream: TcpStream) -> Result<()> {
        Err(TransportError::Unsupported(self.kind()))
    }

    /// Whether this endpoint currently holds exactly `fd`
    fn owns_fd(&self, _fd: RawFd) -> bool {
        false
    }

    /// Whether the endpoint is connected
    fn is_connected(&self) -> bool;

    /// Whether a received PDU is waiting in the poll queue
    fn is_pdu_ready(&self) -> bool;

    /// Pop the next received PDU from the poll queue
    fn recv_pdu(&self) -> Option<Arc<Pdu>>;

    /// Synchronously send one PDU; failures are not retried
    fn send_pdu(&self, pdu: &Arc<Pdu>) -> Result<()>;

    /// Close the connection and stop any background activity
    fn shutdown(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_side_dials() {
        let a = PeerId::from_addr("127.0.0.1:9000".parse().unwrap());
        let b = PeerId::from_addr("127.0.0.1:9001".parse().unwrap());

        assert_eq!(EndpointKind::for_pair(a, b), EndpointKind::Passive);
        assert_eq!(EndpointKind::for_pair(b, a), EndpointKind::Connector);
        assert_eq!(EndpointKind::for_pair(a, a), EndpointKind::InProcess);
    }

    #[test]
    fn test_address_dominates_port() {
        let low_addr_high_port = PeerId::from_addr("10.0.0.1:65000".parse().unwrap());
        let high_addr_low_port = PeerId::from_addr("10.0.0.2:1".parse().unwrap());
        assert_eq!(
            EndpointKind::for_pair(low_addr_high_port, high_addr_low_port),
            EndpointKind::Passive
        );
    }
}
