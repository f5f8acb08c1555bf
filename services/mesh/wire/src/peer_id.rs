//! Stable peer identity derived from an IPv4 address and port.

use crate::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

/// 64-bit peer identifier: `(ipv4 << 32) | port`
///
/// Both sides of a pair compute the same value without negotiation, and the
/// numeric order equals the `(address, port)` tuple order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(u64);

impl PeerId {
    /// Wrap a raw identifier
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw identifier value
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Derive the identifier of an IPv4 socket address
    pub fn from_addr(addr: SocketAddrV4) -> Self {
        Self(((u32::from(*addr.ip()) as u64) << 32) | addr.port() as u64)
    }

    /// Derive the identifier of a socket address; IPv6 is accepted only when IPv4-mapped
    pub fn from_socket_addr(addr: SocketAddr) -> Result<Self, WireError> {
        Ok(Self::from_addr(to_v4(addr)?))
    }

    /// Resolve a `host:port` string to its first IPv4 address
    pub fn resolve(host_port: &str) -> Result<(Self, SocketAddrV4), WireError> {
        let addrs = host_port
            .to_socket_addrs()
            .map_err(|e| WireError::Address(format!("{}: {}", host_port, e)))?;

        for addr in addrs {
            if let Ok(v4) = to_v4(addr) {
                return Ok((Self::from_addr(v4), v4));
            }
        }

        Err(WireError::Address(format!(
            "{}: no IPv4 address",
            host_port
        )))
    }

    /// Socket address this identifier was derived from
    pub fn socket_addr(self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from((self.0 >> 32) as u32), self.0 as u16)
    }
}

fn to_v4(addr: SocketAddr) -> Result<SocketAddrV4, WireError> {
    match addr {
        SocketAddr::V4(v4) => Ok(v4),
        SocketAddr::V6(v6) => v6
            .ip()
            .to_ipv4_mapped()
            .map(|ip| SocketAddrV4::new(ip, v6.port()))
            .ok_or_else(|| WireError::Address(format!("{} is not IPv4", addr))),
    }
}

impl From<SocketAddrV4> for PeerId {
    fn from(addr: SocketAddrV4) -> Self {
        Self::from_addr(addr)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}
