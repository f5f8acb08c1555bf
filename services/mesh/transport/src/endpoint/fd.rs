//! Socket endpoint driven by the shared readiness monitor.

use super::inbound::InboundQueue;
use super::{EndpointKind, PduPeerEndpoint};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::event::{CallbackSlot, EndpointCallback, EndpointEvent};
use crate::monitor::{EpollMonitor, Readiness, ReadinessHandler};
use crate::recv_buffer::RecvBuffer;
use parking_lot::{Condvar, Mutex};
use pdu_wire::{Pdu, PeerId};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bytes read from the socket per `read` call
const READ_CHUNK: usize = 16 * 1024;

/// Longest single wait for writability before the write is retried
const WRITABLE_SLICE: Duration = Duration::from_millis(50);

struct Connection {
    stream: Arc<TcpStream>,
    fd: RawFd,
    generation: u64,
}

/// Reassembly buffer tagged with the connection generation it belongs to
struct RecvState {
    generation: u64,
    buffer: RecvBuffer,
}

/// Endpoint owning one non-blocking TCP socket
///
/// Reads happen on the monitor thread and never block; sends are synchronous on
/// the caller's thread and wait for socket space up to the send timeout.
pub struct FdEndpoint {
    me: Weak<FdEndpoint>,
    peer_id: PeerId,
    monitor: Arc<EpollMonitor>,
    send_timeout: Duration,
    conn: Mutex<Option<Connection>>,
    state_changed: Condvar,
    generation: AtomicU64,
    recv: Mutex<RecvState>,
    inbound: InboundQueue,
    send_lock: Mutex<()>,
    writable: Mutex<u64>,
    writable_changed: Condvar,
    callback: CallbackSlot<EndpointEvent>,
    closed: AtomicBool,
}

impl FdEndpoint {
    /// Create a disconnected endpoint for `peer_id`
    pub fn new(peer_id: PeerId, monitor: Arc<EpollMonitor>, config: &TransportConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            peer_id,
            monitor,
            send_timeout: config.send_timeout,
            conn: Mutex::new(None),
            state_changed: Condvar::new(),
            generation: AtomicU64::new(0),
            recv: Mutex::new(RecvState {
                generation: 0,
                buffer: RecvBuffer::new(config.recv_buffer.clone()),
            }),
            inbound: InboundQueue::new(peer_id, config.max_inbound_pdus),
            send_lock: Mutex::new(()),
            writable: Mutex::new(0),
            writable_changed: Condvar::new(),
            callback: CallbackSlot::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Peer this endpoint talks to
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Block until the endpoint is disconnected or `timeout` elapses
    ///
    /// Returns whether the endpoint is disconnected.
    pub fn wait_disconnected(&self, timeout: Duration) -> bool {
        let mut conn = self.conn.lock();
        if conn.is_none() {
            return true;
        }
        self.state_changed.wait_for(&mut conn, timeout);
        conn.is_none()
    }

    /// Drop the current connection, if any, and fire `Disconnected`
    pub fn disconnect(&self) -> bool {
        self.drop_connection(None)
    }

    fn current(&self) -> Option<(Arc<TcpStream>, u64)> {
        self.conn
            .lock()
            .as_ref()
            .map(|c| (c.stream.clone(), c.generation))
    }

    fn is_generation(&self, generation: u64) -> bool {
        self.conn
            .lock()
            .as_ref()
            .is_some_and(|c| c.generation == generation)
    }

    fn drop_connection(&self, generation: Option<u64>) -> bool {
        let conn = {
            let mut guard = self.conn.lock();
            match guard.as_ref() {
                Some(c) if generation.map_or(true, |g| g == c.generation) => guard.take(),
                _ => None,
            }
        };
        let Some(conn) = conn else {
            return false;
        };

        self.monitor.remove_fd(conn.fd);
        if let Err(e) = conn.stream.shutdown(Shutdown::Both) {
            debug!("Socket shutdown for peer {} ignored: {}", self.peer_id, e);
        }
        {
            let mut recv = self.recv.lock();
            if recv.generation == conn.generation {
                recv.buffer.clear();
            }
        }
        drop(conn);

        self.state_changed.notify_all();
        self.writable_changed.notify_all();

        info!("Peer {} disconnected", self.peer_id);
        self.callback.fire(EndpointEvent::disconnected());
        true
    }

    fn on_readiness(&self, generation: u64, readiness: Readiness) -> Result<()> {
        let Some((stream, current)) = self.current() else {
            return Ok(());
        };
        if current != generation {
            return Ok(());
        }

        if readiness.contains(Readiness::WRITABLE) {
            *self.writable.lock() += 1;
            self.writable_changed.notify_all();
        }

        if readiness.contains(Readiness::READABLE) {
            match self.drain_socket(&stream, generation) {
                Ok(false) => {}
                Ok(true) => {
                    debug!("Peer {} closed the connection", self.peer_id);
                    self.drop_connection(Some(generation));
                    return Ok(());
                }
                Err(e) => {
                    self.drop_connection(Some(generation));
                    return Err(e);
                }
            }
        }

        if readiness.intersects(Readiness::ERROR | Readiness::HANGUP) {
            debug!("Peer {} socket reported {:?}", self.peer_id, readiness);
            self.drop_connection(Some(generation));
        }
        Ok(())
    }

    /// Read until `WouldBlock`; returns `true` on end of stream
    ///
    /// Bytes read after `generation` was replaced are discarded, so a stale
    /// read never lands in the buffer of the next connection.
    fn drain_socket(&self, stream: &TcpStream, generation: u64) -> Result<bool> {
        let mut scratch = [0u8; READ_CHUNK];
        let mut reader = stream;

        loop {
            // read at least one byte even when full so overflow is detected
            let room = self.recv.lock().buffer.remaining_room();
            let want = room.clamp(1, READ_CHUNK);

            match reader.read(&mut scratch[..want]) {
                Ok(0) => return Ok(true),
                Ok(n) => {
                    let pdus = {
                        let mut recv = self.recv.lock();
                        if recv.generation != generation || !self.is_generation(generation) {
                            debug!(
                                "Discarding {} bytes read from a replaced socket of peer {}",
                                n, self.peer_id
                            );
                            return Ok(false);
                        }
                        recv.buffer.extend(&scratch[..n])?;
                        let mut pdus = Vec::new();
                        while let Some(pdu) = recv.buffer.next_pdu()? {
                            pdus.push(pdu);
                        }
                        pdus
                    };
                    for pdu in pdus {
                        self.deliver(pdu);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn deliver(&self, pdu: Pdu) {
        debug!(
            "Received PDU opcode {} ({} bytes) from peer {}",
            pdu.opcode(),
            pdu.encoded_size(),
            self.peer_id
        );
        let pdu = Arc::new(pdu);
        if !self.callback.fire(EndpointEvent::received(pdu.clone())) {
            self.inbound.push(pdu);
        }
    }

    fn wait_writable(&self, seen: u64, deadline: Instant, generation: u64) -> Result<()> {
        if !self.is_generation(generation) {
            return Err(not_connected());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TransportError::PeerSendFailed(io::Error::new(
                io::ErrorKind::TimedOut,
                "timed out waiting for socket space",
            )));
        }

        let mut count = self.writable.lock();
        if *count == seen {
            self.writable_changed
                .wait_for(&mut count, (deadline - now).min(WRITABLE_SLICE));
        }
        Ok(())
    }
}

fn not_connected() -> TransportError {
    TransportError::PeerSendFailed(io::Error::new(
        io::ErrorKind::NotConnected,
        "peer not connected",
    ))
}

impl PduPeerEndpoint for FdEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Passive
    }

    fn set_event_callback(&self, callback: EndpointCallback) {
        self.callback.set(callback);
    }

    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn set_fd(&self, stream: TcpStream) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }

        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let fd = stream.as_raw_fd();

        if self.drop_connection(None) {
            warn!("Peer {} reconnected, replacing previous socket", self.peer_id);
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        {
            let mut recv = self.recv.lock();
            recv.generation = generation;
            recv.buffer.clear();
        }
        *self.conn.lock() = Some(Connection {
            stream: Arc::new(stream),
            fd,
            generation,
        });
        self.state_changed.notify_all();

        info!("Peer {} connected (fd {})", self.peer_id, fd);
        self.callback.fire(EndpointEvent::connected());

        let me = self.me.clone();
        let handler: ReadinessHandler = Arc::new(move |readiness| match me.upgrade() {
            Some(endpoint) => endpoint.on_readiness(generation, readiness),
            None => Ok(()),
        });
        if let Err(e) = self
            .monitor
            .add_fd(fd, Readiness::READABLE | Readiness::WRITABLE, handler)
        {
            self.drop_connection(Some(generation));
            return Err(e);
        }
        Ok(())
    }

    fn owns_fd(&self, fd: RawFd) -> bool {
        self.conn.lock().as_ref().is_some_and(|c| c.fd == fd)
    }

    fn is_connected(&self) -> bool {
        self.conn.lock().is_some()
    }

    fn is_pdu_ready(&self) -> bool {
        !self.inbound.is_empty()
    }

    fn recv_pdu(&self) -> Option<Arc<Pdu>> {
        self.inbound.pop()
    }

    fn send_pdu(&self, pdu: &Arc<Pdu>) -> Result<()> {
        let (stream, generation) = self.current().ok_or_else(not_connected)?;
        let bytes = pdu.encode()?;
        let deadline = Instant::now() + self.send_timeout;

        let _serialized = self.send_lock.lock();
        let mut writer = &*stream;
        let mut written = 0;
        while written < bytes.len() {
            let seen = *self.writable.lock();
            match writer.write(&bytes[written..]) {
                Ok(0) => {
                    self.drop_connection(Some(generation));
                    return Err(TransportError::PeerSendFailed(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if let Err(e) = self.wait_writable(seen, deadline, generation) {
                        // a partially written PDU desynchronizes the stream
                        if written > 0 {
                            self.drop_connection(Some(generation));
                        }
                        return Err(e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.drop_connection(Some(generation));
                    return Err(TransportError::PeerSendFailed(e));
                }
            }
        }

        debug!(
            "Sent PDU opcode {} ({} bytes) to peer {}",
            pdu.opcode(),
            bytes.len(),
            self.peer_id
        );
        Ok(())
    }

    fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.drop_connection(None);
        self.inbound.clear();
        self.state_changed.notify_all();
    }
}
