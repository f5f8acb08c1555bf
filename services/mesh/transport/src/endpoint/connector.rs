//! Dialing endpoint that keeps one outbound connection alive.

use super::{EndpointKind, FdEndpoint, PduPeerEndpoint};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::event::EndpointCallback;
use crate::identify::send_identify;
use crate::monitor::EpollMonitor;
use parking_lot::{Condvar, Mutex};
use pdu_wire::{Pdu, PeerId};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long the dial thread sleeps between checks while connected
const CONNECTED_CHECK: Duration = Duration::from_millis(250);

/// Uptime after which a connection counts as stable and the backoff resets
const STABLE_CONNECTION: Duration = Duration::from_secs(1);

struct Dialer {
    local: PeerId,
    remote: SocketAddr,
    fd: Arc<FdEndpoint>,
    connect_timeout: Duration,
    reconnect_initial: Duration,
    reconnect_max: Duration,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
}

impl Dialer {
    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.stop_signal.notify_all();
    }

    /// Sleep for `duration`; returns `true` if stopped meanwhile
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.stop_signal.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        *stopped
    }

    fn dial(&self) -> Result<TcpStream> {
        let mut stream = TcpStream::connect_timeout(&self.remote, self.connect_timeout)?;
        stream.set_nodelay(true)?;
        send_identify(&mut stream, self.local, self.connect_timeout)?;
        Ok(stream)
    }

    fn run(&self) {
        let mut backoff = self.reconnect_initial;

        while !self.is_stopped() {
            debug!("Dialing peer {} at {}", self.fd.peer_id(), self.remote);

            match self.dial() {
                Ok(stream) => {
                    let connected_at = Instant::now();
                    match self.fd.set_fd(stream) {
                        Ok(()) => {
                            while !self.is_stopped() && !self.fd.wait_disconnected(CONNECTED_CHECK) {}
                        }
                        Err(e) => warn!("Failed to attach socket for peer {}: {}", self.remote, e),
                    }

                    // only a connection that stayed up resets the backoff
                    let stable = connected_at.elapsed() >= STABLE_CONNECTION;
                    if stable {
                        backoff = self.reconnect_initial;
                    } else {
                        debug!(
                            "Connection to peer {} dropped after {:?}; redialing in {:?}",
                            self.remote,
                            connected_at.elapsed(),
                            backoff
                        );
                    }
                    if self.sleep(backoff) {
                        break;
                    }
                    if !stable {
                        backoff = (backoff * 2).min(self.reconnect_max);
                    }
                }
                Err(e) => {
                    warn!(
                        "Failed to connect to peer {}: {}; retrying in {:?}",
                        self.remote, e, backoff
                    );
                    if self.sleep(backoff) {
                        break;
                    }
                    backoff = (backoff * 2).min(self.reconnect_max);
                }
            }
        }
        debug!("Dialer for peer {} stopped", self.remote);
    }
}

/// Endpoint that dials the remote peer and redials after every disconnect
///
/// The socket itself is handled by an inner [`FdEndpoint`]; this type only adds
/// the dial loop with exponential backoff.
pub struct ConnectorEndpoint {
    dialer: Arc<Dialer>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectorEndpoint {
    /// Create a connector from `local` to `remote`
    pub fn new(
        local: PeerId,
        remote: PeerId,
        monitor: Arc<EpollMonitor>,
        config: &TransportConfig,
    ) -> Self {
        let fd = FdEndpoint::new(remote, monitor, config);
        Self {
            dialer: Arc::new(Dialer {
                local,
                remote: SocketAddr::V4(remote.socket_addr()),
                fd,
                connect_timeout: config.connect_timeout,
                reconnect_initial: config.reconnect_initial,
                reconnect_max: config.reconnect_max.max(config.reconnect_initial),
                stopped: Mutex::new(false),
                stop_signal: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }
}

impl PduPeerEndpoint for ConnectorEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Connector
    }

    fn set_event_callback(&self, callback: EndpointCallback) {
        self.dialer.fd.set_event_callback(callback);
    }

    fn start(&self) -> Result<()> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        if self.dialer.is_stopped() {
            return Err(TransportError::Shutdown);
        }

        let dialer = self.dialer.clone();
        let handle = std::thread::Builder::new()
            .name(format!("pdu-dial-{}", self.dialer.remote))
            .spawn(move || dialer.run())?;
        *thread = Some(handle);
        info!("Connector to peer {} started", self.dialer.remote);
        Ok(())
    }

    fn owns_fd(&self, fd: RawFd) -> bool {
        self.dialer.fd.owns_fd(fd)
    }

    fn is_connected(&self) -> bool {
        self.dialer.fd.is_connected()
    }

    fn is_pdu_ready(&self) -> bool {
        self.dialer.fd.is_pdu_ready()
    }

    fn recv_pdu(&self) -> Option<Arc<Pdu>> {
        self.dialer.fd.recv_pdu()
    }

    fn send_pdu(&self, pdu: &Arc<Pdu>) -> Result<()> {
        self.dialer.fd.send_pdu(pdu)
    }

    fn shutdown(&self) {
        self.dialer.stop();
        self.dialer.fd.shutdown();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Dialer thread for peer {} panicked", self.dialer.remote);
            }
        }
    }
}

impl Drop for ConnectorEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}
