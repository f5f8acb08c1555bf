//! Inbound connection dispatcher.
//!
//! A small tokio runtime accepts connections on the node's listen socket and runs
//! one bounded task per accepted socket. Each task waits for the identification
//! PDU, then hands the socket to the matching passive peer. From that point on
//! the socket is driven by the readiness monitor, not by tokio.

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::identify::recv_identify;
use crate::peer_set::PduPeerSet;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// How long shutdown waits for the accept loop to close the listener
const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

struct Running {
    runtime: Runtime,
    stop: watch::Sender<bool>,
    stopped: mpsc::Receiver<()>,
}

/// Accepts inbound mesh connections and routes them to their peers
pub struct InboundAcceptor {
    listener: Mutex<Option<std::net::TcpListener>>,
    local_addr: SocketAddr,
    config: TransportConfig,
    running: Mutex<Option<Running>>,
}

impl InboundAcceptor {
    /// Wrap an already bound listener
    pub fn new(listener: std::net::TcpListener, config: TransportConfig) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            config,
            running: Mutex::new(None),
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Start accepting on behalf of `peers`
    pub fn start(&self, peers: Arc<PduPeerSet>) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        let listener = self.listener.lock().take().ok_or(TransportError::Shutdown)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.config.inbound_workers.max(1))
            .thread_name("pdu-inbound")
            .enable_all()
            .build()?;

        listener.set_nonblocking(true)?;
        let listener = {
            let _guard = runtime.enter();
            TcpListener::from_std(listener)?
        };

        let (stop, stop_rx) = watch::channel(false);
        let (stopped_tx, stopped) = mpsc::channel();
        let handlers = Arc::new(Semaphore::new(self.config.max_inbound_handlers.max(1)));
        let identify_timeout = self.config.identify_timeout;

        runtime.spawn(async move {
            accept_loop(listener, peers, handlers, identify_timeout, stop_rx).await;
            let _ = stopped_tx.send(());
        });

        info!("Accepting mesh connections on {}", self.local_addr);
        *running = Some(Running {
            runtime,
            stop,
            stopped,
        });
        Ok(())
    }

    /// Stop accepting and close the listener
    pub fn shutdown(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };

        let _ = running.stop.send(true);
        if running.stopped.recv_timeout(STOP_TIMEOUT).is_err() {
            warn!("Accept loop on {} did not stop in time", self.local_addr);
        }
        // handler tasks still waiting for identification are dropped here
        running.runtime.shutdown_background();
        info!("Stopped accepting on {}", self.local_addr);
    }
}

impl Drop for InboundAcceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(
    listener: TcpListener,
    peers: Arc<PduPeerSet>,
    handlers: Arc<Semaphore>,
    identify_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    let permit = tokio::select! {
                        _ = stop.changed() => break,
                        permit = handlers.clone().acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    debug!("Accepted connection from {}", addr);
                    tokio::spawn(handle_inbound(stream, addr, peers.clone(), identify_timeout, permit));
                }
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
    debug!("Accept loop exited");
}

async fn handle_inbound(
    mut stream: TcpStream,
    addr: SocketAddr,
    peers: Arc<PduPeerSet>,
    identify_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = match tokio::time::timeout(identify_timeout, recv_identify(&mut stream)).await {
        Ok(Ok(peer_id)) => peer_id,
        Ok(Err(e)) => {
            warn!("Rejected connection from {}: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!(
                "Connection from {} sent no identification within {:?}",
                addr, identify_timeout
            );
            return;
        }
    };

    let stream = match stream.into_std() {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Could not detach connection from {}: {}", addr, e);
            return;
        }
    };

    // attaching fires Connected into application code, keep it off the reactor
    let attached =
        tokio::task::spawn_blocking(move || peers.peer_add_fd(peer_id, stream)).await;
    match attached {
        Ok(Ok(())) => info!("Peer {} connected from {}", peer_id, addr),
        Ok(Err(TransportError::UnknownPeer(id))) => warn!(
            "Connection from {} identified as {}, which is not a configured peer",
            addr, id
        ),
        Ok(Err(e)) => warn!("Could not attach connection from {} to peer {}: {}", addr, peer_id, e),
        Err(e) => warn!("Attach task for {} failed: {}", addr, e),
    }
}
