//! PDU mesh node binary.
//!
//! Joins a full mesh of peers given on the command line or in a YAML file,
//! logs every peer event and optionally broadcasts a heartbeat PDU.

use anyhow::Context;
use bytes::{BufMut, BytesMut};
use clap::Parser;
use pdu_transport::{PduEventType, PduMesh, PduPeerEvent, PduPeerSetBuilder, QueueMode};
use pdu_wire::Pdu;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

mod config;
mod logging;

use config::MeshConfig;

/// Opcode of the heartbeat PDU
const HEARTBEAT_OPCODE: u32 = 1;

const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(5);

/// How often the connected count is checked for changes
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// PDU mesh node
#[derive(Parser, Debug)]
#[command(name = "pdu-mesh", version, about = "Full-mesh PDU transport node")]
struct Args {
    /// Listen address, e.g. 127.0.0.1:13001; this is also the node identity
    #[arg(long)]
    listen: Option<String>,

    /// Mesh member address (repeatable); the local node may be listed too
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Queue overflow mode: throw, block or callback
    #[arg(long)]
    queue_mode: Option<QueueMode>,

    /// Maximum queued PDUs per peer
    #[arg(long)]
    queue_size: Option<usize>,

    /// Heartbeat broadcast interval, e.g. 5s
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,

    /// Disable the heartbeat broadcast
    #[arg(long, conflicts_with = "heartbeat")]
    no_heartbeat: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("pdu-mesh", &args.log_level)?;

    info!("Starting PDU mesh node v{}", env!("CARGO_PKG_VERSION"));

    let mut mesh_config = MeshConfig::load_from_file(&args.config)?;
    if let Some(listen) = args.listen.clone() {
        mesh_config.listen = Some(listen);
    }
    if !args.peers.is_empty() {
        mesh_config.peers = args.peers.clone();
    }
    if let Some(mode) = args.queue_mode {
        mesh_config.queue.mode = Some(mode.to_string());
    }
    if let Some(size) = args.queue_size {
        mesh_config.queue.max_size = Some(size);
    }

    let transport = mesh_config.transport_config()?;
    let heartbeat = if args.no_heartbeat {
        None
    } else if let Some(interval) = args.heartbeat {
        Some(Duration::from(interval))
    } else if mesh_config.heartbeat.is_some() {
        mesh_config.heartbeat_interval()?
    } else {
        Some(DEFAULT_HEARTBEAT)
    };
    let listen = mesh_config
        .listen
        .clone()
        .context("no listen address; pass --listen or set mesh.listen")?;

    info!(
        "Transport config: queue={} max_size={} pdu_timeout={:?} send_timeout={:?}",
        transport.queue.mode,
        transport.queue.max_size,
        transport.queue.pdu_timeout,
        transport.send_timeout
    );

    let mesh = PduPeerSetBuilder::new()
        .with_listen_addr(listen)
        .with_peers(mesh_config.peers.iter().cloned())
        .with_config(transport)
        .with_event_callback(Arc::new(log_event))
        .build()
        .context("failed to build mesh")?;
    let mesh = Arc::new(mesh);

    mesh.start().context("failed to start mesh")?;
    component_info!(
        "node",
        "Node {} listening on {} with {} peers",
        mesh.local_id(),
        mesh.local_addr(),
        mesh.peer_set().len()
    );

    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to install SIGINT handler: {}", e))?;

    let heartbeat_task = heartbeat.map(|interval| {
        component_info!("heartbeat", "Broadcasting heartbeat every {:?}", interval);
        tokio::spawn(run_heartbeat(mesh.clone(), interval))
    });

    let mut status = tokio::time::interval(STATUS_INTERVAL);
    let mut last_connected = None;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down");
                break;
            }
            _ = status.tick() => {
                let connected = mesh.connected_count();
                if last_connected != Some(connected) {
                    component_info!(
                        "node",
                        "{}/{} peers connected",
                        connected,
                        mesh.peer_set().len()
                    );
                    last_connected = Some(connected);
                }
            }
        }
    }

    if let Some(task) = heartbeat_task {
        task.abort();
    }

    // shutdown joins transport threads
    let stopping = mesh.clone();
    tokio::task::spawn_blocking(move || stopping.shutdown())
        .await
        .context("shutdown task failed")?;

    info!("Mesh node shutdown complete");
    Ok(())
}

async fn run_heartbeat(mesh: Arc<PduMesh>, interval: Duration) {
    let mut seq: u64 = 0;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        seq += 1;
        let mut payload = BytesMut::with_capacity(8);
        payload.put_u64(seq);
        let pdu = Pdu::new(HEARTBEAT_OPCODE, payload.freeze());

        // a full queue in block mode must not stall the runtime
        let target = mesh.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || target.broadcast_async(pdu)).await {
            component_warn!("heartbeat", "Heartbeat broadcast failed: {}", e);
            continue;
        }
        component_debug!(
            "heartbeat",
            "Heartbeat {} sent, {} peers connected",
            seq,
            mesh.connected_count()
        );
    }
}

fn log_event(event: PduPeerEvent) {
    let peer = event.peer.id();
    match event.kind {
        PduEventType::Connected => {
            component_info!("peer", "Peer {} ({}) connected", peer, event.peer.addr());
        }
        PduEventType::Disconnected => {
            component_info!("peer", "Peer {} ({}) disconnected", peer, event.peer.addr());
        }
        PduEventType::ReceivedPdu => match event.pdu {
            Some(pdu) if pdu.opcode() == HEARTBEAT_OPCODE => {
                let seq = pdu
                    .payload()
                    .get(..8)
                    .and_then(|bytes| bytes.try_into().ok())
                    .map(u64::from_be_bytes);
                debug!("Heartbeat {:?} from peer {}", seq, peer);
            }
            Some(pdu) => info!(
                opcode = pdu.opcode(),
                bytes = pdu.encoded_size(),
                "PDU received from peer {}",
                peer
            ),
            None => debug!("Peer {} has a PDU ready", peer),
        },
        PduEventType::SendError => {
            let stats = event.peer.stats();
            match event.pdu {
                Some(pdu) => warn!(
                    opcode = pdu.opcode(),
                    send_errors = stats.send_errors,
                    "Could not deliver PDU to peer {}",
                    peer
                ),
                None => warn!(send_errors = stats.send_errors, "Send error on peer {}", peer),
            }
        }
    }
}
