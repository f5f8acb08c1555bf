//! Configuration handling for the mesh node.
//!
//! Values come from an optional YAML file, then environment variables, then
//! command line flags (applied in `main`).

use anyhow::{Context, Result};
use pdu_transport::{QueueMode, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding the listen address
pub const ENV_LISTEN: &str = "PDU_MESH_LISTEN";
/// Environment variable overriding the peer list (comma separated)
pub const ENV_PEERS: &str = "PDU_MESH_PEERS";
/// Environment variable overriding the queue overflow mode
pub const ENV_QUEUE_MODE: &str = "PDU_MESH_QUEUE_MODE";
/// Environment variable overriding the queue size
pub const ENV_QUEUE_SIZE: &str = "PDU_MESH_QUEUE_SIZE";

/// Mesh node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Listen address, `host:port`
    pub listen: Option<String>,
    /// Every mesh member, this node included
    pub peers: Vec<String>,
    /// Outbound queue settings
    pub queue: QueueSection,
    /// Receive buffer sizing
    pub recv_buffer: RecvBufferSection,
    /// Transport timers, humantime strings such as `250ms`
    pub timeouts: TimeoutSection,
    /// Worker threads of the inbound dispatcher
    pub inbound_workers: Option<usize>,
    /// Concurrent inbound handshakes
    pub max_inbound_handlers: Option<usize>,
    /// Received PDUs kept per peer for polling
    pub max_inbound_pdus: Option<usize>,
    /// Heartbeat broadcast interval, disabled when absent
    pub heartbeat: Option<String>,
}

/// Queue section of the YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    /// `throw`, `block` or `callback`
    pub mode: Option<String>,
    /// Maximum queued PDUs per peer
    pub max_size: Option<usize>,
    /// Age after which a queued PDU is dropped; `off` disables expiry
    pub pdu_timeout: Option<String>,
}

/// Receive buffer section of the YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecvBufferSection {
    /// Initial capacity in bytes
    pub initial_size: Option<usize>,
    /// Growth step in bytes
    pub step_size: Option<usize>,
    /// Maximum unconsumed bytes
    pub max_size: Option<usize>,
}

/// Timer section of the YAML file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSection {
    /// Readiness monitor wait bound
    pub poll: Option<String>,
    /// Synchronous send bound
    pub send: Option<String>,
    /// Outbound connect bound
    pub connect: Option<String>,
    /// First redial delay
    pub reconnect_initial: Option<String>,
    /// Largest redial delay
    pub reconnect_max: Option<String>,
    /// Inbound identification bound
    pub identify: Option<String>,
}

/// Root of the YAML file
#[derive(Debug, Deserialize)]
struct RootConfig {
    mesh: Option<MeshConfig>,
}

impl MeshConfig {
    /// Load the file if it exists, then apply environment overrides
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let root: RootConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                root.mesh.unwrap_or_default()
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides looked up by environment variable name
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = lookup(ENV_LISTEN) {
            info!("Listen address overridden by environment: {}", listen);
            self.listen = Some(listen);
        }

        if let Some(peers) = lookup(ENV_PEERS) {
            self.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|peer| !peer.is_empty())
                .map(str::to_string)
                .collect();
            info!("Peer list overridden by environment: {} peers", self.peers.len());
        }

        if let Some(mode) = lookup(ENV_QUEUE_MODE) {
            mode.parse::<QueueMode>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("invalid {}", ENV_QUEUE_MODE))?;
            info!("Queue mode overridden by environment: {}", mode);
            self.queue.mode = Some(mode);
        }

        if let Some(size) = lookup(ENV_QUEUE_SIZE) {
            let size = size
                .parse::<usize>()
                .with_context(|| format!("invalid {}: {}", ENV_QUEUE_SIZE, size))?;
            info!("Queue size overridden by environment: {}", size);
            self.queue.max_size = Some(size);
        }

        Ok(())
    }

    /// Heartbeat interval, if enabled
    pub fn heartbeat_interval(&self) -> Result<Option<Duration>> {
        optional_duration("heartbeat", self.heartbeat.as_deref())
    }

    /// Transport configuration with every set value applied over the defaults
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::default();

        if let Some(mode) = &self.queue.mode {
            config.queue.mode = mode.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(max_size) = self.queue.max_size {
            anyhow::ensure!(max_size > 0, "queue.max_size must be positive");
            config.queue.max_size = max_size;
        }
        if let Some(timeout) = self.queue.pdu_timeout.as_deref() {
            config.queue.pdu_timeout = optional_duration("queue.pdu_timeout", Some(timeout))?;
        }

        let recv = &self.recv_buffer;
        if let Some(size) = recv.initial_size {
            config.recv_buffer.initial_size = size;
        }
        if let Some(size) = recv.step_size {
            config.recv_buffer.step_size = size;
        }
        if let Some(size) = recv.max_size {
            config.recv_buffer.max_size = size;
        }
        anyhow::ensure!(
            config.recv_buffer.max_size >= config.recv_buffer.initial_size,
            "recv_buffer.max_size must be at least recv_buffer.initial_size"
        );

        let timeouts = &self.timeouts;
        let fields = [
            ("timeouts.poll", &timeouts.poll, &mut config.poll_timeout),
            ("timeouts.send", &timeouts.send, &mut config.send_timeout),
            ("timeouts.connect", &timeouts.connect, &mut config.connect_timeout),
            (
                "timeouts.reconnect_initial",
                &timeouts.reconnect_initial,
                &mut config.reconnect_initial,
            ),
            ("timeouts.reconnect_max", &timeouts.reconnect_max, &mut config.reconnect_max),
            ("timeouts.identify", &timeouts.identify, &mut config.identify_timeout),
        ];
        for (name, value, target) in fields {
            if let Some(value) = value {
                *target = parse_duration(name, value)?;
            }
        }

        if let Some(workers) = self.inbound_workers {
            config.inbound_workers = workers;
        }
        if let Some(handlers) = self.max_inbound_handlers {
            config.max_inbound_handlers = handlers;
        }
        if let Some(limit) = self.max_inbound_pdus {
            anyhow::ensure!(limit > 0, "max_inbound_pdus must be positive");
            config.max_inbound_pdus = limit;
        }

        Ok(config)
    }
}

fn parse_duration(name: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {}: {}", name, value))
}

fn optional_duration(name: &str, value: Option<&str>) -> Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(v) if v.eq_ignore_ascii_case("off") => Ok(None),
        Some(v) => parse_duration(name, v).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(config.listen.is_none());
        assert!(config.peers.is_empty());
        assert!(config.heartbeat_interval().unwrap().is_none());

        let transport = config.transport_config().unwrap();
        assert_eq!(transport.queue.mode, QueueMode::Throw);
        assert_eq!(transport.queue.max_size, 1000);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
mesh:
  listen: 127.0.0.1:13001
  peers:
    - 127.0.0.1:13001
    - 127.0.0.1:13002
  queue:
    mode: block
    max_size: 64
    pdu_timeout: "off"
  recv_buffer:
    initial_size: 4096
    max_size: 65536
  timeouts:
    send: 2s
    reconnect_initial: 250ms
  max_inbound_pdus: 250
  heartbeat: 5s
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.listen.as_deref(), Some("127.0.0.1:13001"));
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.heartbeat_interval().unwrap(), Some(Duration::from_secs(5)));

        let transport = config.transport_config().unwrap();
        assert_eq!(transport.queue.mode, QueueMode::Block);
        assert_eq!(transport.queue.max_size, 64);
        assert_eq!(transport.queue.pdu_timeout, None);
        assert_eq!(transport.recv_buffer.initial_size, 4096);
        assert_eq!(transport.recv_buffer.max_size, 65536);
        assert_eq!(transport.send_timeout, Duration::from_secs(2));
        assert_eq!(transport.reconnect_initial, Duration::from_millis(250));
        assert_eq!(transport.connect_timeout, TransportConfig::default().connect_timeout);
        assert_eq!(transport.max_inbound_pdus, 250);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"mesh: [not, a, map").unwrap();
        assert!(MeshConfig::load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_LISTEN, "10.0.0.1:9000"),
            (ENV_PEERS, "10.0.0.1:9000, 10.0.0.2:9000,"),
            (ENV_QUEUE_MODE, "callback"),
            (ENV_QUEUE_SIZE, "5"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.listen.as_deref(), Some("10.0.0.1:9000"));
        assert_eq!(config.peers, vec!["10.0.0.1:9000", "10.0.0.2:9000"]);
        let transport = config.transport_config().unwrap();
        assert_eq!(transport.queue.mode, QueueMode::Callback);
        assert_eq!(transport.queue.max_size, 5);
    }

    #[test]
    fn test_invalid_overrides_are_rejected() {
        let mut config = MeshConfig::default();
        assert!(config
            .apply_overrides(|key| (key == ENV_QUEUE_MODE).then(|| "drop".to_string()))
            .is_err());
        assert!(config
            .apply_overrides(|key| (key == ENV_QUEUE_SIZE).then(|| "many".to_string()))
            .is_err());

        config.timeouts.send = Some("soon".to_string());
        assert!(config.transport_config().is_err());
    }
}
