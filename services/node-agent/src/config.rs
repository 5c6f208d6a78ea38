//! Configuration for the node agent.

use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use fleet_id::NodeId;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Explicit node identifier. When unset the id persisted in the instance
    /// store is reused, or a new one is generated and persisted.
    pub node_id: Option<NodeId>,

    /// Service namespace used in bus subjects.
    pub service: String,

    /// Bus URL.
    pub bus_url: String,

    /// Data directory for the instance store and instance working directories.
    pub data_dir: PathBuf,

    /// Address handed to clients in connection fields.
    pub local_ip: String,

    /// Ports available to instances.
    pub port_range: RangeInclusive<u16>,

    /// Memory capacity shared by all instances on this node, in MB.
    pub available_memory_mb: u64,

    /// Memory allocated to each instance, in MB.
    pub max_memory_mb: u64,

    /// Interval between unsolicited announcements, in seconds.
    pub announce_interval_secs: u64,

    /// How long a stopped process gets between SIGTERM and SIGKILL.
    pub stop_grace: Duration,

    /// Program started for each instance.
    pub backend_binary: Option<String>,

    /// Argument template for `backend_binary`.
    pub backend_args: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node_id: None,
            service: "kv".to_string(),
            bus_url: "nats://127.0.0.1:4222".to_string(),
            data_dir: PathBuf::from("/var/lib/fleet"),
            local_ip: "127.0.0.1".to_string(),
            port_range: 15000..=15999,
            available_memory_mb: 4096,
            max_memory_mb: 256,
            announce_interval_secs: 30,
            stop_grace: Duration::from_millis(500),
            backend_binary: None,
            backend_args: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        // Node ID can be provided or taken from the instance store
        let node_id = match std::env::var("FLEET_NODE_ID") {
            Ok(raw) => Some(
                raw.parse::<NodeId>()
                    .with_context(|| format!("invalid FLEET_NODE_ID: {raw}"))?,
            ),
            Err(_) => None,
        };

        let service = std::env::var("FLEET_SERVICE").unwrap_or(defaults.service);
        let bus_url = std::env::var("FLEET_BUS_URL").unwrap_or(defaults.bus_url);

        let data_dir = std::env::var("FLEET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let local_ip = std::env::var("FLEET_LOCAL_IP").unwrap_or(defaults.local_ip);

        let port_range = match std::env::var("FLEET_PORT_RANGE") {
            Ok(raw) => parse_port_range(&raw)?,
            Err(_) => defaults.port_range,
        };

        let available_memory_mb = std::env::var("FLEET_AVAILABLE_MEMORY_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.available_memory_mb);

        let max_memory_mb = std::env::var("FLEET_MAX_MEMORY_MB")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_memory_mb);

        let announce_interval_secs = std::env::var("FLEET_ANNOUNCE_INTERVAL")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.announce_interval_secs);

        let stop_grace = std::env::var("FLEET_STOP_GRACE_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.stop_grace);

        let backend_binary = std::env::var("FLEET_BACKEND_BINARY").ok();
        let backend_args = std::env::var("FLEET_BACKEND_ARGS")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            node_id,
            service,
            bus_url,
            data_dir,
            local_ip,
            port_range,
            available_memory_mb,
            max_memory_mb,
            announce_interval_secs,
            stop_grace,
            backend_binary,
            backend_args,
            log_level,
        })
    }

    /// Path of the SQLite instance store.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("state.db")
    }

    /// Working directory for one instance.
    pub fn instance_dir(&self, instance_id: &fleet_id::InstanceId) -> PathBuf {
        self.data_dir.join("instances").join(instance_id.to_string())
    }
}

/// Parse an inclusive `low-high` port range.
pub fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>> {
    let (low, high) = raw
        .split_once('-')
        .with_context(|| format!("port range must look like LOW-HIGH: {raw}"))?;
    let low: u16 = low
        .trim()
        .parse()
        .with_context(|| format!("invalid low port in {raw}"))?;
    let high: u16 = high
        .trim()
        .parse()
        .with_context(|| format!("invalid high port in {raw}"))?;
    if low == 0 || low > high {
        bail!("empty or invalid port range: {raw}");
    }
    Ok(low..=high)
}
