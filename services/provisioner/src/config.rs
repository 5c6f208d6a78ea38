//! Configuration for the provisioner.

use std::time::Duration;

use anyhow::Result;

/// Provisioner configuration.
#[derive(Debug, Clone)]
pub struct ProvisionerConfig {
    /// Service namespace used in bus subjects.
    pub service: String,

    /// How long a discovery round collects announcements.
    pub discovery_timeout: Duration,

    /// How long to wait for a node's reply to provision/bind/unbind.
    pub request_timeout: Duration,

    /// How often stale nodes are swept from the registry.
    pub sweep_interval: Duration,

    /// How long a node stays live after its last announcement.
    pub node_ttl: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            service: "kv".to_string(),
            discovery_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(60),
            node_ttl: Duration::from_secs(300),
        }
    }
}

impl ProvisionerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let service = std::env::var("FLEET_SERVICE").unwrap_or(defaults.service);

        Ok(Self {
            service,
            ..defaults
        })
    }
}
