//! End-to-end provisioning: a provisioner and several node agents sharing
//! one in-memory bus.
//!
//! Run with: `cargo test -p fleet-e2e`

use std::sync::Arc;
use std::time::Duration;

use fleet_bus::MemoryBus;
use fleet_messages::BindingKey;
use fleet_node_agent::state::StateStore;
use fleet_node_agent::{Config, MockBackend, NodeAgent};
use fleet_provisioner::{AvailableMemoryScorer, ProvisionError, Provisioner, ProvisionerConfig};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

struct Fleet {
    provisioner: Provisioner,
    agents: Vec<NodeAgent>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    _dirs: Vec<TempDir>,
}

impl Fleet {
    /// Start one agent per entry of `capacities_mb`, then a provisioner.
    async fn start(capacities_mb: &[u64]) -> Self {
        init_tracing();
        let bus = MemoryBus::new();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();
        let mut agents = Vec::new();
        let mut dirs = Vec::new();

        for (i, capacity) in capacities_mb.iter().enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let first_port = 16000 + (i as u16) * 10;
            let config = Config {
                data_dir: dir.path().to_path_buf(),
                port_range: first_port..=first_port + 9,
                available_memory_mb: *capacity,
                announce_interval_secs: 3600,
                ..Config::default()
            };
            let agent = NodeAgent::new(
                config,
                Arc::new(bus.clone()),
                Arc::new(MockBackend::new(256)),
                StateStore::open_in_memory().unwrap(),
            )
            .unwrap();
            let running = agent.start(shutdown_rx.clone()).await.unwrap();
            tasks.extend(running.tasks);
            agents.push(agent);
            dirs.push(dir);
        }

        let provisioner = Provisioner::new(
            Arc::new(bus),
            ProvisionerConfig {
                discovery_timeout: Duration::from_millis(500),
                request_timeout: Duration::from_secs(2),
                ..ProvisionerConfig::default()
            },
            Arc::new(AvailableMemoryScorer),
        );
        tasks.extend(provisioner.start(shutdown_rx).await.unwrap());

        let fleet = Self {
            provisioner,
            agents,
            shutdown,
            tasks,
            _dirs: dirs,
        };
        fleet.wait_for_nodes(capacities_mb.len()).await;
        fleet
    }

    async fn wait_for_nodes(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.provisioner.live_node_count() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("nodes never announced");
    }

    fn agent(&self, node_id: fleet_id::NodeId) -> &NodeAgent {
        self.agents
            .iter()
            .find(|agent| agent.node_id() == node_id)
            .expect("unknown node")
    }

    async fn stop(self) {
        self.shutdown.send(true).unwrap();
        for task in self.tasks {
            task.await.unwrap();
        }
    }
}

async fn wait_for_memory(agent: &NodeAgent, expected_mb: u64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while agent.available_memory_mb() != expected_mb {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("memory never reached the expected value");
}

#[tokio::test]
async fn test_full_lifecycle() {
    let fleet = Fleet::start(&[1024, 2048]).await;

    let handle = fleet.provisioner.provision_service("free").await.unwrap();
    let node_id = handle.node_id().unwrap();
    let agent = fleet.agent(node_id);
    assert_eq!(agent.node_id(), fleet.agents[1].node_id());
    assert_eq!(agent.available_memory_mb(), 2048 - 256);
    assert!(handle.credentials.contains_key("port"));
    assert_eq!(
        handle.configuration.get("instance_id"),
        Some(&json!(handle.service_id.to_string()))
    );

    let key = BindingKey::new(handle.service_id, "app-1");
    let binding = fleet.provisioner.bind_instance(key.clone()).await.unwrap();
    assert_eq!(binding.instance_id, handle.service_id);
    assert_eq!(binding.credentials.get("username"), Some(&json!("app-1")));

    fleet.provisioner.unbind_instance(key).await.unwrap();

    fleet
        .provisioner
        .unprovision_service(handle.service_id)
        .await
        .unwrap();
    assert!(fleet.provisioner.handle(&handle.service_id).is_none());
    wait_for_memory(agent, 2048).await;
    assert_eq!(agent.instance_count().unwrap(), 0);

    fleet.stop().await;
}

#[tokio::test]
async fn test_placement_follows_remaining_memory() {
    let fleet = Fleet::start(&[1024, 1152]).await;

    // 1152 beats 1024; afterwards the second node is down to 896.
    let first = fleet.provisioner.provision_service("free").await.unwrap();
    let second = fleet.provisioner.provision_service("free").await.unwrap();

    assert_eq!(first.node_id(), Some(fleet.agents[1].node_id()));
    assert_eq!(second.node_id(), Some(fleet.agents[0].node_id()));
    assert_eq!(fleet.provisioner.handle_count(), 2);

    fleet.stop().await;
}

#[tokio::test]
async fn test_remote_failure_surfaces_to_caller() {
    let fleet = Fleet::start(&[1024]).await;

    let err = fleet
        .provisioner
        .provision_service("invalid")
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::Remote { .. }));
    assert_eq!(fleet.agents[0].available_memory_mb(), 1024);
    assert_eq!(fleet.provisioner.handle_count(), 0);

    fleet.stop().await;
}

#[tokio::test]
async fn test_exhausted_fleet_has_no_available_node() {
    let fleet = Fleet::start(&[256]).await;

    fleet.provisioner.provision_service("free").await.unwrap();
    let err = fleet
        .provisioner
        .provision_service("free")
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::NoAvailableNode));

    fleet.stop().await;
}

#[tokio::test]
async fn test_empty_fleet_has_no_available_node() {
    let fleet = Fleet::start(&[]).await;

    let err = fleet
        .provisioner
        .provision_service("free")
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::NoAvailableNode));

    fleet.stop().await;
}
