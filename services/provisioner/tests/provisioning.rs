//! Provisioner behavior against scripted nodes on an in-memory bus.

use std::sync::Arc;
use std::time::{Duration, Instant};

use fleet_bus::{Bus, MemoryBus, Message};
use fleet_id::{BindingId, InstanceId, NodeId};
use fleet_messages::{
    decode, encode, Announcement, BindResponse, BindingKey, ErrorKind, ErrorPayload, Fields,
    ProvisionResponse, Subjects, UnbindResponse, UnprovisionRequest,
};
use fleet_provisioner::{AvailableMemoryScorer, ProvisionError, Provisioner, ProvisionerConfig};
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Clone, Copy)]
enum Behavior {
    Reply,
    Fail(ErrorKind),
    Silent,
    Late(Duration),
}

struct FakeNode {
    id: NodeId,
    unprovisions: mpsc::UnboundedReceiver<UnprovisionRequest>,
    task: JoinHandle<()>,
}

impl Drop for FakeNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn announcement(id: NodeId, memory: f64) -> Announcement {
    let mut fields = Fields::new();
    fields.insert("available_memory".to_string(), json!(memory));
    Announcement::new(id, fields)
}

async fn reply(bus: &MemoryBus, message: &Message, payload: bytes::Bytes) {
    if let Some(reply) = &message.reply {
        bus.publish(reply, payload).await.unwrap();
    }
}

/// A node that answers discover and responds to requests per `behavior`.
async fn spawn_node(bus: &MemoryBus, subjects: &Subjects, memory: f64, behavior: Behavior) -> FakeNode {
    let id = NodeId::new();
    let mut discover = bus.subscribe(&subjects.discover()).await.unwrap();
    let mut provision = bus.subscribe(&subjects.provision(&id)).await.unwrap();
    let mut unprovision = bus.subscribe(&subjects.unprovision(&id)).await.unwrap();
    let mut bind = bus.subscribe(&subjects.bind(&id)).await.unwrap();
    let mut unbind = bus.subscribe(&subjects.unbind(&id)).await.unwrap();
    let (tx, unprovisions) = mpsc::unbounded_channel();

    let bus = bus.clone();
    let announce_subject = subjects.announce();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(message) = discover.next() => {
                    let payload = encode(&announcement(id, memory)).unwrap();
                    match &message.reply {
                        Some(reply) => bus.publish(reply, payload).await.unwrap(),
                        None => bus.publish(&announce_subject, payload).await.unwrap(),
                    }
                }
                Some(message) = provision.next() => {
                    let payload = match behavior {
                        Behavior::Fail(kind) => encode(&ErrorPayload::new(kind, "scripted failure")).unwrap(),
                        _ => {
                            let mut connection = Fields::new();
                            connection.insert("hostname".to_string(), json!("127.0.0.1"));
                            connection.insert("port".to_string(), json!(15000));
                            encode(&ProvisionResponse {
                                instance_id: InstanceId::new(),
                                node_id: id,
                                connection,
                            })
                            .unwrap()
                        }
                    };
                    match behavior {
                        Behavior::Silent => {}
                        Behavior::Late(delay) => {
                            let bus = bus.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                reply(&bus, &message, payload).await;
                            });
                        }
                        _ => reply(&bus, &message, payload).await,
                    }
                }
                Some(message) = unprovision.next() => {
                    let _ = tx.send(decode::<UnprovisionRequest>(&message.payload).unwrap());
                }
                Some(message) = bind.next() => {
                    let key: BindingKey = decode(&message.payload).unwrap();
                    let mut credentials = Fields::new();
                    credentials.insert("password".to_string(), json!("s3cret"));
                    let payload = encode(&BindResponse {
                        binding_id: BindingId::new(),
                        instance_id: key.instance_id,
                        application_id: key.application_id,
                        credentials,
                    })
                    .unwrap();
                    reply(&bus, &message, payload).await;
                }
                Some(message) = unbind.next() => {
                    let key: BindingKey = decode(&message.payload).unwrap();
                    let payload = encode(&UnbindResponse {
                        instance_id: key.instance_id,
                        application_id: key.application_id,
                        unbound: true,
                    })
                    .unwrap();
                    reply(&bus, &message, payload).await;
                }
                else => break,
            }
        }
    });

    FakeNode {
        id,
        unprovisions,
        task,
    }
}

fn test_config() -> ProvisionerConfig {
    ProvisionerConfig {
        service: "kv".to_string(),
        discovery_timeout: Duration::from_millis(200),
        request_timeout: Duration::from_millis(200),
        ..ProvisionerConfig::default()
    }
}

fn provisioner(bus: &MemoryBus, config: ProvisionerConfig) -> Provisioner {
    Provisioner::new(Arc::new(bus.clone()), config, Arc::new(AvailableMemoryScorer))
}

fn register(provisioner: &Provisioner, node: &FakeNode) {
    provisioner.on_announcement(&announcement(node.id, 1.0));
}

#[tokio::test]
async fn test_provision_picks_node_with_most_memory() {
    let bus = MemoryBus::new();
    let config = ProvisionerConfig {
        discovery_timeout: Duration::from_secs(5),
        ..test_config()
    };
    let subjects = Subjects::new(config.service.clone());
    let small = spawn_node(&bus, &subjects, 256.0, Behavior::Reply).await;
    let large = spawn_node(&bus, &subjects, 2048.0, Behavior::Reply).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &small);
    register(&provisioner, &large);

    let started = Instant::now();
    let handle = provisioner.provision_service("free").await.unwrap();

    // Both nodes answered, so the barrier completed before its window.
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(handle.node_id(), Some(large.id));
    assert_eq!(handle.credentials.get("port"), Some(&json!(15000)));
    assert_eq!(provisioner.handle(&handle.service_id), Some(handle));
}

#[tokio::test]
async fn test_start_learns_nodes_from_announcements() {
    let bus = MemoryBus::new();
    let config = test_config();
    let subjects = Subjects::new(config.service.clone());
    let _a = spawn_node(&bus, &subjects, 100.0, Behavior::Reply).await;
    let _b = spawn_node(&bus, &subjects, 100.0, Behavior::Reply).await;

    let provisioner = provisioner(&bus, config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let tasks = provisioner.start(shutdown_rx).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while provisioner.live_node_count() < 2 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(provisioner.live_node_count(), 2);

    shutdown_tx.send(true).unwrap();
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_no_live_nodes_fails_without_waiting() {
    let bus = MemoryBus::new();
    let provisioner = provisioner(
        &bus,
        ProvisionerConfig {
            discovery_timeout: Duration::from_secs(5),
            ..test_config()
        },
    );

    let started = Instant::now();
    let err = provisioner.provision_service("free").await.unwrap_err();

    assert!(matches!(err, ProvisionError::NoAvailableNode));
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_nodes_without_capacity_are_not_selected() {
    let bus = MemoryBus::new();
    let config = test_config();
    let subjects = Subjects::new(config.service.clone());
    let node = spawn_node(&bus, &subjects, 0.0, Behavior::Reply).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);

    let err = provisioner.provision_service("free").await.unwrap_err();
    assert!(matches!(err, ProvisionError::NoAvailableNode));
    assert_eq!(provisioner.handle_count(), 0);
}

#[tokio::test]
async fn test_missing_responder_waits_for_discovery_window() {
    let bus = MemoryBus::new();
    let config = test_config();
    let window = config.discovery_timeout;
    let subjects = Subjects::new(config.service.clone());
    let node = spawn_node(&bus, &subjects, 512.0, Behavior::Reply).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);
    // A node that announced once but no longer answers.
    provisioner.on_announcement(&announcement(NodeId::new(), 4096.0));

    let started = Instant::now();
    let handle = provisioner.provision_service("free").await.unwrap();

    assert!(started.elapsed() >= window);
    assert_eq!(handle.node_id(), Some(node.id));
}

#[tokio::test]
async fn test_silent_node_times_out() {
    let bus = MemoryBus::new();
    let config = test_config();
    let subjects = Subjects::new(config.service.clone());
    let node = spawn_node(&bus, &subjects, 512.0, Behavior::Silent).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);

    let err = provisioner.provision_service("free").await.unwrap_err();
    match err {
        ProvisionError::RemoteTimeout { node_id, .. } => assert_eq!(node_id, node.id),
        other => panic!("expected RemoteTimeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_late_reply_is_discarded() {
    let bus = MemoryBus::new();
    let config = ProvisionerConfig {
        request_timeout: Duration::from_millis(50),
        ..test_config()
    };
    let subjects = Subjects::new(config.service.clone());
    let node = spawn_node(&bus, &subjects, 512.0, Behavior::Late(Duration::from_millis(200))).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);

    let err = provisioner.provision_service("free").await.unwrap_err();
    assert!(matches!(err, ProvisionError::RemoteTimeout { .. }));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(provisioner.handle_count(), 0);
}

#[tokio::test]
async fn test_remote_failure_is_reported() {
    let bus = MemoryBus::new();
    let config = test_config();
    let subjects = Subjects::new(config.service.clone());
    let node = spawn_node(
        &bus,
        &subjects,
        512.0,
        Behavior::Fail(ErrorKind::ResourceExhausted),
    )
    .await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);

    let err = provisioner.provision_service("free").await.unwrap_err();
    assert_eq!(err.remote_kind(), Some(ErrorKind::ResourceExhausted));
    assert_eq!(provisioner.handle_count(), 0);
}

#[tokio::test]
async fn test_unprovision_unknown_instance() {
    let bus = MemoryBus::new();
    let provisioner = provisioner(&bus, test_config());

    let err = provisioner
        .unprovision_service(InstanceId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::UnknownInstance(_)));
}

#[tokio::test]
async fn test_unprovision_notifies_owner_and_forgets_handle() {
    let bus = MemoryBus::new();
    let config = test_config();
    let subjects = Subjects::new(config.service.clone());
    let mut node = spawn_node(&bus, &subjects, 512.0, Behavior::Reply).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);
    let handle = provisioner.provision_service("free").await.unwrap();

    provisioner.unprovision_service(handle.service_id).await.unwrap();

    let request = tokio::time::timeout(Duration::from_secs(1), node.unprovisions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.instance_id, handle.service_id);
    assert!(provisioner.handle(&handle.service_id).is_none());
}

#[tokio::test]
async fn test_bind_and_unbind_route_to_owner() {
    let bus = MemoryBus::new();
    let config = test_config();
    let subjects = Subjects::new(config.service.clone());
    let node = spawn_node(&bus, &subjects, 512.0, Behavior::Reply).await;

    let provisioner = provisioner(&bus, config);
    register(&provisioner, &node);
    let handle = provisioner.provision_service("free").await.unwrap();

    let key = BindingKey::new(handle.service_id, "app-1");
    let binding = provisioner.bind_instance(key.clone()).await.unwrap();
    assert_eq!(binding.instance_id, handle.service_id);
    assert_eq!(binding.application_id, "app-1");
    assert_eq!(binding.credentials.get("password"), Some(&json!("s3cret")));
    assert_eq!(binding.configuration, handle.configuration);

    provisioner.unbind_instance(key).await.unwrap();
}

#[tokio::test]
async fn test_bind_requires_cached_handle() {
    let bus = MemoryBus::new();
    let provisioner = provisioner(&bus, test_config());

    let err = provisioner
        .bind_instance(BindingKey::new(InstanceId::new(), "app-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProvisionError::UnknownInstance(_)));
}
