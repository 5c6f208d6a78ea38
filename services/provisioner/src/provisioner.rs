//! The provision coordinator.
//!
//! A [`Provisioner`] is cheap to clone; every clone shares the same registry
//! and handle cache. Concurrent `provision_service` calls are independent:
//! each owns its own discovery barrier and reply subscriptions.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;
use fleet_bus::{Bus, Message};
use fleet_id::{InstanceId, NodeId};
use fleet_messages::{
    decode, encode, Announcement, BindResponse, BindingKey, ProvisionRequest, ProvisionResponse,
    Reply, Subjects, UnbindResponse, UnprovisionRequest,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::barrier::Barrier;
use crate::config::ProvisionerConfig;
use crate::error::{ProvisionError, ProvisionResult};
use crate::handles::{BindingHandle, HandleCache, ProvisionedHandle};
use crate::registry::NodeRegistry;
use crate::scoring::{select_best_node, NodeScorer};
use crate::worker;

struct Inner {
    bus: Arc<dyn Bus>,
    subjects: Subjects,
    config: ProvisionerConfig,
    scorer: Arc<dyn NodeScorer>,
    registry: Mutex<NodeRegistry>,
    handles: Mutex<HandleCache>,
}

/// Provision coordinator for one service namespace.
#[derive(Clone)]
pub struct Provisioner {
    inner: Arc<Inner>,
}

impl Provisioner {
    /// Create a new provisioner. Call [`Provisioner::start`] to begin
    /// tracking node announcements.
    pub fn new(bus: Arc<dyn Bus>, config: ProvisionerConfig, scorer: Arc<dyn NodeScorer>) -> Self {
        let subjects = Subjects::new(config.service.clone());
        let registry = NodeRegistry::new(config.node_ttl);
        Self {
            inner: Arc::new(Inner {
                bus,
                subjects,
                config,
                scorer,
                registry: Mutex::new(registry),
                handles: Mutex::new(HandleCache::new()),
            }),
        }
    }

    pub fn config(&self) -> &ProvisionerConfig {
        &self.inner.config
    }

    pub fn subjects(&self) -> &Subjects {
        &self.inner.subjects
    }

    /// Subscribe to announcements, ask every node to announce itself, and
    /// spawn the announce listener and registry sweep loops.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> ProvisionResult<Vec<JoinHandle<()>>> {
        let announcements = self.inner.bus.subscribe(&self.inner.subjects.announce()).await?;
        self.inner
            .bus
            .publish(&self.inner.subjects.discover(), Bytes::new())
            .await?;

        info!(
            service = %self.inner.subjects.service(),
            sweep_interval_secs = self.inner.config.sweep_interval.as_secs(),
            node_ttl_secs = self.inner.config.node_ttl.as_secs(),
            "Provisioner started"
        );

        let listener = tokio::spawn(worker::run_announce_listener(
            self.clone(),
            announcements,
            shutdown.clone(),
        ));
        let sweeper = tokio::spawn(worker::run_sweep_loop(
            self.clone(),
            self.inner.config.sweep_interval,
            shutdown,
        ));

        Ok(vec![listener, sweeper])
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Record a node announcement.
    pub fn on_announcement(&self, announcement: &Announcement) {
        self.on_announcement_at(announcement, Instant::now());
    }

    pub fn on_announcement_at(&self, announcement: &Announcement, now: Instant) {
        if self.registry().on_announce(announcement.id, now) {
            info!(node_id = %announcement.id, "Node became live");
        } else {
            debug!(node_id = %announcement.id, "Node re-announced");
        }
    }

    /// Forget nodes that have not announced within the TTL.
    pub fn sweep_registry(&self) -> Vec<NodeId> {
        self.sweep_registry_at(Instant::now())
    }

    pub fn sweep_registry_at(&self, now: Instant) -> Vec<NodeId> {
        let expired = self.registry().sweep(now);
        for node_id in &expired {
            info!(node_id = %node_id, "Node expired from registry");
        }
        expired
    }

    pub fn live_node_count(&self) -> usize {
        self.registry().live_count()
    }

    // =========================================================================
    // Handles
    // =========================================================================

    pub fn handle(&self, instance_id: &InstanceId) -> Option<ProvisionedHandle> {
        self.handles().get(instance_id).cloned()
    }

    pub fn handle_count(&self) -> usize {
        self.handles().len()
    }

    /// Merge handles supplied by the surrounding system. Only unknown ids are
    /// added. Returns the number added.
    pub fn update_handles(&self, handles: Vec<ProvisionedHandle>) -> usize {
        let offered = handles.len();
        let added = self.handles().update_handles(handles);
        info!(offered, added, "Merged provisioned handles");
        added
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Discover, select and provision an instance of `plan` on the best node.
    #[instrument(skip(self), fields(service = %self.inner.subjects.service()))]
    pub async fn provision_service(&self, plan: &str) -> ProvisionResult<ProvisionedHandle> {
        let announcements = self.discover().await?;

        let (node_id, score) = match select_best_node(&announcements, self.inner.scorer.as_ref()) {
            Some((best, score)) => (best.id, score),
            None => {
                warn!(
                    responses = announcements.len(),
                    "No node scored above zero"
                );
                return Err(ProvisionError::NoAvailableNode);
            }
        };
        info!(node_id = %node_id, score, candidates = announcements.len(), "Selected node");

        let request = ProvisionRequest {
            plan: plan.to_string(),
        };
        let response: ProvisionResponse = self
            .request_reply(self.inner.subjects.provision(&node_id), &request, node_id)
            .await?;

        let handle = ProvisionedHandle::from_response(response);
        self.handles().insert(handle.clone());

        info!(
            node_id = %node_id,
            instance_id = %handle.service_id,
            "Provisioned instance"
        );
        Ok(handle)
    }

    /// Ask the owning node to release an instance and forget its handle.
    ///
    /// Fire-and-forget: success means the request was published, not that the
    /// node acted on it.
    #[instrument(skip(self))]
    pub async fn unprovision_service(&self, instance_id: InstanceId) -> ProvisionResult<()> {
        let node_id = self.owning_node(&instance_id)?;

        let payload = encode(&UnprovisionRequest { instance_id })?;
        self.inner
            .bus
            .publish(&self.inner.subjects.unprovision(&node_id), payload)
            .await?;

        self.handles().remove(&instance_id);
        info!(node_id = %node_id, instance_id = %instance_id, "Unprovision requested");
        Ok(())
    }

    /// Bind an application to a provisioned instance.
    #[instrument(skip(self, key), fields(instance_id = %key.instance_id, application_id = %key.application_id))]
    pub async fn bind_instance(&self, key: BindingKey) -> ProvisionResult<BindingHandle> {
        let handle = self
            .handle(&key.instance_id)
            .ok_or(ProvisionError::UnknownInstance(key.instance_id))?;
        let node_id = handle
            .node_id()
            .ok_or(ProvisionError::MissingNode(key.instance_id))?;

        let response: BindResponse = self
            .request_reply(self.inner.subjects.bind(&node_id), &key, node_id)
            .await?;

        info!(node_id = %node_id, binding_id = %response.binding_id, "Bound application");
        Ok(BindingHandle {
            service_id: fleet_id::HandleId::new(),
            instance_id: response.instance_id,
            binding_id: response.binding_id,
            application_id: response.application_id,
            configuration: handle.configuration,
            credentials: response.credentials,
        })
    }

    /// Remove an application's binding from a provisioned instance.
    #[instrument(skip(self, key), fields(instance_id = %key.instance_id, application_id = %key.application_id))]
    pub async fn unbind_instance(&self, key: BindingKey) -> ProvisionResult<()> {
        let node_id = self.owning_node(&key.instance_id)?;

        let response: UnbindResponse = self
            .request_reply(self.inner.subjects.unbind(&node_id), &key, node_id)
            .await?;

        info!(node_id = %node_id, unbound = response.unbound, "Unbound application");
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Broadcast discover and collect announcements until the live node
    /// count has replied or the discovery window closes.
    async fn discover(&self) -> ProvisionResult<Vec<Announcement>> {
        let expected = self.live_node_count();
        let mut replies = self
            .inner
            .bus
            .request(&self.inner.subjects.discover(), Bytes::new())
            .await?;

        let (done_tx, mut done_rx) = oneshot::channel::<Vec<Message>>();
        let barrier = Barrier::new(expected, self.inner.config.discovery_timeout, move |responses| {
            let _ = done_tx.send(responses);
        });

        let collected = loop {
            tokio::select! {
                biased;
                responses = &mut done_rx => break responses.unwrap_or_default(),
                message = replies.next() => match message {
                    Some(message) => {
                        barrier.offer(message);
                    }
                    None => break (&mut done_rx).await.unwrap_or_default(),
                },
            }
        };
        replies.unsubscribe();

        let announcements: Vec<Announcement> = collected
            .into_iter()
            .filter_map(|message| match decode::<Announcement>(&message.payload) {
                Ok(announcement) => Some(announcement),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed announcement");
                    None
                }
            })
            .collect();

        debug!(expected, received = announcements.len(), "Discovery complete");
        Ok(announcements)
    }

    /// Send one request to a node and wait for a single reply under the
    /// request guard timer. The reply subscription is always released.
    async fn request_reply<Req, Resp>(
        &self,
        subject: String,
        request: &Req,
        node_id: NodeId,
    ) -> ProvisionResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = encode(request)?;
        let mut replies = self.inner.bus.request(&subject, payload).await?;

        let timeout = self.inner.config.request_timeout;
        let outcome = tokio::time::timeout(timeout, replies.next()).await;
        replies.unsubscribe();

        let message = match outcome {
            Ok(Some(message)) => message,
            Ok(None) => return Err(fleet_bus::BusError::Closed.into()),
            Err(_) => {
                warn!(node_id = %node_id, subject = %subject, "Node did not reply in time");
                return Err(ProvisionError::RemoteTimeout { node_id, timeout });
            }
        };

        let reply: Reply<Resp> = decode(&message.payload)?;
        reply
            .into_result()
            .map_err(|payload| ProvisionError::remote(node_id, payload))
    }

    fn owning_node(&self, instance_id: &InstanceId) -> ProvisionResult<NodeId> {
        let handles = self.handles();
        let handle = handles
            .get(instance_id)
            .ok_or(ProvisionError::UnknownInstance(*instance_id))?;
        handle
            .node_id()
            .ok_or(ProvisionError::MissingNode(*instance_id))
    }

    fn registry(&self) -> MutexGuard<'_, NodeRegistry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn handles(&self) -> MutexGuard<'_, HandleCache> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
