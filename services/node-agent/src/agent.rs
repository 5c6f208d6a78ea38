//! The node agent.
//!
//! Wires the instance store, resource accounting, process supervisor and
//! backend hooks to the bus. Startup order is fixed: recovery, then
//! subscriptions, then the announce loop (whose first tick announces
//! immediately).
//!
//! Every inbound message is handled on its own task, so a slow provision never
//! delays discover replies. Handlers that received a reply subject always
//! answer it, with an error payload if anything failed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use fleet_bus::{Bus, Message, Subscription};
use fleet_id::{BindingId, InstanceId, NodeId};
use fleet_messages::{
    decode, encode, Announcement, BindResponse, BindingKey, ProvisionRequest, ProvisionResponse,
    Reply, Subjects, UnbindResponse, UnprovisionRequest, UnprovisionResponse,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::announce;
use crate::backend::{Backend, BackendError, Capacity, InstanceRequest};
use crate::config::Config;
use crate::error::AgentError;
use crate::process::{remove_workdir, ProcessSupervisor};
use crate::recovery::{self, RecoveryReport};
use crate::resources::Resources;
use crate::state::{BindingRecord, InstanceRecord, StateStore, StateStoreError};

/// Inbound request kinds, one subscription each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Discover,
    Provision,
    Unprovision,
    Bind,
    Unbind,
}

struct AgentInner {
    node_id: NodeId,
    config: Config,
    subjects: Subjects,
    bus: Arc<dyn Bus>,
    backend: Arc<dyn Backend>,
    supervisor: ProcessSupervisor,
    store: Mutex<StateStore>,
    resources: Mutex<Resources>,
    /// Recovered instances whose memory is not reserved.
    orphans: Mutex<HashSet<InstanceId>>,
}

/// Node agent for one service namespace. Clones share all state.
#[derive(Clone)]
pub struct NodeAgent {
    inner: Arc<AgentInner>,
}

/// A started agent: what recovery found, and the spawned loops.
pub struct RunningAgent {
    pub recovery: RecoveryReport,
    pub tasks: Vec<JoinHandle<()>>,
}

impl NodeAgent {
    /// Create a new agent. Resolves the node id (configured, else persisted,
    /// else freshly generated) and persists it.
    pub fn new(
        config: Config,
        bus: Arc<dyn Bus>,
        backend: Arc<dyn Backend>,
        store: StateStore,
    ) -> Result<Self, AgentError> {
        let node_id = resolve_node_id(&config, &store)?;
        let subjects = Subjects::new(config.service.clone());
        let resources = Resources::new(config.port_range.clone(), config.available_memory_mb);
        let supervisor = ProcessSupervisor::new(config.stop_grace);

        Ok(Self {
            inner: Arc::new(AgentInner {
                node_id,
                config,
                subjects,
                bus,
                backend,
                supervisor,
                store: Mutex::new(store),
                resources: Mutex::new(resources),
                orphans: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn subjects(&self) -> &Subjects {
        &self.inner.subjects
    }

    pub fn available_memory_mb(&self) -> u64 {
        self.resources().memory.available_mb()
    }

    pub fn free_port_count(&self) -> usize {
        self.resources().ports.free_count()
    }

    pub fn is_port_free(&self, port: u16) -> bool {
        self.resources().ports.is_free(port)
    }

    pub fn instance(&self, instance_id: &InstanceId) -> Result<Option<InstanceRecord>, AgentError> {
        Ok(self.store().get_instance(instance_id)?)
    }

    pub fn instance_count(&self) -> Result<usize, AgentError> {
        Ok(self.store().instance_count()?)
    }

    /// Recover persisted instances, then subscribe and start announcing.
    ///
    /// Call once: recovery claims resources from the store.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Result<RunningAgent, AgentError> {
        let recovery = self.recover()?;

        let routes = [
            (Route::Discover, self.inner.subjects.discover()),
            (Route::Provision, self.inner.subjects.provision(&self.inner.node_id)),
            (Route::Unprovision, self.inner.subjects.unprovision(&self.inner.node_id)),
            (Route::Bind, self.inner.subjects.bind(&self.inner.node_id)),
            (Route::Unbind, self.inner.subjects.unbind(&self.inner.node_id)),
        ];

        let mut tasks = Vec::with_capacity(routes.len() + 1);
        for (route, subject) in routes {
            let subscription = self.inner.bus.subscribe(&subject).await?;
            debug!(subject = %subject, "Subscribed");
            tasks.push(tokio::spawn(self.clone().serve(
                route,
                subscription,
                shutdown.clone(),
            )));
        }

        let interval = Duration::from_secs(self.inner.config.announce_interval_secs.max(1));
        tasks.push(tokio::spawn(announce::run_announce_loop(
            self.clone(),
            interval,
            shutdown,
        )));

        info!(
            node_id = %self.inner.node_id,
            service = %self.inner.subjects.service(),
            available_memory_mb = self.available_memory_mb(),
            free_ports = self.free_port_count(),
            "Node agent started"
        );
        Ok(RunningAgent { recovery, tasks })
    }

    fn recover(&self) -> Result<RecoveryReport, AgentError> {
        let report = {
            let store = self.store();
            let mut resources = self.resources();
            recovery::recover(&store, &mut resources, &self.inner.supervisor)?
        };
        self.orphans().extend(report.orphaned.iter().copied());
        Ok(report)
    }

    // =========================================================================
    // Announcements
    // =========================================================================

    /// The current announcement, built from live capacity.
    pub fn announcement(&self) -> Announcement {
        let capacity = {
            let resources = self.resources();
            Capacity {
                available_memory_mb: resources.memory.available_mb(),
                capacity_mb: resources.memory.capacity_mb(),
                free_ports: resources.ports.free_count(),
            }
        };
        Announcement::new(self.inner.node_id, self.inner.backend.announcement(&capacity))
    }

    /// Publish the announcement to `reply`, or to the shared announce subject.
    pub async fn announce(&self, reply: Option<&str>) -> Result<(), AgentError> {
        let payload = encode(&self.announcement())?;
        let subject = match reply {
            Some(reply) => reply.to_string(),
            None => self.inner.subjects.announce(),
        };
        self.inner.bus.publish(&subject, payload).await?;
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Allocate resources, prepare the backend, start the backing process and
    /// persist the record. Every failure releases what was taken.
    #[instrument(skip(self, request), fields(plan = %request.plan))]
    pub async fn provision(&self, request: ProvisionRequest) -> Result<ProvisionResponse, AgentError> {
        let memory_mb = self.inner.backend.memory_for_plan(&request.plan)?;
        let port = self
            .resources()
            .reserve(memory_mb, self.inner.backend.uses_port())?;

        let instance_id = InstanceId::new();
        let instance_request = InstanceRequest {
            instance_id,
            plan: request.plan.clone(),
            port,
            memory_mb,
            workdir: self.inner.config.instance_dir(&instance_id),
            host: self.inner.config.local_ip.clone(),
        };

        let setup = match self
            .blocking(move |backend| backend.provision(&instance_request))
            .await
        {
            Ok(setup) => setup,
            Err(e) => {
                self.resources().release(memory_mb, port);
                return Err(e);
            }
        };

        let process = match &setup.launch {
            Some(launch) => match self.inner.supervisor.start(launch) {
                Ok(process) => Some(process),
                Err(e) => {
                    if let Some(dir) = &launch.workdir {
                        remove_workdir(dir);
                    }
                    self.resources().release(memory_mb, port);
                    return Err(e.into());
                }
            },
            None => None,
        };

        let record = InstanceRecord {
            instance_id,
            plan: request.plan,
            port,
            memory_mb,
            pid: process.map(|p| p.pid()),
            workdir: setup.launch.as_ref().and_then(|l| l.workdir.clone()),
            launch: setup.launch,
            credentials: setup.credentials.clone(),
            created_at: Utc::now().timestamp(),
        };

        let persisted = self.store().insert_instance(&record);
        if let Err(e) = persisted {
            error!(instance_id = %instance_id, error = %e, "Failed to persist instance, rolling back");
            if let Err(stop_err) = self
                .inner
                .supervisor
                .stop(record.pid, record.workdir.as_deref())
                .await
            {
                warn!(instance_id = %instance_id, error = %stop_err, "Rollback could not stop process");
            }
            self.resources().release(memory_mb, port);
            return Err(e.into());
        }

        info!(
            instance_id = %instance_id,
            port = ?port,
            memory_mb,
            pid = ?record.pid,
            "Provisioned instance"
        );

        Ok(ProvisionResponse {
            instance_id,
            node_id: self.inner.node_id,
            connection: setup.credentials,
        })
    }

    /// Stop the backing process, drop bindings and the record, and return
    /// the instance's port and memory to the pools.
    #[instrument(skip(self, request), fields(instance_id = %request.instance_id))]
    pub async fn unprovision(
        &self,
        request: UnprovisionRequest,
    ) -> Result<UnprovisionResponse, AgentError> {
        let instance_id = request.instance_id;
        let record = self
            .store()
            .get_instance(&instance_id)?
            .ok_or(AgentError::InstanceNotFound(instance_id))?;
        let bindings = self.store().list_bindings(&instance_id)?;

        if let Err(e) = self
            .inner
            .supervisor
            .stop(record.pid, record.workdir.as_deref())
            .await
        {
            warn!(error = %e, pid = ?record.pid, "Failed to stop backing process");
        }

        let hook_record = record.clone();
        if let Err(e) = self
            .blocking(move |backend| backend.unprovision(&hook_record, &bindings))
            .await
        {
            warn!(error = %e, "Backend cleanup failed");
        }

        let deleted = self.store().delete_instance(&instance_id)?;
        if !deleted {
            // A concurrent unprovision got there first and already released.
            return Err(AgentError::InstanceNotFound(instance_id));
        }

        let was_orphan = self.orphans().remove(&instance_id);
        {
            let mut resources = self.resources();
            if was_orphan {
                if let Some(port) = record.port {
                    resources.ports.release(port);
                }
            } else {
                resources.release(record.memory_mb, record.port);
            }
        }

        info!(port = ?record.port, memory_mb = record.memory_mb, "Unprovisioned instance");
        Ok(UnprovisionResponse {
            instance_id,
            unprovisioned: true,
        })
    }

    /// Create or fetch the binding for `key`. Re-binding returns the stored
    /// credentials without calling the backend again.
    #[instrument(skip(self, key), fields(instance_id = %key.instance_id, application_id = %key.application_id))]
    pub async fn bind(&self, key: BindingKey) -> Result<BindResponse, AgentError> {
        let record = self
            .store()
            .get_instance(&key.instance_id)?
            .ok_or(AgentError::InstanceNotFound(key.instance_id))?;

        let existing = self.store().get_binding(&key)?;
        if let Some(existing) = existing {
            debug!(binding_id = %existing.binding_id, "Returning existing binding");
            return Ok(bind_response(existing));
        }

        let application_id = key.application_id.clone();
        let binding_options = key.binding_options.clone();
        let credentials = self
            .blocking(move |backend| backend.bind(&record, &application_id, &binding_options))
            .await?;

        let binding = BindingRecord {
            binding_id: BindingId::new(),
            instance_id: key.instance_id,
            application_id: key.application_id.clone(),
            binding_options: key.binding_options.clone(),
            credentials,
            created_at: Utc::now().timestamp(),
        };

        let inserted = self.store().insert_binding(&binding)?;
        let binding = if inserted {
            info!(binding_id = %binding.binding_id, "Created binding");
            binding
        } else {
            // A concurrent bind for the same key won.
            self.store()
                .get_binding(&key)?
                .ok_or_else(|| AgentError::BindingNotFound {
                    instance_id: key.instance_id,
                    application_id: key.application_id.clone(),
                })?
        };

        Ok(bind_response(binding))
    }

    /// Revoke and delete the binding for `key`.
    #[instrument(skip(self, key), fields(instance_id = %key.instance_id, application_id = %key.application_id))]
    pub async fn unbind(&self, key: BindingKey) -> Result<UnbindResponse, AgentError> {
        let not_found = || AgentError::BindingNotFound {
            instance_id: key.instance_id,
            application_id: key.application_id.clone(),
        };

        let record = self
            .store()
            .get_instance(&key.instance_id)?
            .ok_or(AgentError::InstanceNotFound(key.instance_id))?;
        let binding = self.store().get_binding(&key)?.ok_or_else(not_found)?;

        let binding_id = binding.binding_id;
        self.blocking(move |backend| backend.unbind(&record, &binding))
            .await?;

        let deleted = self.store().delete_binding(&key)?;
        if !deleted {
            return Err(not_found());
        }

        info!(binding_id = %binding_id, "Removed binding");
        Ok(UnbindResponse {
            instance_id: key.instance_id,
            application_id: key.application_id.clone(),
            unbound: true,
        })
    }

    // =========================================================================
    // Bus plumbing
    // =========================================================================

    async fn serve(
        self,
        route: Route,
        mut subscription: Subscription,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                message = subscription.next() => {
                    let Some(message) = message else {
                        warn!(?route, "Subscription closed");
                        break;
                    };
                    let agent = self.clone();
                    tokio::spawn(async move { agent.dispatch(route, message).await });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!(?route, "Handler loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn dispatch(&self, route: Route, message: Message) {
        debug!(subject = %message.subject, ?route, "Received request");
        match route {
            Route::Discover => {
                if let Err(e) = self.announce(message.reply.as_deref()).await {
                    warn!(error = %e, "Failed to answer discover");
                }
            }
            Route::Provision => {
                let result = self.handle_provision(&message.payload).await;
                self.respond(&message, result).await;
            }
            Route::Unprovision => {
                let result = self.handle_unprovision(&message.payload).await;
                self.respond(&message, result).await;
            }
            Route::Bind => {
                let result = self.handle_bind(&message.payload).await;
                self.respond(&message, result).await;
            }
            Route::Unbind => {
                let result = self.handle_unbind(&message.payload).await;
                self.respond(&message, result).await;
            }
        }
    }

    async fn handle_provision(&self, payload: &[u8]) -> Result<ProvisionResponse, AgentError> {
        self.provision(decode(payload)?).await
    }

    async fn handle_unprovision(&self, payload: &[u8]) -> Result<UnprovisionResponse, AgentError> {
        self.unprovision(decode(payload)?).await
    }

    async fn handle_bind(&self, payload: &[u8]) -> Result<BindResponse, AgentError> {
        self.bind(decode(payload)?).await
    }

    async fn handle_unbind(&self, payload: &[u8]) -> Result<UnbindResponse, AgentError> {
        self.unbind(decode(payload)?).await
    }

    /// Publish the outcome to the message's reply subject, if it has one.
    async fn respond<T: Serialize>(&self, message: &Message, result: Result<T, AgentError>) {
        if let Err(e) = &result {
            warn!(subject = %message.subject, kind = %e.kind(), error = %e, "Request failed");
        }
        let Some(reply) = &message.reply else {
            return;
        };

        let reply_payload: Reply<T> = result.map_err(|e| e.to_payload()).into();
        match encode(&reply_payload) {
            Ok(bytes) => {
                if let Err(e) = self.inner.bus.publish(reply, bytes).await {
                    warn!(subject = %message.subject, error = %e, "Failed to publish reply");
                }
            }
            Err(e) => error!(subject = %message.subject, error = %e, "Failed to encode reply"),
        }
    }

    /// Run a backend hook on the blocking pool.
    async fn blocking<T, F>(&self, hook: F) -> Result<T, AgentError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Backend) -> Result<T, BackendError> + Send + 'static,
    {
        let backend = Arc::clone(&self.inner.backend);
        match tokio::task::spawn_blocking(move || hook(backend.as_ref())).await {
            Ok(result) => result.map_err(AgentError::from),
            Err(e) => Err(BackendError::Failed(format!("backend hook panicked: {e}")).into()),
        }
    }

    fn store(&self) -> MutexGuard<'_, StateStore> {
        self.inner.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.inner
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn orphans(&self) -> MutexGuard<'_, HashSet<InstanceId>> {
        self.inner
            .orphans
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn bind_response(binding: BindingRecord) -> BindResponse {
    BindResponse {
        binding_id: binding.binding_id,
        instance_id: binding.instance_id,
        application_id: binding.application_id,
        credentials: binding.credentials,
    }
}

fn resolve_node_id(config: &Config, store: &StateStore) -> Result<NodeId, StateStoreError> {
    let persisted = store.node_id()?;
    let node_id = config.node_id.or(persisted).unwrap_or_else(NodeId::new);
    if persisted != Some(node_id) {
        store.set_node_id(&node_id)?;
    }
    Ok(node_id)
}
