//! Startup recovery.
//!
//! Runs before the agent subscribes to anything, so the first announcement
//! already reflects post-recovery capacity:
//!
//! 1. every persisted instance claims its port;
//! 2. instances whose process is alive are adopted and their memory reserved;
//! 3. dead instances are respawned from their launch spec, the new pid is
//!    persisted and their memory reserved;
//! 4. instances that cannot be respawned stay in the store as orphans: their
//!    port stays claimed but their memory is not reserved.

use fleet_id::InstanceId;
use tracing::{error, info, warn};

use crate::process::ProcessSupervisor;
use crate::resources::Resources;
use crate::state::{InstanceRecord, StateStore, StateStoreError};

/// Outcome of startup recovery, by instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Instances whose process was still running (or that have none).
    pub adopted: Vec<InstanceId>,
    /// Instances whose process was restarted.
    pub respawned: Vec<InstanceId>,
    /// Instances left in the store without a running process.
    pub orphaned: Vec<InstanceId>,
}

impl RecoveryReport {
    pub fn total(&self) -> usize {
        self.adopted.len() + self.respawned.len() + self.orphaned.len()
    }
}

/// Rebuild resource accounting from the store and bring dead instances back.
pub fn recover(
    store: &StateStore,
    resources: &mut Resources,
    supervisor: &ProcessSupervisor,
) -> Result<RecoveryReport, StateStoreError> {
    let mut report = RecoveryReport::default();

    for record in store.list_instances()? {
        if let Some(port) = record.port {
            if !resources.ports.claim(port) {
                warn!(
                    instance_id = %record.instance_id,
                    port,
                    "Recovered port outside the pool or already claimed"
                );
            }
        }

        // Instances without a process have nothing to probe.
        let alive = match record.pid {
            Some(pid) => supervisor.is_alive(pid),
            None => record.launch.is_none(),
        };

        if alive {
            resources.memory.adopt(record.memory_mb);
            info!(instance_id = %record.instance_id, pid = ?record.pid, "Adopted instance");
            report.adopted.push(record.instance_id);
        } else if respawn(store, resources, supervisor, &record) {
            report.respawned.push(record.instance_id);
        } else {
            report.orphaned.push(record.instance_id);
        }
    }

    info!(
        adopted = report.adopted.len(),
        respawned = report.respawned.len(),
        orphaned = report.orphaned.len(),
        available_memory_mb = resources.memory.available_mb(),
        free_ports = resources.ports.free_count(),
        "Startup recovery complete"
    );
    Ok(report)
}

fn respawn(
    store: &StateStore,
    resources: &mut Resources,
    supervisor: &ProcessSupervisor,
    record: &InstanceRecord,
) -> bool {
    let Some(launch) = &record.launch else {
        error!(
            instance_id = %record.instance_id,
            pid = ?record.pid,
            "Instance process is gone and there is no launch spec to restart it"
        );
        return false;
    };

    let process = match supervisor.start(launch) {
        Ok(process) => process,
        Err(e) => {
            error!(instance_id = %record.instance_id, error = %e, "Failed to respawn instance");
            return false;
        }
    };

    if let Err(e) = store.set_instance_pid(&record.instance_id, Some(process.pid())) {
        error!(
            instance_id = %record.instance_id,
            error = %e,
            "Failed to persist respawned pid, stopping process"
        );
        // Not persisted means not tracked: don't leave it running.
        if let Err(e) = process.kill() {
            warn!(pid = process.pid(), error = %e, "Failed to kill untracked process");
        }
        return false;
    }

    resources.memory.adopt(record.memory_mb);
    info!(
        instance_id = %record.instance_id,
        old_pid = ?record.pid,
        pid = process.pid(),
        "Respawned instance"
    );
    true
}
