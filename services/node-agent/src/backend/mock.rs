//! Mock backend for testing and development.

use std::sync::atomic::{AtomicUsize, Ordering};

use fleet_messages::Fields;
use serde_json::json;

use super::daemon::generate_password;
use super::{Backend, BackendError, InstanceRequest, InstanceSetup};
use crate::process::LaunchSpec;
use crate::state::{BindingRecord, InstanceRecord};

/// Configurable in-process backend.
///
/// By default instances have no backing process; use
/// [`MockBackend::with_launch`] to run a real one (e.g. `sleep`).
#[derive(Debug)]
pub struct MockBackend {
    memory_mb: u64,
    uses_port: bool,
    launch: Option<LaunchSpec>,
    fail_provision: bool,
    fail_bind: bool,
    provisions: AtomicUsize,
    unprovisions: AtomicUsize,
    binds: AtomicUsize,
    unbinds: AtomicUsize,
}

impl MockBackend {
    /// Create a new mock backend allocating `memory_mb` per instance.
    pub fn new(memory_mb: u64) -> Self {
        Self {
            memory_mb,
            uses_port: true,
            launch: None,
            fail_provision: false,
            fail_bind: false,
            provisions: AtomicUsize::new(0),
            unprovisions: AtomicUsize::new(0),
            binds: AtomicUsize::new(0),
            unbinds: AtomicUsize::new(0),
        }
    }

    /// Launch this process for every instance.
    pub fn with_launch(mut self, launch: LaunchSpec) -> Self {
        self.launch = Some(launch);
        self
    }

    pub fn without_port(mut self) -> Self {
        self.uses_port = false;
        self
    }

    /// Create a mock backend whose provision hook always fails.
    pub fn failing() -> Self {
        Self {
            fail_provision: true,
            fail_bind: true,
            ..Self::new(256)
        }
    }

    pub fn provision_calls(&self) -> usize {
        self.provisions.load(Ordering::SeqCst)
    }

    pub fn unprovision_calls(&self) -> usize {
        self.unprovisions.load(Ordering::SeqCst)
    }

    pub fn bind_calls(&self) -> usize {
        self.binds.load(Ordering::SeqCst)
    }

    pub fn unbind_calls(&self) -> usize {
        self.unbinds.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Backend for MockBackend {
    fn memory_for_plan(&self, plan: &str) -> Result<u64, BackendError> {
        match plan {
            "" | "invalid" => Err(BackendError::InvalidPlan(plan.to_string())),
            _ => Ok(self.memory_mb),
        }
    }

    fn uses_port(&self) -> bool {
        self.uses_port
    }

    fn provision(&self, request: &InstanceRequest) -> Result<InstanceSetup, BackendError> {
        self.provisions.fetch_add(1, Ordering::SeqCst);
        if self.fail_provision {
            return Err(BackendError::Failed("mock provision failure".to_string()));
        }

        let mut credentials = Fields::new();
        credentials.insert("hostname".to_string(), json!(request.host));
        if let Some(port) = request.port {
            credentials.insert("port".to_string(), json!(port));
        }
        credentials.insert("password".to_string(), json!(generate_password()));

        Ok(InstanceSetup {
            credentials,
            launch: self.launch.clone(),
        })
    }

    fn unprovision(
        &self,
        _record: &InstanceRecord,
        _bindings: &[BindingRecord],
    ) -> Result<(), BackendError> {
        self.unprovisions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn bind(
        &self,
        record: &InstanceRecord,
        application_id: &str,
        binding_options: &str,
    ) -> Result<Fields, BackendError> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        if self.fail_bind {
            return Err(BackendError::Failed("mock bind failure".to_string()));
        }

        let mut credentials = record.credentials.clone();
        credentials.insert("username".to_string(), json!(application_id));
        credentials.insert("password".to_string(), json!(generate_password()));
        credentials.insert("options".to_string(), json!(binding_options));
        Ok(credentials)
    }

    fn unbind(&self, _record: &InstanceRecord, _binding: &BindingRecord) -> Result<(), BackendError> {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
