//! Template-driven backend running one daemon per instance.

use fleet_messages::Fields;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::json;

use super::{Backend, BackendError, InstanceRequest, InstanceSetup};
use crate::process::LaunchSpec;
use crate::state::InstanceRecord;

const PASSWORD_LEN: usize = 24;

/// Runs `binary` with an argument template per instance.
///
/// Template placeholders: `{port}`, `{password}`, `{dir}`, `{memory_mb}`.
/// Every plan gets `memory_mb`; every binding shares the instance credentials.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    binary: String,
    args: Vec<String>,
    memory_mb: u64,
}

impl ProcessBackend {
    pub fn new(binary: impl Into<String>, args: Vec<String>, memory_mb: u64) -> Self {
        Self {
            binary: binary.into(),
            args,
            memory_mb,
        }
    }

    fn render(&self, request: &InstanceRequest, password: &str) -> Vec<String> {
        let port = request.port.map(|p| p.to_string()).unwrap_or_default();
        let dir = request.workdir.to_string_lossy();
        let memory = request.memory_mb.to_string();

        self.args
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port)
                    .replace("{password}", password)
                    .replace("{dir}", &dir)
                    .replace("{memory_mb}", &memory)
            })
            .collect()
    }
}

pub(crate) fn generate_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LEN)
        .map(char::from)
        .collect()
}

impl Backend for ProcessBackend {
    fn memory_for_plan(&self, plan: &str) -> Result<u64, BackendError> {
        if plan.trim().is_empty() {
            return Err(BackendError::InvalidPlan(plan.to_string()));
        }
        Ok(self.memory_mb)
    }

    fn provision(&self, request: &InstanceRequest) -> Result<InstanceSetup, BackendError> {
        let password = generate_password();

        let mut launch = LaunchSpec::new(self.binary.clone()).workdir(request.workdir.clone());
        launch.args = self.render(request, &password);

        let mut credentials = Fields::new();
        credentials.insert("name".to_string(), json!(request.instance_id.to_string()));
        credentials.insert("hostname".to_string(), json!(request.host));
        credentials.insert("host".to_string(), json!(request.host));
        if let Some(port) = request.port {
            credentials.insert("port".to_string(), json!(port));
        }
        credentials.insert("password".to_string(), json!(password));

        Ok(InstanceSetup {
            credentials,
            launch: Some(launch),
        })
    }

    fn bind(
        &self,
        record: &InstanceRecord,
        _application_id: &str,
        _binding_options: &str,
    ) -> Result<Fields, BackendError> {
        Ok(record.credentials.clone())
    }
}
