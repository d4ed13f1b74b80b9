//! Cluster resources backing a lab, managed outside this daemon.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request to bring up one lab session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabRequest {
    pub lab_session_id: String,
    pub vm_name: String,
    pub namespace: String,
    /// JSON array of setup step descriptors. Empty means no setup.
    #[serde(default, rename = "setupStepsJson")]
    pub setup_steps: String,
}

impl LabRequest {
    pub fn new(
        lab_session_id: impl Into<String>,
        vm_name: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            lab_session_id: lab_session_id.into(),
            vm_name: vm_name.into(),
            namespace: namespace.into(),
            setup_steps: String::new(),
        }
    }

    pub fn with_setup_steps(mut self, json: impl Into<String>) -> Self {
        self.setup_steps = json.into();
        self
    }
}

/// A resource backend failure.
#[derive(Error, Debug)]
#[error("{0}")]
pub struct ResourceError(pub String);

/// Creates and deletes the VM, volumes and namespace for a lab.
#[async_trait]
pub trait LabResources: Send + Sync {
    async fn create(&self, request: &LabRequest) -> Result<(), ResourceError>;

    async fn delete(&self, request: &LabRequest) -> Result<(), ResourceError>;
}

/// Backend for deployments where another service owns lab resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLabResources;

#[async_trait]
impl LabResources for NoopLabResources {
    async fn create(&self, request: &LabRequest) -> Result<(), ResourceError> {
        tracing::debug!(lab_session_id = %request.lab_session_id, vm = %request.vm_name, "Resources managed externally, skipping create");
        Ok(())
    }

    async fn delete(&self, request: &LabRequest) -> Result<(), ResourceError> {
        tracing::debug!(lab_session_id = %request.lab_session_id, vm = %request.vm_name, "Resources managed externally, skipping delete");
        Ok(())
    }
}
