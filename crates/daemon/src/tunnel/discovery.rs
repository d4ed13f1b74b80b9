//! Locating the pod that backs a lab VM.
//!
//! KubeVirt labels launcher pods inconsistently across versions, so a VM is
//! resolved by trying several label selectors in turn and falling back to
//! the launcher pod naming convention.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client};

use super::stream::TunnelError;

/// Phase reported by a pod whose containers are up.
pub const RUNNING_PHASE: &str = "Running";

/// Label selectors tried, in order, to find a VM's pod.
const VM_LABEL_KEYS: &[&str] = &["kubevirt.io/vm", "app", "vm.kubevirt.io/name"];

/// The bits of a pod the daemon cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    pub name: String,
    pub phase: Option<String>,
}

impl PodSummary {
    pub fn is_running(&self) -> bool {
        self.phase.as_deref() == Some(RUNNING_PHASE)
    }
}

impl From<Pod> for PodSummary {
    fn from(pod: Pod) -> Self {
        Self {
            name: pod.metadata.name.unwrap_or_default(),
            phase: pod.status.and_then(|s| s.phase),
        }
    }
}

/// Read access to pods in the cluster.
#[async_trait]
pub trait PodDiscovery: Send + Sync {
    /// Lists pods in a namespace. An empty selector lists every pod.
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, TunnelError>;
}

/// Pod discovery backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePodDiscovery {
    client: Client,
}

impl KubePodDiscovery {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PodDiscovery for KubePodDiscovery {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PodSummary>, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = if label_selector.is_empty() {
            ListParams::default()
        } else {
            ListParams::default().labels(label_selector)
        };
        let list = pods
            .list(&lp)
            .await
            .map_err(|e| TunnelError::Client(e.to_string()))?;
        Ok(list.items.into_iter().map(PodSummary::from).collect())
    }
}

/// Resolves VM names to running pods.
#[derive(Clone)]
pub struct PodLocator {
    discovery: Arc<dyn PodDiscovery>,
    poll_interval: Duration,
}

impl PodLocator {
    pub fn new(discovery: Arc<dyn PodDiscovery>, poll_interval: Duration) -> Self {
        Self {
            discovery,
            poll_interval,
        }
    }

    /// Finds the pod running `vm_name`, if there is one.
    ///
    /// Running pods matched by label win. Otherwise the first running pod
    /// named `virt-launcher-<vm>-*` is used.
    pub async fn resolve(
        &self,
        namespace: &str,
        vm_name: &str,
    ) -> Result<Option<String>, TunnelError> {
        for key in VM_LABEL_KEYS {
            let selector = format!("{}={}", key, vm_name);
            let pods = self.discovery.list_pods(namespace, &selector).await?;
            if let Some(pod) = pods.into_iter().find(PodSummary::is_running) {
                tracing::debug!(vm = %vm_name, pod = %pod.name, selector = %selector, "Resolved VM pod by label");
                return Ok(Some(pod.name));
            }
        }

        let prefix = format!("virt-launcher-{}-", vm_name);
        let pods = self.discovery.list_pods(namespace, "").await?;
        let found = pods
            .into_iter()
            .find(|p| p.name.starts_with(&prefix) && p.is_running())
            .map(|p| p.name);

        if let Some(ref name) = found {
            tracing::debug!(vm = %vm_name, pod = %name, "Resolved VM pod by name prefix");
        }
        Ok(found)
    }

    /// Polls until the VM's pod is running, or `timeout` elapses.
    pub async fn wait_for_running(
        &self,
        namespace: &str,
        vm_name: &str,
        timeout: Duration,
    ) -> Result<String, TunnelError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.resolve(namespace, vm_name).await {
                Ok(Some(pod)) => return Ok(pod),
                Ok(None) => {
                    tracing::debug!(namespace = %namespace, vm = %vm_name, "Pod not running yet");
                }
                Err(e) => {
                    tracing::warn!(namespace = %namespace, vm = %vm_name, error = %e, "Pod lookup failed");
                }
            }

            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(TunnelError::PodNotReady {
                    namespace: namespace.to_string(),
                    vm: vm_name.to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
