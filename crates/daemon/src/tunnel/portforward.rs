//! Port-forward tunnels through the Kubernetes API server.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};

use super::stream::{TunnelError, TunnelStream, TunnelTarget};

/// Opens byte streams to pod ports.
///
/// One call is one attempt: implementations do not retry. Retrying is left
/// to whoever owns the connection being built on top of the stream.
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    async fn open(&self, target: &TunnelTarget) -> Result<TunnelStream, TunnelError>;
}

/// Tunnel opener backed by the API server's port-forward subresource.
#[derive(Clone)]
pub struct PortForwardTunnel {
    client: Client,
}

impl PortForwardTunnel {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the ambient cluster configuration.
    ///
    /// In-cluster service accounts are tried first, then `KUBECONFIG`, then
    /// `~/.kube/config`.
    pub async fn try_default() -> Result<Self, TunnelError> {
        let client = Client::try_default()
            .await
            .map_err(|e| TunnelError::Client(e.to_string()))?;
        Ok(Self::new(client))
    }
}

#[async_trait]
impl TunnelOpener for PortForwardTunnel {
    async fn open(&self, target: &TunnelTarget) -> Result<TunnelStream, TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &target.namespace);

        let mut forwarder = pods
            .portforward(&target.pod_name, &[target.port])
            .await
            .map_err(|e| match e {
                kube::Error::Api(ref err) if err.code == 404 => TunnelError::PodNotFound {
                    namespace: target.namespace.clone(),
                    pod: target.pod_name.clone(),
                },
                _ => TunnelError::Forward {
                    target: target.to_string(),
                    message: e.to_string(),
                },
            })?;

        let io = forwarder
            .take_stream(target.port)
            .ok_or_else(|| TunnelError::PortUnavailable {
                target: target.to_string(),
                port: target.port,
            })?;

        tracing::debug!(target = %target, "Port-forward established");

        // The forwarder drives the websocket behind the stream.
        Ok(TunnelStream::new(target.clone(), io).with_guard(forwarder))
    }
}
