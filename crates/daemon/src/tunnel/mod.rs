//! Tunnels to pod ports through the Kubernetes API.
//!
//! Lab VMs are not network-reachable from the daemon. Every byte exchanged
//! with a VM travels through an API-server port-forward, wrapped here as a
//! [`TunnelStream`] that an SSH client can run over.

pub mod discovery;
pub mod portforward;
mod stream;

pub use discovery::{KubePodDiscovery, PodDiscovery, PodLocator, PodSummary};
pub use portforward::{PortForwardTunnel, TunnelOpener};
pub use stream::{TunnelError, TunnelIo, TunnelStream, TunnelTarget, DEFAULT_SSH_PORT};
