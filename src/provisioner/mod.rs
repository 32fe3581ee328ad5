//! Single-cluster provisioner adapter
//!
//! The orchestrator never talks to KIND directly; it goes through
//! [`ClusterProvisioner`], so anything able to create and delete a cluster
//! bound to a bridge network can stand in (including test doubles).

mod kind;

use async_trait::async_trait;

pub use kind::{render_kind_config, KindProvisioner};

use crate::error::AppResult;
use crate::models::{ClusterHandle, ClusterSpec};

#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Create `cluster_name` with its nodes attached to `bridge`.
    ///
    /// On failure the implementation must not leave resources it cannot
    /// find again through [`ClusterProvisioner::handle_for`].
    async fn create(
        &self,
        cluster_name: &str,
        bridge: &str,
        spec: &ClusterSpec,
    ) -> AppResult<ClusterHandle>;

    async fn delete(&self, handle: &ClusterHandle) -> AppResult<()>;

    /// Container names of the cluster's nodes
    async fn nodes(&self, handle: &ClusterHandle) -> AppResult<Vec<String>>;

    /// Handle for a cluster name, used to clean up after a failed create
    fn handle_for(&self, cluster_name: &str) -> ClusterHandle;
}
