//! Reverse-order teardown shared by rollback and destroy

use tracing::{info, instrument, warn};

use super::Orchestrator;
use crate::error::{ErrorKind, ResourceFailure};
use crate::models::{BridgeState, ClusterState, Deployment, GatewayState};
use crate::registry::TrackedDeployment;

impl Orchestrator {
    /// Remove the gateway, then every cluster, then every bridge, releasing
    /// each bridge's subnet reservation once the bridge is gone.
    ///
    /// Never stops early. Resources that could not be removed keep their
    /// status in the record and are returned.
    #[instrument(skip_all)]
    pub(super) async fn teardown(&self, tracked: &TrackedDeployment) -> Vec<ResourceFailure> {
        let snapshot = tracked.snapshot().await;
        let mut leftovers = Vec::new();

        if snapshot.gateway.status != GatewayState::Removed {
            let container = snapshot.gateway.container.clone();
            match self.gateway.teardown(&container).await {
                Ok(()) => {
                    persist(tracked, |d| d.gateway.status = GatewayState::Removed).await;
                }
                Err(e) => {
                    warn!(container = %container, error = %e, "Failed to remove gateway");
                    leftovers.push(ResourceFailure::new(
                        format!("gateway/{}", container),
                        e.kind(),
                        e.to_string(),
                    ));
                }
            }
        }

        for cluster in snapshot.clusters.iter().rev() {
            let name = cluster.name.clone();
            match cluster.status {
                ClusterState::Deleted => {}
                ClusterState::NotCreated => {
                    persist(tracked, |d| set_cluster(d, &name, ClusterState::Deleted)).await;
                }
                ClusterState::Creating | ClusterState::Created | ClusterState::Failed => {
                    // A failed create may still have left node containers behind
                    let handle = cluster
                        .handle
                        .clone()
                        .unwrap_or_else(|| self.provisioner.handle_for(&cluster.bridge));
                    match self.provisioner.delete(&handle).await {
                        Ok(()) => {
                            info!(cluster = %name, "Cluster deleted");
                            persist(tracked, |d| set_cluster(d, &name, ClusterState::Deleted)).await;
                        }
                        Err(e) => {
                            warn!(cluster = %name, error = %e, "Failed to delete cluster");
                            leftovers.push(ResourceFailure::new(
                                format!("cluster/{}", name),
                                ErrorKind::ClusterProvisionFailed,
                                e.to_string(),
                            ));
                        }
                    }
                }
            }
        }

        for bridge in snapshot.bridges.iter().rev() {
            if bridge.status == BridgeState::Removed {
                continue;
            }
            let name = bridge.name.clone();
            // Never recorded as created: only remove it if it is ours
            let removal = if bridge.status == BridgeState::Absent {
                match self.bridges.bridge_subnet(&name).await {
                    Ok(Some(subnet)) if subnet == bridge.subnet => {
                        self.bridges.remove_bridge(&name).await
                    }
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            } else {
                self.bridges.remove_bridge(&name).await
            };
            match removal {
                Ok(()) => {
                    info!(bridge = %name, "Bridge removed");
                    persist(tracked, |d| {
                        if let Some(b) = d.bridge_mut(&name) {
                            b.status = BridgeState::Removed;
                        }
                    })
                    .await;
                    if let Err(e) = self
                        .registry
                        .release_subnet(&snapshot.name, &bridge.subnet)
                        .await
                    {
                        warn!(subnet = %bridge.subnet, error = %e, "Failed to release subnet");
                    }
                }
                Err(e) => {
                    warn!(bridge = %name, error = %e, "Failed to remove bridge");
                    leftovers.push(ResourceFailure::new(
                        format!("bridge/{}", name),
                        e.kind(),
                        e.to_string(),
                    ));
                }
            }
        }

        leftovers
    }
}

fn set_cluster(d: &mut Deployment, name: &str, status: ClusterState) {
    if let Some(c) = d.cluster_mut(name) {
        c.status = status;
    }
}

/// Record a teardown step; a registry failure must not stop the teardown
async fn persist<F>(tracked: &TrackedDeployment, f: F)
where
    F: FnOnce(&mut Deployment),
{
    if let Err(e) = tracked.update(f).await {
        warn!(error = %e, "Failed to persist teardown progress");
    }
}
