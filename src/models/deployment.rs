//! Deployment record: the single root that owns every cluster, bridge,
//! gateway attachment and link rule of a multicluster deployment.
//!
//! Children reference each other by name (cluster -> bridge, attachment ->
//! bridge, rule -> clusters), never by pointer, so the whole record can be
//! cloned, persisted and reloaded as one value.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::topology::{Topology, TopologyConfig, WanParams};
use crate::error::{ErrorKind, ResourceFailure};
use crate::network::Subnet;

/// Lifecycle of a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentState {
    Pending,
    Provisioning,
    Ready,
    Degraded,
    Failed,
    Destroying,
    Destroyed,
}

impl DeploymentState {
    /// States in which a create for the same name must be refused
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DeploymentState::Pending | DeploymentState::Provisioning | DeploymentState::Destroying
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClusterState {
    NotCreated,
    Creating,
    Created,
    Failed,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BridgeState {
    Absent,
    Created,
    Attached,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GatewayState {
    Absent,
    Running,
    Removed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttachmentState {
    Pending,
    Attached,
    Failed,
}

/// Routes from a cluster's nodes to the other clusters via the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RouteState {
    Pending,
    Installed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RuleState {
    Pending,
    Applied,
    Failed,
}

/// Identity of a cluster created by the provisioner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHandle {
    /// Name the provisioner knows the cluster by
    pub name: String,
    /// kubeconfig context of the cluster
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRecord {
    pub name: String,
    pub subnet: Subnet,
    pub status: BridgeState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    pub name: String,
    /// Name of the bridge in [`Deployment::bridges`]
    pub bridge: String,
    pub status: ClusterState,
    pub handle: Option<ClusterHandle>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub bridge: String,
    /// Interface name inside the gateway container
    pub interface: Option<String>,
    /// Gateway address on the bridge
    pub address: Option<String>,
    /// Connect and root qdisc only; routes are tracked apart
    pub status: AttachmentState,
    pub message: Option<String>,
    pub routes: RouteState,
    pub routes_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleRecord {
    pub from: String,
    pub to: String,
    pub params: WanParams,
    pub status: RuleState,
    pub message: Option<String>,
}

impl RuleRecord {
    pub fn pair(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub container: String,
    pub image: String,
    pub status: GatewayState,
    /// Bridge attachments in cluster order
    pub attachments: Vec<AttachmentRecord>,
    pub rules: Vec<RuleRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub status: DeploymentState,
    /// Configuration the deployment was created from
    pub topology: TopologyConfig,
    pub clusters: Vec<ClusterRecord>,
    pub bridges: Vec<BridgeRecord>,
    pub gateway: GatewayRecord,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Build a Pending record; `subnets` holds the bridge subnet of each
    /// cluster in topology order.
    pub fn new(
        topology: &Topology,
        config: &TopologyConfig,
        subnets: &[Subnet],
        gateway_image: &str,
    ) -> Self {
        let now = Utc::now();
        let bridges: Vec<BridgeRecord> = topology
            .clusters()
            .iter()
            .zip(subnets)
            .map(|(c, subnet)| BridgeRecord {
                name: topology.bridge_name(&c.name),
                subnet: *subnet,
                status: BridgeState::Absent,
            })
            .collect();

        let clusters = topology
            .clusters()
            .iter()
            .map(|c| ClusterRecord {
                name: c.name.clone(),
                bridge: topology.bridge_name(&c.name),
                status: ClusterState::NotCreated,
                handle: None,
                message: None,
            })
            .collect();

        let attachments = bridges
            .iter()
            .map(|b| AttachmentRecord {
                bridge: b.name.clone(),
                interface: None,
                address: None,
                status: AttachmentState::Pending,
                message: None,
                routes: RouteState::Pending,
                routes_message: None,
            })
            .collect();

        let rules = topology
            .links()
            .iter()
            .map(|l| RuleRecord {
                from: l.from.clone(),
                to: l.to.clone(),
                params: l.params,
                status: RuleState::Pending,
                message: None,
            })
            .collect();

        Self {
            name: topology.name().to_string(),
            status: DeploymentState::Pending,
            topology: config.clone(),
            clusters,
            bridges,
            gateway: GatewayRecord {
                container: gateway_container_name(topology.name()),
                image: gateway_image.to_string(),
                status: GatewayState::Absent,
                attachments,
                rules,
            },
            message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: DeploymentState) {
        self.status = status;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterRecord> {
        self.clusters.iter().find(|c| c.name == name)
    }

    pub fn cluster_mut(&mut self, name: &str) -> Option<&mut ClusterRecord> {
        self.clusters.iter_mut().find(|c| c.name == name)
    }

    pub fn bridge(&self, name: &str) -> Option<&BridgeRecord> {
        self.bridges.iter().find(|b| b.name == name)
    }

    pub fn bridge_mut(&mut self, name: &str) -> Option<&mut BridgeRecord> {
        self.bridges.iter_mut().find(|b| b.name == name)
    }

    /// Bridge of the given cluster
    pub fn bridge_of(&self, cluster: &str) -> Option<&BridgeRecord> {
        self.cluster(cluster).and_then(|c| self.bridge(&c.bridge))
    }

    pub fn attachment(&self, bridge: &str) -> Option<&AttachmentRecord> {
        self.gateway.attachments.iter().find(|a| a.bridge == bridge)
    }

    pub fn attachment_mut(&mut self, bridge: &str) -> Option<&mut AttachmentRecord> {
        self.gateway.attachments.iter_mut().find(|a| a.bridge == bridge)
    }

    pub fn rule_mut(&mut self, from: &str, to: &str) -> Option<&mut RuleRecord> {
        self.gateway
            .rules
            .iter_mut()
            .find(|r| r.from == from && r.to == to)
    }

    /// Whether any resource may still exist outside the registry's control
    pub fn has_live_resources(&self) -> bool {
        self.gateway.status == GatewayState::Running
            || self
                .clusters
                .iter()
                .any(|c| matches!(c.status, ClusterState::Creating | ClusterState::Created | ClusterState::Failed))
            || self
                .bridges
                .iter()
                .any(|b| matches!(b.status, BridgeState::Created | BridgeState::Attached))
    }

    /// Every recorded sub-resource failure
    pub fn failures(&self) -> Vec<ResourceFailure> {
        let clusters = self
            .clusters
            .iter()
            .filter(|c| c.status == ClusterState::Failed)
            .map(|c| {
                ResourceFailure::new(
                    format!("cluster/{}", c.name),
                    ErrorKind::ClusterProvisionFailed,
                    c.message.clone().unwrap_or_default(),
                )
            });
        let attachments = self
            .gateway
            .attachments
            .iter()
            .filter(|a| a.status == AttachmentState::Failed)
            .map(|a| {
                ResourceFailure::new(
                    format!("attachment/{}", a.bridge),
                    ErrorKind::GatewayAttachFailed,
                    a.message.clone().unwrap_or_default(),
                )
            });
        let routes = self.clusters.iter().filter_map(|c| {
            let a = self.attachment(&c.bridge)?;
            (a.routes == RouteState::Failed).then(|| {
                ResourceFailure::new(
                    format!("routes/{}", c.name),
                    ErrorKind::GatewayAttachFailed,
                    a.routes_message.clone().unwrap_or_default(),
                )
            })
        });
        let rules = self
            .gateway
            .rules
            .iter()
            .filter(|r| r.status == RuleState::Failed)
            .map(|r| {
                ResourceFailure::new(
                    format!("link/{}", r.pair()),
                    ErrorKind::RuleApplyFailed,
                    r.message.clone().unwrap_or_default(),
                )
            });
        clusters
            .chain(attachments)
            .chain(routes)
            .chain(rules)
            .collect()
    }

    /// Ready iff every cluster is up and every attachment, route set and rule
    /// is in place; Degraded when only gateway-side pieces are broken.
    pub fn converged_state(&self) -> DeploymentState {
        if self.clusters.iter().any(|c| c.status != ClusterState::Created) {
            return DeploymentState::Failed;
        }
        let attachments_ok = self
            .gateway
            .attachments
            .iter()
            .all(|a| a.status == AttachmentState::Attached && a.routes == RouteState::Installed);
        let rules_ok = self
            .gateway
            .rules
            .iter()
            .all(|r| r.status == RuleState::Applied);
        if self.gateway.status == GatewayState::Running && attachments_ok && rules_ok {
            DeploymentState::Ready
        } else {
            DeploymentState::Degraded
        }
    }
}

pub fn gateway_container_name(deployment: &str) -> String {
    format!("{}-gateway", deployment)
}
