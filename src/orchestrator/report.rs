//! Read-only views of deployments for the CLI and HTTP API

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ResourceFailure;
use crate::models::{
    AttachmentState, BridgeState, ClusterState, Deployment, DeploymentState, GatewayState,
    RouteState, RuleState,
};

/// Result of a create request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CreateOutcome {
    /// Every cluster, attachment and rule is in place
    Ready,
    /// The deployment already existed with the same topology and was Ready
    AlreadyReady,
    /// Clusters are up but some attachments or rules failed
    Degraded { failures: Vec<ResourceFailure> },
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub name: String,
    pub status: ClusterState,
    pub bridge: String,
    pub bridge_status: Option<BridgeState>,
    pub subnet: Option<String>,
    pub context: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttachmentStatus {
    pub bridge: String,
    pub interface: Option<String>,
    pub address: Option<String>,
    pub status: AttachmentState,
    pub routes: RouteState,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleStatus {
    pub from: String,
    pub to: String,
    pub status: RuleState,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub container: String,
    pub image: String,
    pub status: GatewayState,
    pub attachments: Vec<AttachmentStatus>,
    pub rules: Vec<RuleStatus>,
}

/// Full status of one deployment
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatusReport {
    pub name: String,
    pub status: DeploymentState,
    pub message: Option<String>,
    pub clusters: Vec<ClusterStatus>,
    pub gateway: GatewayStatus,
    pub failures: Vec<ResourceFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Deployment> for DeploymentStatusReport {
    fn from(d: &Deployment) -> Self {
        let clusters = d
            .clusters
            .iter()
            .map(|c| {
                let bridge = d.bridge(&c.bridge);
                ClusterStatus {
                    name: c.name.clone(),
                    status: c.status,
                    bridge: c.bridge.clone(),
                    bridge_status: bridge.map(|b| b.status),
                    subnet: bridge.map(|b| b.subnet.to_string()),
                    context: c.handle.as_ref().map(|h| h.context.clone()),
                    message: c.message.clone(),
                }
            })
            .collect();

        let gateway = GatewayStatus {
            container: d.gateway.container.clone(),
            image: d.gateway.image.clone(),
            status: d.gateway.status,
            attachments: d
                .gateway
                .attachments
                .iter()
                .map(|a| AttachmentStatus {
                    bridge: a.bridge.clone(),
                    interface: a.interface.clone(),
                    address: a.address.clone(),
                    status: a.status,
                    routes: a.routes,
                })
                .collect(),
            rules: d
                .gateway
                .rules
                .iter()
                .map(|r| RuleStatus {
                    from: r.from.clone(),
                    to: r.to.clone(),
                    status: r.status,
                    message: r.message.clone(),
                })
                .collect(),
        };

        Self {
            name: d.name.clone(),
            status: d.status,
            message: d.message.clone(),
            clusters,
            gateway,
            failures: d.failures(),
            created_at: d.created_at,
            updated_at: d.updated_at,
        }
    }
}

/// One line of `list`
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentSummary {
    pub name: String,
    pub status: DeploymentState,
    pub clusters: usize,
    pub links: usize,
    pub updated_at: DateTime<Utc>,
}

impl From<&Deployment> for DeploymentSummary {
    fn from(d: &Deployment) -> Self {
        Self {
            name: d.name.clone(),
            status: d.status,
            clusters: d.clusters.len(),
            links: d.gateway.rules.len(),
            updated_at: d.updated_at,
        }
    }
}
