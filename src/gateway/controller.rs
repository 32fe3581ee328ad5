//! Gateway controller
//!
//! Drives the gateway container through its lifecycle: start, attach to
//! every bridge, install inter-cluster routes on the nodes and push the link
//! rules. Every outcome is written into the deployment record as it happens.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use tracing::{debug, info, instrument, warn};

use super::runtime::{BridgeAttachment, GatewayRuntime};
use super::tc;
use crate::error::{AppError, AppResult, ErrorKind, ResourceFailure};
use crate::models::{AttachmentState, BridgeState, GatewayState, RouteState, RuleState, WanParams};
use crate::network::Subnet;
use crate::registry::TrackedDeployment;

/// One rule resolved against the current record
struct RulePlan {
    from: String,
    to: String,
    interface: Option<String>,
    source_index: usize,
    source: Subnet,
    params: WanParams,
}

#[derive(Clone)]
pub struct GatewayController {
    runtime: Arc<dyn GatewayRuntime>,
}

impl GatewayController {
    pub fn new(runtime: Arc<dyn GatewayRuntime>) -> Self {
        Self { runtime }
    }

    /// Start the gateway container. Failure here is fatal for the deployment.
    #[instrument(skip_all, fields(deployment = %deployment))]
    pub async fn start(&self, deployment: &str, tracked: &TrackedDeployment) -> AppResult<()> {
        let (container, image) = tracked
            .read(|d| (d.gateway.container.clone(), d.gateway.image.clone()))
            .await;

        self.runtime.start(deployment, &container, &image).await?;
        tracked
            .update(|d| d.gateway.status = GatewayState::Running)
            .await?;

        info!(container = %container, "Gateway running");
        Ok(())
    }

    /// Attach the gateway to every bridge, in cluster order.
    ///
    /// Attachment failures are recorded and returned; they degrade the
    /// deployment instead of failing it.
    #[instrument(skip_all)]
    pub async fn attach_all(&self, tracked: &TrackedDeployment) -> AppResult<Vec<ResourceFailure>> {
        let (container, bridges) = tracked
            .read(|d| {
                let bridges: Vec<String> = d.clusters.iter().map(|c| c.bridge.clone()).collect();
                (d.gateway.container.clone(), bridges)
            })
            .await;

        let mut failures = Vec::new();
        for bridge in bridges {
            match self.attach(&container, &bridge).await {
                Ok(attachment) => {
                    tracked
                        .update(|d| {
                            if let Some(a) = d.attachment_mut(&bridge) {
                                a.interface = Some(attachment.interface.clone());
                                a.address = Some(attachment.address.clone());
                                a.status = AttachmentState::Attached;
                                a.message = None;
                            }
                            if let Some(b) = d.bridge_mut(&bridge) {
                                b.status = BridgeState::Attached;
                            }
                        })
                        .await?;
                }
                Err(e) => {
                    warn!(bridge = %bridge, error = %e, "Gateway attachment failed");
                    let message = e.to_string();
                    tracked
                        .update(|d| {
                            if let Some(a) = d.attachment_mut(&bridge) {
                                a.status = AttachmentState::Failed;
                                a.message = Some(message.clone());
                            }
                        })
                        .await?;
                    failures.push(ResourceFailure::new(
                        format!("attachment/{}", bridge),
                        ErrorKind::GatewayAttachFailed,
                        message,
                    ));
                }
            }
        }

        Ok(failures)
    }

    async fn attach(&self, container: &str, bridge: &str) -> AppResult<BridgeAttachment> {
        let attachment = self.runtime.connect(container, bridge).await?;
        for command in tc::root_commands(&attachment.interface) {
            self.runtime
                .exec(container, command)
                .await
                .map_err(|e| {
                    AppError::gateway_attach(format!(
                        "root qdisc on {}: {}",
                        attachment.interface, e
                    ))
                })?;
        }
        debug!(bridge = %bridge, interface = %attachment.interface, "Root qdisc installed");
        Ok(attachment)
    }

    /// Route every cluster's nodes to the other clusters through the gateway.
    ///
    /// `nodes` maps a cluster name to its node containers. Route failures
    /// land on the attachment's route state; the attachment itself stays
    /// usable for shaping traffic towards that cluster.
    #[instrument(skip_all)]
    pub async fn install_routes(
        &self,
        tracked: &TrackedDeployment,
        nodes: &HashMap<String, Vec<String>>,
    ) -> AppResult<Vec<ResourceFailure>> {
        // (cluster, bridge, gateway address on that bridge, other subnets)
        let plan: Vec<(String, String, String, Vec<Subnet>)> = tracked
            .read(|d| {
                d.clusters
                    .iter()
                    .filter_map(|c| {
                        let attachment = d.attachment(&c.bridge)?;
                        if attachment.status != AttachmentState::Attached {
                            return None;
                        }
                        let via = attachment.address.clone()?;
                        let others = d
                            .clusters
                            .iter()
                            .filter(|o| o.name != c.name)
                            .filter_map(|o| d.bridge(&o.bridge).map(|b| b.subnet))
                            .collect();
                        Some((c.name.clone(), c.bridge.clone(), via, others))
                    })
                    .collect()
            })
            .await;

        let mut failures = Vec::new();
        for (cluster, bridge, via, others) in plan {
            // Clusters whose nodes could not be listed were already recorded
            let Some(members) = nodes.get(&cluster) else {
                continue;
            };
            let (routes, message) = match self.route_cluster(members, &via, &others).await {
                Ok(()) => {
                    debug!(cluster = %cluster, routes = others.len(), "Routes installed");
                    (RouteState::Installed, None)
                }
                Err(e) => {
                    warn!(cluster = %cluster, error = %e, "Route installation failed");
                    failures.push(ResourceFailure::new(
                        format!("routes/{}", cluster),
                        ErrorKind::GatewayAttachFailed,
                        e.to_string(),
                    ));
                    (RouteState::Failed, Some(e.to_string()))
                }
            };
            tracked
                .update(|d| {
                    if let Some(a) = d.attachment_mut(&bridge) {
                        a.routes = routes;
                        a.routes_message = message;
                    }
                })
                .await?;
        }

        Ok(failures)
    }

    async fn route_cluster(&self, nodes: &[String], via: &str, others: &[Subnet]) -> AppResult<()> {
        for node in nodes {
            for destination in others {
                self.runtime
                    .exec(node, tc::route_command(destination, via))
                    .await
                    .map_err(|e| {
                        AppError::gateway_attach(format!(
                            "route {} via {} on {}: {}",
                            destination, via, node, e
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Apply every link rule concurrently.
    ///
    /// Each rule only touches its own class on the destination interface, so
    /// one failing rule never blocks another. Failed rules are returned.
    #[instrument(skip_all)]
    pub async fn apply_rules(&self, tracked: &TrackedDeployment) -> AppResult<Vec<ResourceFailure>> {
        let (container, plans) = tracked.read(|d| (d.gateway.container.clone(), plan_rules(d))).await;

        let outcomes = join_all(plans.iter().map(|plan| self.apply_rule(&container, plan))).await;

        let mut failures = Vec::new();
        for (plan, outcome) in plans.iter().zip(outcomes) {
            let pair = format!("{}->{}", plan.from, plan.to);
            let (status, message) = match outcome {
                Ok(()) => {
                    debug!(link = %pair, "Link rule applied");
                    (RuleState::Applied, None)
                }
                Err(e) => {
                    warn!(link = %pair, error = %e, "Link rule failed");
                    counter!("multicluster_rule_failures_total", 1);
                    failures.push(ResourceFailure::new(
                        format!("link/{}", pair),
                        ErrorKind::RuleApplyFailed,
                        e.to_string(),
                    ));
                    (RuleState::Failed, Some(e.to_string()))
                }
            };
            tracked
                .update(|d| {
                    if let Some(rule) = d.rule_mut(&plan.from, &plan.to) {
                        rule.status = status;
                        rule.message = message;
                    }
                })
                .await?;
        }

        info!(
            applied = plans.len() - failures.len(),
            failed = failures.len(),
            "Link rules processed"
        );
        Ok(failures)
    }

    async fn apply_rule(&self, container: &str, plan: &RulePlan) -> AppResult<()> {
        let interface = plan.interface.as_deref().ok_or_else(|| {
            AppError::rule_apply(format!("gateway is not attached to the bridge of {}", plan.to))
        })?;

        for command in tc::shaping_commands(interface, plan.source_index, &plan.source, &plan.params) {
            self.runtime
                .exec(container, command)
                .await
                .map_err(|e| AppError::rule_apply(e.to_string()))?;
        }
        Ok(())
    }

    /// Remove the gateway container
    #[instrument(skip_all, fields(container = %container))]
    pub async fn teardown(&self, container: &str) -> AppResult<()> {
        self.runtime.remove(container).await
    }
}

fn plan_rules(d: &crate::models::Deployment) -> Vec<RulePlan> {
    d.gateway
        .rules
        .iter()
        .filter_map(|rule| {
            let source_index = d.clusters.iter().position(|c| c.name == rule.from)?;
            let source = d.bridge_of(&rule.from)?.subnet;
            let interface = d
                .bridge_of(&rule.to)
                .and_then(|b| d.attachment(&b.name))
                .filter(|a| a.status == AttachmentState::Attached)
                .and_then(|a| a.interface.clone());
            Some(RulePlan {
                from: rule.from.clone(),
                to: rule.to.clone(),
                interface,
                source_index,
                source,
                params: rule.params,
            })
        })
        .collect()
}
