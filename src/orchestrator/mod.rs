//! Multi-cluster orchestrator
//!
//! Sequences bridge creation, cluster creation, gateway attachment and rule
//! application for a deployment, keeps the registry record current after
//! every step and rolls everything back when a cluster cannot be created.
//!
//! State machine:
//! `Pending -> Provisioning -> {Ready | Degraded} -> Destroying -> Destroyed`,
//! with `Failed` reached from `Provisioning` (after an automatic rollback).

mod report;
mod teardown;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::join_all;
use metrics::{counter, histogram};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use report::{
    AttachmentStatus, ClusterStatus, CreateOutcome, DeploymentStatusReport, DeploymentSummary,
    GatewayStatus, RuleStatus,
};

use crate::config::Config;
use crate::error::{AppError, AppResult, ErrorKind, ResourceFailure};
use crate::gateway::{GatewayController, GatewayRuntime};
use crate::models::{
    gateway_container_name, AttachmentState, BridgeState, ClusterHandle, ClusterSpec,
    ClusterState, Deployment, DeploymentState, RouteState, RuleState, Topology,
    TopologyConfig,
};
use crate::network::{BridgeManager, Subnet, SubnetAllocator};
use crate::provisioner::ClusterProvisioner;
use crate::registry::{Registry, TrackedDeployment};
use crate::retry::{retry_with_backoff, retry_with_backoff_if, RetryConfig};

/// Tunables of the orchestrator
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Clusters created in parallel
    pub worker_limit: usize,
    /// Backoff at the bridge and cluster adapter boundary
    pub retry: RetryConfig,
    pub subnet_pool: Subnet,
    pub gateway_image: String,
}

impl OrchestratorConfig {
    pub fn from_config(config: &Config) -> AppResult<Self> {
        Ok(Self {
            worker_limit: config.worker_limit.max(1),
            retry: config.retry(),
            subnet_pool: config.subnet_pool.parse()?,
            gateway_image: config.wanem_image.clone(),
        })
    }
}

/// Why provisioning has to be rolled back
struct Abort {
    kind: ErrorKind,
    failures: Vec<ResourceFailure>,
}

impl Abort {
    fn from_error(resource: impl Into<String>, e: AppError) -> Self {
        let kind = e.kind();
        Self {
            kind,
            failures: vec![ResourceFailure::new(resource, kind, e.to_string())],
        }
    }

    fn cancelled(step: &str) -> Self {
        Self::from_error("deployment", AppError::cancelled(format!("cancelled before {}", step)))
    }
}

impl From<AppError> for Abort {
    fn from(e: AppError) -> Self {
        Self::from_error("deployment", e)
    }
}

fn ensure_running(cancel: &CancellationToken, step: &str) -> Result<(), Abort> {
    if cancel.is_cancelled() {
        warn!(step = step, "Cancellation observed");
        Err(Abort::cancelled(step))
    } else {
        Ok(())
    }
}

/// Releases a name claimed by [`Orchestrator::claim`]
struct InFlight {
    names: Arc<Mutex<HashSet<String>>>,
    name: String,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.names
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.name);
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: Registry,
    provisioner: Arc<dyn ClusterProvisioner>,
    bridges: Arc<dyn BridgeManager>,
    gateway: GatewayController,
    config: OrchestratorConfig,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(
        registry: Registry,
        provisioner: Arc<dyn ClusterProvisioner>,
        bridges: Arc<dyn BridgeManager>,
        gateway: Arc<dyn GatewayRuntime>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            registry,
            provisioner,
            bridges,
            gateway: GatewayController::new(gateway),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Only one operation per deployment name runs at a time in this process
    fn claim(&self, name: &str) -> AppResult<InFlight> {
        let mut names = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !names.insert(name.to_string()) {
            return Err(AppError::conflict(format!(
                "deployment {} has an operation in progress",
                name
            )));
        }
        Ok(InFlight {
            names: self.in_flight.clone(),
            name: name.to_string(),
        })
    }

    pub async fn create_deployment(
        &self,
        name: &str,
        config: &TopologyConfig,
    ) -> AppResult<CreateOutcome> {
        self.create_deployment_with_cancel(name, config, CancellationToken::new())
            .await
    }

    /// Bring a deployment up, or converge an existing one.
    ///
    /// Cancelling `cancel` is observed between steps and rolls the
    /// deployment back exactly like a failed cluster would.
    #[instrument(skip(self, config, cancel), fields(deployment = %name))]
    pub async fn create_deployment_with_cancel(
        &self,
        name: &str,
        config: &TopologyConfig,
        cancel: CancellationToken,
    ) -> AppResult<CreateOutcome> {
        let topology = Topology::validate(name, config)?;
        let _claim = self.claim(name)?;

        if let Some(existing) = self.registry.load(name).await? {
            let status = existing.status;
            match status {
                _ if status.is_in_flight() => {
                    return Err(AppError::conflict(format!(
                        "deployment {} is {}",
                        name, status
                    )));
                }
                DeploymentState::Ready | DeploymentState::Degraded
                    if existing.topology != *config =>
                {
                    return Err(AppError::conflict(format!(
                        "deployment {} already exists with a different topology",
                        name
                    )));
                }
                DeploymentState::Ready => {
                    info!("Deployment already ready");
                    return Ok(CreateOutcome::AlreadyReady);
                }
                DeploymentState::Degraded => {
                    return self.reconverge(existing, &cancel).await;
                }
                // Failed and Destroyed records are inert
                _ => {
                    if existing.has_live_resources() {
                        info!("Cleaning up resources left by an earlier attempt");
                        let tracked = TrackedDeployment::new(existing, self.registry.clone());
                        let leftovers = self.teardown(&tracked).await;
                        if !leftovers.is_empty() {
                            return Err(AppError::ProvisioningFailed {
                                deployment: name.to_string(),
                                kind: ErrorKind::DeploymentConflict,
                                failures: leftovers,
                            });
                        }
                    }
                }
            }
        }

        // Another process may be creating the same deployment
        let claimed = self
            .registry
            .claim(
                name,
                config,
                &gateway_container_name(name),
                &self.config.gateway_image,
            )
            .await?;
        if !claimed {
            return Err(AppError::conflict(format!(
                "deployment {} is being created elsewhere",
                name
            )));
        }

        let subnets = match self.reserve_subnets(&topology).await {
            Ok(subnets) => subnets,
            Err(e) => {
                self.abandon(name).await;
                return Err(e);
            }
        };
        let record = Deployment::new(&topology, config, &subnets, &self.config.gateway_image);
        if let Err(e) = self.registry.save(&record).await {
            self.abandon(name).await;
            return Err(e);
        }

        let tracked = TrackedDeployment::new(record, self.registry.clone());
        tracked
            .update(|d| d.set_status(DeploymentState::Provisioning))
            .await?;
        info!(
            clusters = topology.clusters().len(),
            links = topology.links().len(),
            "Provisioning deployment"
        );

        let result = self.provision(&tracked, &topology, &cancel).await;
        self.finish(&tracked, result).await
    }

    /// Re-run gateway configuration of a Degraded deployment
    async fn reconverge(
        &self,
        existing: Deployment,
        cancel: &CancellationToken,
    ) -> AppResult<CreateOutcome> {
        info!("Re-converging degraded deployment");
        let tracked = TrackedDeployment::new(existing, self.registry.clone());
        tracked
            .update(|d| {
                d.set_status(DeploymentState::Provisioning);
                d.message = None;
                for a in d.gateway.attachments.iter_mut() {
                    if a.status == AttachmentState::Failed {
                        a.status = AttachmentState::Pending;
                        a.message = None;
                    }
                    a.routes = RouteState::Pending;
                    a.routes_message = None;
                }
                for r in d.gateway.rules.iter_mut() {
                    r.status = RuleState::Pending;
                    r.message = None;
                }
            })
            .await?;

        let result = self.configure_gateway(&tracked, cancel).await;
        self.finish(&tracked, result).await
    }

    async fn provision(
        &self,
        tracked: &TrackedDeployment,
        topology: &Topology,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceFailure>, Abort> {
        self.create_clusters(tracked, topology, cancel).await?;
        self.configure_gateway(tracked, cancel).await
    }

    /// Create every bridge and cluster, at most `worker_limit` at a time.
    /// Returns only once every cluster task has finished.
    async fn create_clusters(
        &self,
        tracked: &TrackedDeployment,
        topology: &Topology,
        cancel: &CancellationToken,
    ) -> Result<(), Abort> {
        let semaphore = Semaphore::new(self.config.worker_limit.max(1));
        let semaphore = &semaphore;

        let results = join_all(topology.clusters().iter().map(|spec| async move {
            let _permit = semaphore.acquire().await.map_err(|e| {
                ResourceFailure::new(
                    format!("cluster/{}", spec.name),
                    ErrorKind::Internal,
                    e.to_string(),
                )
            })?;
            self.create_cluster(tracked, topology.name(), spec, cancel)
                .await
        }))
        .await;

        let failures: Vec<ResourceFailure> = results.into_iter().filter_map(Result::err).collect();

        if cancel.is_cancelled() {
            let mut abort = Abort::cancelled("gateway configuration");
            abort
                .failures
                .extend(failures.into_iter().filter(|f| f.kind != ErrorKind::Cancelled));
            return Err(abort);
        }
        if let Some(first) = failures.first() {
            return Err(Abort {
                kind: first.kind,
                failures,
            });
        }
        Ok(())
    }

    #[instrument(skip(self, tracked, spec, cancel), fields(cluster = %spec.name))]
    async fn create_cluster(
        &self,
        tracked: &TrackedDeployment,
        deployment: &str,
        spec: &ClusterSpec,
        cancel: &CancellationToken,
    ) -> Result<(), ResourceFailure> {
        let cluster = spec.name.clone();
        let cluster_resource = format!("cluster/{}", cluster);
        let (bridge, subnet) = tracked
            .read(|d| {
                d.cluster(&cluster)
                    .and_then(|c| d.bridge(&c.bridge))
                    .map(|b| (b.name.clone(), b.subnet))
            })
            .await
            .ok_or_else(|| {
                ResourceFailure::new(&cluster_resource, ErrorKind::Internal, "no bridge recorded")
            })?;
        let bridge_resource = format!("bridge/{}", bridge);

        if cancel.is_cancelled() {
            return Err(ResourceFailure::new(
                &cluster_resource,
                ErrorKind::Cancelled,
                "cancelled before bridge creation",
            ));
        }

        retry_with_backoff_if(
            &self.config.retry,
            "create_bridge",
            || self.bridges.create_bridge(deployment, &bridge, &subnet),
            |e: &AppError| e.kind() != ErrorKind::BridgeConflict,
        )
        .await
        .map_err(|e| {
            warn!(bridge = %bridge, error = %e, "Bridge creation failed");
            ResourceFailure::new(&bridge_resource, e.kind(), e.to_string())
        })?;
        record(tracked, &bridge_resource, |d| {
            if let Some(b) = d.bridge_mut(&bridge) {
                b.status = BridgeState::Created;
            }
        })
        .await?;

        if cancel.is_cancelled() {
            return Err(ResourceFailure::new(
                &cluster_resource,
                ErrorKind::Cancelled,
                "cancelled before cluster creation",
            ));
        }

        record(tracked, &cluster_resource, |d| {
            if let Some(c) = d.cluster_mut(&cluster) {
                c.status = ClusterState::Creating;
                c.message = None;
            }
        })
        .await?;

        // KIND clusters are named after their bridge
        let started = Instant::now();
        let created = retry_with_backoff(&self.config.retry, "create_cluster", || {
            self.provisioner.create(&bridge, &bridge, spec)
        })
        .await;

        match created {
            Ok(handle) => {
                histogram!(
                    "multicluster_cluster_create_seconds",
                    started.elapsed().as_secs_f64()
                );
                info!(context = %handle.context, "Cluster created");
                record(tracked, &cluster_resource, |d| {
                    if let Some(c) = d.cluster_mut(&cluster) {
                        c.status = ClusterState::Created;
                        c.handle = Some(handle);
                    }
                })
                .await
            }
            Err(e) => {
                warn!(error = %e, "Cluster creation failed");
                let message = e.to_string();
                record(tracked, &cluster_resource, |d| {
                    if let Some(c) = d.cluster_mut(&cluster) {
                        c.status = ClusterState::Failed;
                        c.message = Some(message.clone());
                    }
                })
                .await?;
                Err(ResourceFailure::new(cluster_resource, e.kind(), message))
            }
        }
    }

    /// Start the gateway, attach it, install routes and apply rules.
    /// Only a gateway that cannot start aborts; the rest degrades.
    async fn configure_gateway(
        &self,
        tracked: &TrackedDeployment,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceFailure>, Abort> {
        let (deployment, container) = tracked
            .read(|d| (d.name.clone(), d.gateway.container.clone()))
            .await;

        ensure_running(cancel, "gateway start")?;
        self.gateway
            .start(&deployment, tracked)
            .await
            .map_err(|e| Abort::from_error(format!("gateway/{}", container), e))?;

        let mut failures = self.gateway.attach_all(tracked).await?;

        ensure_running(cancel, "route installation")?;
        let nodes = self.collect_nodes(tracked, &mut failures).await?;
        failures.extend(self.gateway.install_routes(tracked, &nodes).await?);

        ensure_running(cancel, "rule application")?;
        failures.extend(self.gateway.apply_rules(tracked).await?);

        Ok(failures)
    }

    /// Node containers per cluster. A cluster whose nodes cannot be listed
    /// is left out and gets its routes marked failed.
    async fn collect_nodes(
        &self,
        tracked: &TrackedDeployment,
        failures: &mut Vec<ResourceFailure>,
    ) -> AppResult<HashMap<String, Vec<String>>> {
        let clusters: Vec<(String, String, Option<ClusterHandle>)> = tracked
            .read(|d| {
                d.clusters
                    .iter()
                    .map(|c| (c.name.clone(), c.bridge.clone(), c.handle.clone()))
                    .collect()
            })
            .await;

        let mut nodes = HashMap::new();
        for (cluster, bridge, handle) in clusters {
            let Some(handle) = handle else { continue };
            match self.provisioner.nodes(&handle).await {
                Ok(list) => {
                    debug!(cluster = %cluster, nodes = list.len(), "Listed cluster nodes");
                    nodes.insert(cluster, list);
                }
                Err(e) => {
                    warn!(cluster = %cluster, error = %e, "Failed to list cluster nodes");
                    let message = e.to_string();
                    tracked
                        .update(|d| {
                            if let Some(a) = d.attachment_mut(&bridge) {
                                a.routes = RouteState::Failed;
                                a.routes_message = Some(message.clone());
                            }
                        })
                        .await?;
                    failures.push(ResourceFailure::new(
                        format!("routes/{}", cluster),
                        ErrorKind::GatewayAttachFailed,
                        message,
                    ));
                }
            }
        }
        Ok(nodes)
    }

    /// Settle the final state, rolling back when provisioning aborted
    async fn finish(
        &self,
        tracked: &TrackedDeployment,
        result: Result<Vec<ResourceFailure>, Abort>,
    ) -> AppResult<CreateOutcome> {
        let failures = match result {
            Ok(failures) => failures,
            Err(abort) => return self.rollback(tracked, abort).await,
        };

        match tracked.read(|d| d.converged_state()).await {
            DeploymentState::Ready => {
                tracked
                    .update(|d| {
                        d.set_status(DeploymentState::Ready);
                        d.message = None;
                    })
                    .await?;
                counter!("multicluster_deployments_created_total", 1, "outcome" => "ready");
                info!("Deployment ready");
                Ok(CreateOutcome::Ready)
            }
            DeploymentState::Degraded => {
                let failures = if failures.is_empty() {
                    tracked.read(|d| d.failures()).await
                } else {
                    failures
                };
                let message = format!("{} sub-resources failed", failures.len());
                tracked
                    .update(|d| {
                        d.set_status(DeploymentState::Degraded);
                        d.message = Some(message);
                    })
                    .await?;
                counter!("multicluster_deployments_created_total", 1, "outcome" => "degraded");
                warn!(failures = failures.len(), "Deployment degraded");
                Ok(CreateOutcome::Degraded { failures })
            }
            _ => {
                let failures = tracked.read(|d| d.failures()).await;
                let kind = failures
                    .first()
                    .map(|f| f.kind)
                    .unwrap_or(ErrorKind::ClusterProvisionFailed);
                self.rollback(tracked, Abort { kind, failures }).await
            }
        }
    }

    async fn rollback(&self, tracked: &TrackedDeployment, abort: Abort) -> AppResult<CreateOutcome> {
        let name = tracked.read(|d| d.name.clone()).await;
        warn!(
            kind = %abort.kind,
            failures = abort.failures.len(),
            "Provisioning failed, rolling back"
        );
        counter!("multicluster_rollbacks_total", 1);

        let summary = abort
            .failures
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        if let Err(e) = tracked
            .update(|d| {
                d.set_status(DeploymentState::Failed);
                d.message = Some(summary);
            })
            .await
        {
            warn!(error = %e, "Failed to record Failed state before rollback");
        }

        let leftovers = self.teardown(tracked).await;
        if leftovers.is_empty() {
            info!("Rollback complete");
        } else {
            warn!(leftovers = leftovers.len(), "Rollback left resources behind");
        }

        Err(AppError::ProvisioningFailed {
            deployment: name,
            kind: abort.kind,
            failures: abort.failures,
        })
    }

    /// Tear a deployment down and forget it.
    ///
    /// Every step is best-effort. When something could not be removed the
    /// record is kept as Destroyed so a later destroy or create retries it.
    #[instrument(skip(self), fields(deployment = %name))]
    pub async fn destroy_deployment(&self, name: &str) -> AppResult<()> {
        let _claim = self.claim(name)?;
        let record = self
            .registry
            .load(name)
            .await?
            .ok_or_else(|| AppError::not_found(format!("deployment {}", name)))?;

        let tracked = TrackedDeployment::new(record, self.registry.clone());
        tracked
            .update(|d| d.set_status(DeploymentState::Destroying))
            .await?;
        info!("Destroying deployment");

        let leftovers = self.teardown(&tracked).await;
        if leftovers.is_empty() {
            self.registry.delete(name).await?;
            info!("Deployment destroyed");
        } else {
            let message = format!(
                "left behind: {}",
                leftovers
                    .iter()
                    .map(|f| f.resource.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            tracked
                .update(|d| {
                    d.set_status(DeploymentState::Destroyed);
                    d.message = Some(message);
                })
                .await?;
            warn!(leftovers = leftovers.len(), "Deployment destroyed with leftovers");
        }
        Ok(())
    }

    pub async fn status_of(&self, name: &str) -> AppResult<DeploymentStatusReport> {
        self.registry
            .load(name)
            .await?
            .map(|d| DeploymentStatusReport::from(&d))
            .ok_or_else(|| AppError::not_found(format!("deployment {}", name)))
    }

    pub async fn list_deployments(&self) -> AppResult<Vec<DeploymentSummary>> {
        let deployments = self.registry.list().await?;
        Ok(deployments.iter().map(DeploymentSummary::from).collect())
    }

    /// Pick and reserve a bridge subnet for every cluster, in topology order.
    ///
    /// Explicit subnets must not overlap anything another deployment holds.
    /// Allocated subnets skip held blocks; losing a reservation race moves on
    /// to the next block.
    async fn reserve_subnets(&self, topology: &Topology) -> AppResult<Vec<Subnet>> {
        let name = topology.name();
        // Reservations of an earlier attempt under this name are stale
        self.registry.release_subnets(name).await?;
        let held = self.registry.reservations().await?;

        let mut allocator = SubnetAllocator::new(self.config.subnet_pool);
        for reservation in &held {
            allocator.reserve(reservation.subnet);
        }
        for cluster in topology.clusters() {
            let Some(subnet) = cluster.node_subnet else { continue };
            if let Some(r) = held.iter().find(|r| r.subnet.overlaps(&subnet)) {
                return Err(AppError::bridge_conflict(format!(
                    "node subnet {} of {} overlaps {} held by {}/{}",
                    subnet, cluster.name, r.subnet, r.deployment, r.cluster
                )));
            }
            allocator.reserve(subnet);
        }

        let mut subnets = Vec::with_capacity(topology.clusters().len());
        for cluster in topology.clusters() {
            match self.reserve_one(name, cluster, &mut allocator).await {
                Ok(subnet) => {
                    debug!(cluster = %cluster.name, subnet = %subnet, "Subnet reserved");
                    subnets.push(subnet);
                }
                Err(e) => {
                    self.release_best_effort(name).await;
                    return Err(e);
                }
            }
        }
        Ok(subnets)
    }

    async fn reserve_one(
        &self,
        deployment: &str,
        cluster: &ClusterSpec,
        allocator: &mut SubnetAllocator,
    ) -> AppResult<Subnet> {
        if let Some(subnet) = cluster.node_subnet {
            if self
                .registry
                .reserve_subnet(deployment, &cluster.name, &subnet)
                .await?
            {
                return Ok(subnet);
            }
            return Err(AppError::bridge_conflict(format!(
                "node subnet {} of {} is already reserved",
                subnet, cluster.name
            )));
        }

        loop {
            let candidate = allocator.allocate()?;
            if self
                .registry
                .reserve_subnet(deployment, &cluster.name, &candidate)
                .await?
            {
                return Ok(candidate);
            }
            debug!(subnet = %candidate, "Subnet reserved concurrently, trying the next block");
        }
    }

    /// Drop a claim that never got as far as creating anything
    async fn abandon(&self, deployment: &str) {
        if let Err(e) = self.registry.delete(deployment).await {
            warn!(error = %e, "Failed to drop the deployment claim");
        }
    }

    async fn release_best_effort(&self, deployment: &str) {
        if let Err(e) = self.registry.release_subnets(deployment).await {
            warn!(error = %e, "Failed to release subnet reservations");
        }
    }
}

/// Apply a change to the record, reporting a registry failure against `resource`
async fn record<F>(tracked: &TrackedDeployment, resource: &str, f: F) -> Result<(), ResourceFailure>
where
    F: FnOnce(&mut Deployment),
{
    tracked
        .update(f)
        .await
        .map_err(|e| ResourceFailure::new(resource, e.kind(), e.to_string()))
}
