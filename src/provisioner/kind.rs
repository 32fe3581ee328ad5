//! KIND-backed provisioner
//!
//! Drives the `kind` CLI. The cluster's nodes join the bridge through
//! `KIND_EXPERIMENTAL_DOCKER_NETWORK`, and the API server is probed with
//! `kube` before the cluster is reported as created.

use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::version::Info;
use kube::config::KubeConfigOptions;
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::ClusterProvisioner;
use crate::command::CommandRunner;
use crate::error::{AppError, AppResult};
use crate::models::{ClusterHandle, ClusterSpec};
use crate::retry::{retry_with_backoff, RetryConfig};

const KIND_NETWORK_ENV: &str = "KIND_EXPERIMENTAL_DOCKER_NETWORK";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindCluster {
    kind: &'static str,
    api_version: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    networking: Option<KindNetworking>,
    nodes: Vec<KindNode>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct KindNetworking {
    #[serde(skip_serializing_if = "Option::is_none")]
    pod_subnet: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_subnet: Option<String>,
}

#[derive(Debug, Serialize)]
struct KindNode {
    role: &'static str,
}

/// Render the `kind.x-k8s.io/v1alpha4` cluster config for a cluster spec
pub fn render_kind_config(spec: &ClusterSpec) -> AppResult<String> {
    let networking = if spec.pod_subnet.is_some() || spec.service_subnet.is_some() {
        Some(KindNetworking {
            pod_subnet: spec.pod_subnet.map(|s| s.to_string()),
            service_subnet: spec.service_subnet.map(|s| s.to_string()),
        })
    } else {
        None
    };

    let cluster = KindCluster {
        kind: "Cluster",
        api_version: "kind.x-k8s.io/v1alpha4",
        networking,
        nodes: vec![KindNode {
            role: "control-plane",
        }],
    };

    serde_yaml::to_string(&cluster)
        .map_err(|e| AppError::internal(format!("failed to render kind config: {}", e)))
}

#[derive(Debug, Clone)]
pub struct KindProvisioner {
    kind: CommandRunner,
    readiness: RetryConfig,
}

impl KindProvisioner {
    pub fn new(kind: CommandRunner, readiness_attempts: u32) -> Self {
        Self {
            kind,
            readiness: RetryConfig {
                max_attempts: readiness_attempts.max(1),
                initial_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(2),
                backoff_multiplier: 1.0,
            },
        }
    }

    /// Wait until the API server of the new cluster answers
    #[instrument(skip(self), fields(context = %handle.context))]
    async fn wait_ready(&self, handle: &ClusterHandle) -> AppResult<()> {
        let version = retry_with_backoff(&self.readiness, "api_server_probe", || {
            probe_api_server(&handle.context)
        })
        .await?;
        info!(version = %version, "API server is reachable");
        Ok(())
    }

    async fn delete_by_name(&self, name: &str) -> AppResult<()> {
        self.kind
            .run(&["delete", "cluster", "--name", name])
            .await?
            .into_result("kind delete cluster")
            .map(|_| ())
    }
}

async fn probe_api_server(context: &str) -> AppResult<String> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = kube::Config::from_kubeconfig(&options)
        .await
        .map_err(|e| AppError::cluster_provision(format!("kubeconfig for {}: {}", context, e)))?;
    let client = kube::Client::try_from(config)
        .map_err(|e| AppError::cluster_provision(format!("client for {}: {}", context, e)))?;
    let info: Info = client
        .apiserver_version()
        .await
        .map_err(|e| AppError::cluster_provision(format!("API server of {}: {}", context, e)))?;
    Ok(info.git_version)
}

#[async_trait]
impl ClusterProvisioner for KindProvisioner {
    #[instrument(skip(self, spec))]
    async fn create(
        &self,
        cluster_name: &str,
        bridge: &str,
        spec: &ClusterSpec,
    ) -> AppResult<ClusterHandle> {
        let config = render_kind_config(spec)?;
        let mut args = vec!["create", "cluster", "--name", cluster_name, "--config", "-"];
        if let Some(image) = spec.node_image.as_deref() {
            args.extend(["--image", image]);
        }

        info!("Creating KIND cluster");
        let output = self
            .kind
            .run_with(&args, &[(KIND_NETWORK_ENV, bridge)], Some(&config))
            .await?;

        let handle = self.handle_for(cluster_name);
        if !output.success {
            warn!(stderr = %output.stderr.trim(), "kind create cluster failed, cleaning up");
            if let Err(e) = self.delete_by_name(cluster_name).await {
                warn!(error = %e, "Cleanup after failed create also failed");
            }
            return Err(AppError::cluster_provision(format!(
                "kind create cluster {}: {}",
                cluster_name,
                output.stderr.trim()
            )));
        }

        if let Err(e) = self.wait_ready(&handle).await {
            warn!(error = %e, "Cluster never became ready, cleaning up");
            if let Err(e) = self.delete_by_name(cluster_name).await {
                warn!(error = %e, "Cleanup after readiness failure also failed");
            }
            return Err(AppError::cluster_provision(format!(
                "cluster {} is not ready: {}",
                cluster_name, e
            )));
        }

        info!("KIND cluster created");
        Ok(handle)
    }

    #[instrument(skip(self), fields(cluster = %handle.name))]
    async fn delete(&self, handle: &ClusterHandle) -> AppResult<()> {
        info!("Deleting KIND cluster");
        self.delete_by_name(&handle.name).await
    }

    async fn nodes(&self, handle: &ClusterHandle) -> AppResult<Vec<String>> {
        let stdout = self
            .kind
            .run(&["get", "nodes", "--name", &handle.name])
            .await?
            .into_result("kind get nodes")?;

        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with("No kind nodes"))
            .map(String::from)
            .collect())
    }

    fn handle_for(&self, cluster_name: &str) -> ClusterHandle {
        ClusterHandle {
            name: cluster_name.to_string(),
            context: format!("kind-{}", cluster_name),
        }
    }
}
