use axum::{extract::State, response::IntoResponse};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::api::AppState;
use crate::error::{AppError, AppResult};

/// Install the global Prometheus recorder and describe our metrics
pub fn install_recorder() -> AppResult<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| AppError::internal(format!("failed to install metrics recorder: {}", e)))?;

    describe_counter!(
        "multicluster_deployments_created_total",
        "Deployments that reached Ready or Degraded"
    );
    describe_counter!(
        "multicluster_rollbacks_total",
        "Provisioning attempts rolled back"
    );
    describe_counter!(
        "multicluster_rule_failures_total",
        "Link rules that could not be applied"
    );
    describe_histogram!(
        "multicluster_cluster_create_seconds",
        "Time to create one member cluster"
    );

    Ok(handle)
}

/// Prometheus metrics endpoint
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();

    ([("content-type", "text/plain; version=0.0.4; charset=utf-8")], body)
}
