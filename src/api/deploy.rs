use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::api::response::{ApiResponse, ResponseMeta};
use crate::api::AppState;
use crate::error::{AppError, AppResult};
use crate::models::TopologyConfig;
use crate::orchestrator::{CreateOutcome, DeploymentStatusReport, DeploymentSummary};

/// Body of `POST /api/deployments`
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub name: String,
    pub topology: TopologyConfig,
}

#[derive(Debug, Serialize)]
pub struct CreateDeploymentResponse {
    pub name: String,
    #[serde(flatten)]
    pub outcome: CreateOutcome,
}

#[derive(Debug, Serialize)]
pub struct DestroyDeploymentResponse {
    pub name: String,
    pub destroyed: bool,
}

/// Create (or converge) a deployment
///
/// POST /api/deployments
pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateDeploymentRequest>,
) -> AppResult<Json<ApiResponse<CreateDeploymentResponse>>> {
    let CreateDeploymentRequest { name, topology } = request;
    info!(deployment = %name, "Create requested");

    // Run detached so a dropped connection cannot abandon a half-built deployment
    let orchestrator = state.orchestrator.clone();
    let cancel = state.shutdown.child_token();
    let target = name.clone();
    let outcome = tokio::spawn(async move {
        orchestrator
            .create_deployment_with_cancel(&target, &topology, cancel)
            .await
    })
    .await
    .map_err(|e| AppError::internal(format!("create task failed: {}", e)))??;

    Ok(Json(ApiResponse::success(CreateDeploymentResponse {
        name,
        outcome,
    })))
}

/// Tear a deployment down
///
/// DELETE /api/deployments/:name
pub async fn destroy(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<DestroyDeploymentResponse>>> {
    info!(deployment = %name, "Destroy requested");

    let orchestrator = state.orchestrator.clone();
    let target = name.clone();
    tokio::spawn(async move { orchestrator.destroy_deployment(&target).await })
        .await
        .map_err(|e| AppError::internal(format!("destroy task failed: {}", e)))??;

    Ok(Json(ApiResponse::success(DestroyDeploymentResponse {
        name,
        destroyed: true,
    })))
}

/// GET /api/deployments/:name/status
pub async fn status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<ApiResponse<DeploymentStatusReport>>> {
    let report = state.orchestrator.status_of(&name).await?;
    Ok(Json(ApiResponse::success(report)))
}

/// GET /api/deployments
pub async fn list(
    State(state): State<AppState>,
) -> AppResult<Json<ApiResponse<Vec<DeploymentSummary>>>> {
    let deployments = state.orchestrator.list_deployments().await?;
    let meta = ResponseMeta {
        total: Some(deployments.len() as u64),
    };
    Ok(Json(ApiResponse::success_with_meta(deployments, meta)))
}
