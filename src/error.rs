//! Error types for multicluster operations
//!
//! Every failure the orchestrator can surface maps onto one [`ErrorKind`], so
//! callers (CLI, HTTP API, tests) can match on the category without parsing
//! messages.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::api::response::ApiResponse;

/// Category of a failure, stable across releases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    InvalidTopology,
    BridgeConflict,
    ClusterProvisionFailed,
    GatewayAttachFailed,
    RuleApplyFailed,
    RegistryIoFailed,
    DeploymentConflict,
    NotFound,
    Cancelled,
    Command,
    Internal,
}

/// A sub-resource that failed during an operation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceFailure {
    /// What failed, e.g. `cluster/west` or `link/east->west`
    pub resource: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ResourceFailure {
    pub fn new(resource: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.resource, self.kind, self.message)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("bridge conflict: {0}")]
    BridgeConflict(String),

    #[error("cluster provisioning failed: {0}")]
    ClusterProvisionFailed(String),

    #[error("gateway attach failed: {0}")]
    GatewayAttachFailed(String),

    #[error("rule apply failed: {0}")]
    RuleApplyFailed(String),

    #[error("registry I/O failed: {0}")]
    RegistryIo(#[from] sqlx::Error),

    #[error("deployment conflict: {0}")]
    DeploymentConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// Aggregate failure after rollback, listing every broken sub-resource
    #[error("deployment {deployment} failed ({kind}): {}", format_failures(.failures))]
    ProvisioningFailed {
        deployment: String,
        kind: ErrorKind,
        failures: Vec<ResourceFailure>,
    },
}

fn format_failures(failures: &[ResourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn invalid_topology(msg: impl Into<String>) -> Self {
        Self::InvalidTopology(msg.into())
    }

    pub fn bridge_conflict(msg: impl Into<String>) -> Self {
        Self::BridgeConflict(msg.into())
    }

    pub fn cluster_provision(msg: impl Into<String>) -> Self {
        Self::ClusterProvisionFailed(msg.into())
    }

    pub fn gateway_attach(msg: impl Into<String>) -> Self {
        Self::GatewayAttachFailed(msg.into())
    }

    pub fn rule_apply(msg: impl Into<String>) -> Self {
        Self::RuleApplyFailed(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::DeploymentConflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn command(msg: impl Into<String>) -> Self {
        Self::Command(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::InvalidTopology(_) => ErrorKind::InvalidTopology,
            AppError::BridgeConflict(_) => ErrorKind::BridgeConflict,
            AppError::ClusterProvisionFailed(_) => ErrorKind::ClusterProvisionFailed,
            AppError::GatewayAttachFailed(_) => ErrorKind::GatewayAttachFailed,
            AppError::RuleApplyFailed(_) => ErrorKind::RuleApplyFailed,
            AppError::RegistryIo(_) => ErrorKind::RegistryIoFailed,
            AppError::DeploymentConflict(_) => ErrorKind::DeploymentConflict,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Cancelled(_) => ErrorKind::Cancelled,
            AppError::Command(_) => ErrorKind::Command,
            AppError::Internal(_) => ErrorKind::Internal,
            AppError::ProvisioningFailed { kind, .. } => *kind,
        }
    }

    /// Sub-resource failures carried by an aggregate error
    pub fn failures(&self) -> &[ResourceFailure] {
        match self {
            AppError::ProvisioningFailed { failures, .. } => failures,
            _ => &[],
        }
    }

    fn status_code(&self) -> StatusCode {
        status_for(self.kind())
    }
}

/// HTTP status reported for a failure category
pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidTopology => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::DeploymentConflict | ErrorKind::BridgeConflict => StatusCode::CONFLICT,
        ErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::ClusterProvisionFailed
        | ErrorKind::GatewayAttachFailed
        | ErrorKind::RuleApplyFailed
        | ErrorKind::Command => StatusCode::BAD_GATEWAY,
        ErrorKind::RegistryIoFailed | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.kind().to_string();
        let body = match serde_json::to_value(self.failures()) {
            Ok(details) if !self.failures().is_empty() => {
                ApiResponse::error_with_details(code, self.to_string(), details)
            }
            _ => ApiResponse::error(code, self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
