use axum::{extract::State, Json};
use serde::Serialize;
use tracing::warn;

use crate::api::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the deployment registry answers
    pub registry: bool,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let registry = match sqlx::query("SELECT 1")
        .execute(state.orchestrator.registry().pool())
        .await
    {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "Registry health probe failed");
            false
        }
    };

    Json(HealthResponse {
        status: if registry { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        registry,
    })
}
