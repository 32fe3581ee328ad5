//! multicluster
//!
//! Brings up a set of KIND clusters, each on its own bridge network, and
//! joins them through a gateway container that emulates the WAN between them.

pub mod api;
pub mod command;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod network;
pub mod orchestrator;
pub mod provisioner;
pub mod registry;
pub mod retry;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::api::AppState;

/// Create the application router with the given state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))
        // Deployments
        .route("/api/deployments", get(api::deploy::list))
        .route("/api/deployments", post(api::deploy::create))
        .route("/api/deployments/:name", delete(api::deploy::destroy))
        .route("/api/deployments/:name/status", get(api::deploy::status))
        // Metrics (Prometheus)
        .route("/metrics", get(api::metrics::metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
