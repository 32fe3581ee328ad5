pub mod deploy;
pub mod health;
pub mod metrics;
pub mod response;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::orchestrator::Orchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: Config,
    /// Renders `/metrics`; absent when no recorder is installed
    pub metrics: Option<PrometheusHandle>,
    /// Cancelled on shutdown so in-flight creates roll back
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: Config) -> Self {
        Self {
            orchestrator,
            config,
            metrics: None,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }
}
