use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use multicluster::{
    api::{metrics::install_recorder, AppState},
    command::CommandRunner,
    config::Config,
    create_router,
    gateway::DockerGateway,
    models::TopologyConfig,
    network::DockerBridgeManager,
    orchestrator::{CreateOutcome, Orchestrator, OrchestratorConfig},
    provisioner::KindProvisioner,
    registry::Registry,
};

/// Timeout of a single docker invocation
const DOCKER_TIMEOUT: Duration = Duration::from_secs(120);
/// Timeout of a single kind invocation; cluster creation pulls node images
const KIND_TIMEOUT: Duration = Duration::from_secs(900);

#[derive(Parser)]
#[command(
    name = "multicluster",
    version,
    about = "Multi-cluster KIND deployments joined by a WAN-emulating gateway"
)]
struct Cli {
    /// Log as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Registry location, overrides MULTICLUSTER_DATABASE_URL
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a deployment (or converge an existing one)
    Create {
        /// Deployment name
        #[arg(long, default_value = "kind")]
        name: String,
        /// Topology file
        #[arg(long, default_value = "./config.yml")]
        config: PathBuf,
        /// Gateway image, overrides MULTICLUSTER_WANEM_IMAGE
        /// (default electrocucaracha/wanem)
        #[arg(long)]
        wanem: Option<String>,
    },
    /// Destroy a deployment
    Destroy {
        #[arg(long, default_value = "kind")]
        name: String,
    },
    /// Show the status of a deployment
    Status {
        #[arg(long, default_value = "kind")]
        name: String,
    },
    /// List deployments
    List,
    /// Serve the HTTP API
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_tracing(json: bool) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(|| tracing_subscriber::fmt::layer()))
        .init();
}

fn build_orchestrator(config: &Config, registry: Registry) -> Result<Orchestrator> {
    let docker = CommandRunner::new(&config.docker_bin, DOCKER_TIMEOUT);
    let kind = CommandRunner::new(&config.kind_bin, KIND_TIMEOUT);

    Ok(Orchestrator::new(
        registry,
        Arc::new(KindProvisioner::new(kind, config.readiness_attempts)),
        Arc::new(DockerBridgeManager::new(docker.clone())),
        Arc::new(DockerGateway::new(docker)),
        OrchestratorConfig::from_config(config)?,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Token cancelled on Ctrl-C
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = Config::load()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }

    let registry = Registry::open(&config.database_url)
        .await
        .with_context(|| format!("failed to open registry at {}", config.database_url))?;
    tracing::debug!(database_url = %config.database_url, "Registry ready");

    match cli.command {
        Command::Create {
            name,
            config: path,
            wanem,
        } => {
            if let Some(image) = wanem {
                config.wanem_image = image;
            }
            let orchestrator = build_orchestrator(&config, registry)?;
            let topology = TopologyConfig::from_file(&path).await?;

            let outcome = orchestrator
                .create_deployment_with_cancel(&name, &topology, cancel_on_ctrl_c())
                .await?;
            match &outcome {
                CreateOutcome::Ready => tracing::info!(deployment = %name, "Deployment ready"),
                CreateOutcome::AlreadyReady => {
                    tracing::info!(deployment = %name, "Deployment was already ready")
                }
                CreateOutcome::Degraded { failures } => {
                    for failure in failures {
                        tracing::warn!(deployment = %name, "{}", failure);
                    }
                }
            }
            print_json(&outcome)?;
        }
        Command::Destroy { name } => {
            let orchestrator = build_orchestrator(&config, registry)?;
            orchestrator.destroy_deployment(&name).await?;
            tracing::info!(deployment = %name, "Deployment destroyed");
        }
        Command::Status { name } => {
            let orchestrator = build_orchestrator(&config, registry)?;
            print_json(&orchestrator.status_of(&name).await?)?;
        }
        Command::List => {
            let orchestrator = build_orchestrator(&config, registry)?;
            print_json(&orchestrator.list_deployments().await?)?;
        }
        Command::Serve { port } => {
            if let Some(port) = port {
                config.port = port;
            }
            let orchestrator = build_orchestrator(&config, registry)?;
            let shutdown = CancellationToken::new();
            let state = AppState::new(orchestrator, config.clone())
                .with_metrics(install_recorder()?)
                .with_shutdown(shutdown.clone());

            let app = create_router(state);
            let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
            tracing::info!("Listening on {}", addr);

            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("Shutting down, cancelling in-flight creates");
                    }
                    shutdown.cancel();
                })
                .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wanem_is_unset_by_default() {
        let cli = Cli::try_parse_from(["multicluster", "create"]).unwrap();
        match cli.command {
            Command::Create { name, wanem, .. } => {
                assert_eq!(name, "kind");
                assert_eq!(wanem, None);
            }
            _ => panic!("expected create"),
        }
    }

    #[test]
    fn test_wanem_flag_is_taken() {
        let cli =
            Cli::try_parse_from(["multicluster", "create", "--wanem", "example/wanem:1"]).unwrap();
        match cli.command {
            Command::Create { wanem, .. } => assert_eq!(wanem.as_deref(), Some("example/wanem:1")),
            _ => panic!("expected create"),
        }
    }
}
