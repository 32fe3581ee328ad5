//! Container runtime operations the gateway controller needs

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, instrument, warn};

use crate::command::CommandRunner;
use crate::error::{AppError, AppResult};
use crate::network::DEPLOYMENT_LABEL;

/// Where the gateway sits on one bridge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeAttachment {
    /// Interface name inside the gateway container
    pub interface: String,
    /// Gateway IPv4 address on the bridge
    pub address: String,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait GatewayRuntime: Send + Sync {
    /// Start the gateway container; succeeds if it is already running
    async fn start(&self, deployment: &str, container: &str, image: &str) -> AppResult<()>;

    /// Attach a running container to a bridge; succeeds if already attached
    async fn connect(&self, container: &str, bridge: &str) -> AppResult<BridgeAttachment>;

    /// Run a command inside a container
    async fn exec(&self, container: &str, command: Vec<String>) -> AppResult<()>;

    /// Remove the container; succeeds if it does not exist
    async fn remove(&self, container: &str) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct DockerGateway {
    docker: CommandRunner,
}

impl DockerGateway {
    pub fn new(docker: CommandRunner) -> Self {
        Self { docker }
    }

    async fn is_running(&self, container: &str) -> AppResult<Option<bool>> {
        let output = self
            .docker
            .run(&["inspect", "--format", "{{.State.Running}}", container])
            .await?;
        if output.success {
            Ok(Some(output.stdout.trim() == "true"))
        } else if output.stderr.to_lowercase().contains("no such") {
            Ok(None)
        } else {
            Err(AppError::command(format!(
                "docker inspect {}: {}",
                container,
                output.stderr.trim()
            )))
        }
    }

    async fn address_on(&self, container: &str, bridge: &str) -> AppResult<String> {
        let format = format!(
            "{{{{with index .NetworkSettings.Networks \"{}\"}}}}{{{{.IPAddress}}}}{{{{end}}}}",
            bridge
        );
        let address = self
            .docker
            .run(&["inspect", "--format", &format, container])
            .await?
            .into_result("docker inspect")?;
        let address = address.trim().to_string();
        if address.is_empty() {
            return Err(AppError::gateway_attach(format!(
                "{} has no address on {}",
                container, bridge
            )));
        }
        Ok(address)
    }

    async fn interface_with(&self, container: &str, address: &str) -> AppResult<String> {
        let listing = self
            .docker
            .run(&["exec", container, "ip", "-o", "-4", "addr", "show"])
            .await?
            .into_result("ip addr show")?;
        find_interface(&listing, address).ok_or_else(|| {
            AppError::gateway_attach(format!(
                "no interface in {} carries {}",
                container, address
            ))
        })
    }
}

/// Find the interface holding `address` in `ip -o -4 addr show` output
pub fn find_interface(listing: &str, address: &str) -> Option<String> {
    let needle = format!("{}/", address);
    listing.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let _index = fields.next()?;
        let interface = fields.next()?;
        let carries = fields
            .skip_while(|f| *f != "inet")
            .nth(1)
            .map(|cidr| cidr.starts_with(&needle))
            .unwrap_or(false);
        carries.then(|| interface.split('@').next().unwrap_or(interface).to_string())
    })
}

#[async_trait]
impl GatewayRuntime for DockerGateway {
    #[instrument(skip(self))]
    async fn start(&self, deployment: &str, container: &str, image: &str) -> AppResult<()> {
        match self.is_running(container).await? {
            Some(true) => {
                info!("Gateway container already running");
                return Ok(());
            }
            Some(false) => {
                self.docker
                    .run(&["start", container])
                    .await?
                    .into_result("docker start")?;
                info!("Gateway container restarted");
                return Ok(());
            }
            None => {}
        }

        let label = format!("{}={}", DEPLOYMENT_LABEL, deployment);
        self.docker
            .run(&[
                "run",
                "--detach",
                "--name",
                container,
                "--hostname",
                container,
                "--privileged",
                "--cap-add",
                "NET_ADMIN",
                "--sysctl",
                "net.ipv4.ip_forward=1",
                "--label",
                &label,
                image,
            ])
            .await?
            .into_result("docker run")
            .map_err(|e| AppError::gateway_attach(format!("failed to start {}: {}", container, e)))?;

        info!("Gateway container started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn connect(&self, container: &str, bridge: &str) -> AppResult<BridgeAttachment> {
        let output = self
            .docker
            .run(&["network", "connect", bridge, container])
            .await?;
        if !output.success && !output.stderr.contains("already exists") {
            return Err(AppError::gateway_attach(format!(
                "docker network connect {} {}: {}",
                bridge,
                container,
                output.stderr.trim()
            )));
        }

        let address = self.address_on(container, bridge).await?;
        let interface = self.interface_with(container, &address).await?;
        info!(interface = %interface, address = %address, "Gateway attached to bridge");

        Ok(BridgeAttachment { interface, address })
    }

    async fn exec(&self, container: &str, command: Vec<String>) -> AppResult<()> {
        let mut args = vec!["exec", container];
        args.extend(command.iter().map(String::as_str));
        self.docker
            .run(&args)
            .await?
            .into_result(&command.join(" "))
            .map(|_| ())
    }

    #[instrument(skip(self))]
    async fn remove(&self, container: &str) -> AppResult<()> {
        let output = self.docker.run(&["rm", "--force", container]).await?;
        if !output.success && !output.stderr.to_lowercase().contains("no such") {
            warn!(stderr = %output.stderr.trim(), "Failed to remove gateway container");
            return Err(AppError::command(format!(
                "docker rm {}: {}",
                container,
                output.stderr.trim()
            )));
        }
        info!("Gateway container removed");
        Ok(())
    }
}
