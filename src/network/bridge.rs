//! Bridge networks that each member cluster attaches to

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use super::subnet::Subnet;
use crate::command::CommandRunner;
use crate::error::{AppError, AppResult};

/// Label put on every bridge so stray networks can be traced back
pub const DEPLOYMENT_LABEL: &str = "multicluster.deployment";

/// Lifecycle of the isolated bridge network behind one cluster.
///
/// Implementations must be idempotent: creating an existing bridge with the
/// same subnet succeeds, with a different subnet it is a `BridgeConflict`;
/// removing an absent bridge succeeds.
#[async_trait]
pub trait BridgeManager: Send + Sync {
    async fn create_bridge(&self, deployment: &str, name: &str, subnet: &Subnet) -> AppResult<()>;

    async fn remove_bridge(&self, name: &str) -> AppResult<()>;

    async fn bridge_exists(&self, name: &str) -> AppResult<bool>;

    /// Subnet of an existing bridge, `None` when absent
    async fn bridge_subnet(&self, name: &str) -> AppResult<Option<Subnet>>;
}

/// Docker-backed bridge manager
#[derive(Debug, Clone)]
pub struct DockerBridgeManager {
    docker: CommandRunner,
}

impl DockerBridgeManager {
    pub fn new(docker: CommandRunner) -> Self {
        Self { docker }
    }
}

/// Parse the first IPv4 subnet out of `docker network inspect` IPAM output
fn parse_inspect_subnets(stdout: &str) -> AppResult<Option<Subnet>> {
    stdout
        .split_whitespace()
        .find(|s| s.contains('.') && s.contains('/'))
        .map(str::parse)
        .transpose()
}

#[async_trait]
impl BridgeManager for DockerBridgeManager {
    #[instrument(skip(self), fields(subnet = %subnet))]
    async fn create_bridge(&self, deployment: &str, name: &str, subnet: &Subnet) -> AppResult<()> {
        if let Some(existing) = self.bridge_subnet(name).await? {
            if existing == *subnet {
                info!("Bridge already exists with matching subnet");
                return Ok(());
            }
            return Err(AppError::bridge_conflict(format!(
                "bridge {} exists with subnet {}, wanted {}",
                name, existing, subnet
            )));
        }

        let subnet_arg = subnet.to_string();
        let label = format!("{}={}", DEPLOYMENT_LABEL, deployment);
        let output = self
            .docker
            .run(&[
                "network",
                "create",
                "--driver",
                "bridge",
                "--subnet",
                &subnet_arg,
                "--label",
                &label,
                name,
            ])
            .await?;

        if !output.success {
            // Docker refuses overlapping pools with this message
            if output.stderr.contains("Pool overlaps") {
                return Err(AppError::bridge_conflict(format!(
                    "subnet {} of bridge {} overlaps an existing network",
                    subnet, name
                )));
            }
            return Err(AppError::command(format!(
                "docker network create {}: {}",
                name,
                output.stderr.trim()
            )));
        }

        info!("Bridge created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn remove_bridge(&self, name: &str) -> AppResult<()> {
        if !self.bridge_exists(name).await? {
            return Ok(());
        }

        let output = self.docker.run(&["network", "rm", name]).await?;
        if !output.success {
            warn!(stderr = %output.stderr.trim(), "Failed to remove bridge");
            return Err(AppError::command(format!(
                "docker network rm {}: {}",
                name,
                output.stderr.trim()
            )));
        }
        info!("Bridge removed");
        Ok(())
    }

    async fn bridge_exists(&self, name: &str) -> AppResult<bool> {
        Ok(self.bridge_subnet_raw(name).await?.is_some())
    }

    async fn bridge_subnet(&self, name: &str) -> AppResult<Option<Subnet>> {
        match self.bridge_subnet_raw(name).await? {
            Some(stdout) => parse_inspect_subnets(&stdout),
            None => Ok(None),
        }
    }
}

impl DockerBridgeManager {
    /// Raw IPAM listing of a network, `None` when it does not exist
    async fn bridge_subnet_raw(&self, name: &str) -> AppResult<Option<String>> {
        let output = self
            .docker
            .run(&[
                "network",
                "inspect",
                "--format",
                "{{range .IPAM.Config}}{{.Subnet}} {{end}}",
                name,
            ])
            .await?;

        if output.success {
            Ok(Some(output.stdout))
        } else if output.stderr.to_lowercase().contains("not found") {
            Ok(None)
        } else {
            Err(AppError::command(format!(
                "docker network inspect {}: {}",
                name,
                output.stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_inspect_subnets() {
        let subnet = parse_inspect_subnets("172.30.0.0/24 fc00:f853::/64 \n").unwrap();
        assert_eq!(subnet, Some("172.30.0.0/24".parse().unwrap()));

        let ipv6_first = parse_inspect_subnets("fc00:f853::/64 172.30.1.0/24").unwrap();
        assert_eq!(ipv6_first, Some("172.30.1.0/24".parse().unwrap()));

        assert_eq!(parse_inspect_subnets("\n").unwrap(), None);
    }

    /// Stand-in for the docker CLI keeping networks as files under `dir`.
    /// Subnets listed in `dir/taken` are refused like overlapping pools.
    fn fake_docker(dir: &std::path::Path) -> DockerBridgeManager {
        use std::os::unix::fs::PermissionsExt;

        let root = dir.display();
        let script = format!(
            r#"#!/bin/sh
echo "$*" >> {root}/calls
case "$2" in
  inspect)
    if [ -f {root}/nets/$5 ]; then cat {root}/nets/$5; exit 0; fi
    echo "Error response from daemon: network $5 not found" >&2
    exit 1 ;;
  create)
    if grep -qx "$6" {root}/taken 2>/dev/null; then
      echo "Error response from daemon: Pool overlaps with other one on this address space" >&2
      exit 1
    fi
    mkdir -p {root}/nets
    echo "$6 " > {root}/nets/$9 ;;
  rm)
    rm {root}/nets/$3 ;;
esac
"#
        );
        let path = dir.join("docker");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        DockerBridgeManager::new(CommandRunner::new(
            path.display().to_string(),
            std::time::Duration::from_secs(10),
        ))
    }

    fn calls(dir: &std::path::Path, verb: &str) -> Vec<String> {
        std::fs::read_to_string(dir.join("calls"))
            .unwrap_or_default()
            .lines()
            .filter(|l| l.starts_with(&format!("network {}", verb)))
            .map(str::to_string)
            .collect()
    }

    #[tokio::test]
    async fn test_create_bridge_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let bridges = fake_docker(dir.path());
        let subnet: Subnet = "172.30.0.0/24".parse().unwrap();

        bridges.create_bridge("demo", "demo-east", &subnet).await.unwrap();
        assert_eq!(
            calls(dir.path(), "create"),
            vec!["network create --driver bridge --subnet 172.30.0.0/24 --label multicluster.deployment=demo demo-east"]
        );
        assert_eq!(bridges.bridge_subnet("demo-east").await.unwrap(), Some(subnet));

        // Same subnet again is a no-op
        bridges.create_bridge("demo", "demo-east", &subnet).await.unwrap();
        assert_eq!(calls(dir.path(), "create").len(), 1);

        let other: Subnet = "172.30.1.0/24".parse().unwrap();
        let err = bridges
            .create_bridge("demo", "demo-east", &other)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BridgeConflict);
        assert_eq!(calls(dir.path(), "create").len(), 1);
    }

    #[tokio::test]
    async fn test_create_bridge_on_overlapping_pool() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("taken"), "172.30.5.0/24\n").unwrap();
        let bridges = fake_docker(dir.path());
        let subnet: Subnet = "172.30.5.0/24".parse().unwrap();

        let err = bridges
            .create_bridge("demo", "demo-west", &subnet)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::BridgeConflict);
        assert!(err.to_string().contains("overlaps"));
        assert!(!bridges.bridge_exists("demo-west").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_bridge() {
        let dir = tempfile::tempdir().unwrap();
        let bridges = fake_docker(dir.path());

        // Absent bridges are already removed
        bridges.remove_bridge("demo-east").await.unwrap();
        assert!(calls(dir.path(), "rm").is_empty());

        let subnet: Subnet = "172.30.0.0/24".parse().unwrap();
        bridges.create_bridge("demo", "demo-east", &subnet).await.unwrap();
        assert!(bridges.bridge_exists("demo-east").await.unwrap());

        bridges.remove_bridge("demo-east").await.unwrap();
        assert_eq!(calls(dir.path(), "rm"), vec!["network rm demo-east"]);
        assert!(!bridges.bridge_exists("demo-east").await.unwrap());
    }
}
