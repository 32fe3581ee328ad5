//! In-memory stand-ins for docker and kind, shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use multicluster::error::{AppError, AppResult};
use multicluster::gateway::{BridgeAttachment, GatewayRuntime};
use multicluster::models::{ClusterHandle, ClusterSpec, TopologyConfig};
use multicluster::network::{BridgeManager, Subnet};
use multicluster::orchestrator::{Orchestrator, OrchestratorConfig};
use multicluster::provisioner::ClusterProvisioner;
use multicluster::registry::Registry;
use multicluster::retry::RetryConfig;

#[derive(Default)]
struct WorldState {
    events: Vec<String>,
    bridges: HashMap<String, Subnet>,
    clusters: HashSet<String>,
    /// container -> bridges it is connected to, in connection order
    containers: HashMap<String, Vec<String>>,
    fail_clusters: HashSet<String>,
    fail_exec: Vec<String>,
    fail_gateway_start: bool,
    cluster_delay: Duration,
    creating: usize,
    max_creating: usize,
}

/// Shared fake host: records every call and the resources that exist
#[derive(Clone, Default)]
pub struct World {
    state: Arc<Mutex<WorldState>>,
}

impl World {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut WorldState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    fn log(&self, event: String) {
        self.with(|s| s.events.push(event));
    }

    pub fn events(&self) -> Vec<String> {
        self.with(|s| s.events.clone())
    }

    pub fn clear_events(&self) {
        self.with(|s| s.events.clear());
    }

    pub fn fail_cluster(&self, instance: &str) {
        self.with(|s| s.fail_clusters.insert(instance.to_string()));
    }

    pub fn heal_cluster(&self, instance: &str) {
        self.with(|s| s.fail_clusters.remove(instance));
    }

    /// Fail every exec whose `target command...` line contains `pattern`
    pub fn fail_exec(&self, pattern: &str) {
        self.with(|s| s.fail_exec.push(pattern.to_string()));
    }

    pub fn heal_exec(&self) {
        self.with(|s| s.fail_exec.clear());
    }

    pub fn fail_gateway_start(&self) {
        self.with(|s| s.fail_gateway_start = true);
    }

    pub fn slow_clusters(&self, delay: Duration) {
        self.with(|s| s.cluster_delay = delay);
    }

    /// Bridge that exists without any orchestrator having created it
    pub fn add_bridge(&self, name: &str, subnet: &str) {
        let subnet: Subnet = subnet.parse().unwrap();
        self.with(|s| s.bridges.insert(name.to_string(), subnet));
    }

    pub fn add_cluster(&self, name: &str) {
        self.with(|s| s.clusters.insert(name.to_string()));
    }

    /// Highest number of cluster creates that ever ran at once
    pub fn max_concurrent_creates(&self) -> usize {
        self.with(|s| s.max_creating)
    }

    pub fn bridges(&self) -> HashMap<String, Subnet> {
        self.with(|s| s.bridges.clone())
    }

    pub fn clusters(&self) -> HashSet<String> {
        self.with(|s| s.clusters.clone())
    }

    pub fn containers(&self) -> Vec<String> {
        self.with(|s| s.containers.keys().cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.with(|s| s.bridges.is_empty() && s.clusters.is_empty() && s.containers.is_empty())
    }
}

pub struct FakeProvisioner(pub World);

#[async_trait]
impl ClusterProvisioner for FakeProvisioner {
    async fn create(
        &self,
        cluster_name: &str,
        bridge: &str,
        _spec: &ClusterSpec,
    ) -> AppResult<ClusterHandle> {
        let world = &self.0;
        world.log(format!("cluster.create {}", cluster_name));

        let delay = world.with(|s| {
            s.creating += 1;
            s.max_creating = s.max_creating.max(s.creating);
            s.cluster_delay
        });
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        world.with(|s| {
            s.creating -= 1;
            if s.fail_clusters.contains(cluster_name) {
                return Err(AppError::cluster_provision(format!(
                    "kind create cluster {}: node container exited",
                    cluster_name
                )));
            }
            if !s.bridges.contains_key(bridge) {
                return Err(AppError::cluster_provision(format!("network {} not found", bridge)));
            }
            s.clusters.insert(cluster_name.to_string());
            Ok(())
        })?;

        Ok(self.handle_for(cluster_name))
    }

    async fn delete(&self, handle: &ClusterHandle) -> AppResult<()> {
        self.0.log(format!("cluster.delete {}", handle.name));
        self.0.with(|s| s.clusters.remove(&handle.name));
        Ok(())
    }

    async fn nodes(&self, handle: &ClusterHandle) -> AppResult<Vec<String>> {
        Ok(vec![format!("{}-control-plane", handle.name)])
    }

    fn handle_for(&self, cluster_name: &str) -> ClusterHandle {
        ClusterHandle {
            name: cluster_name.to_string(),
            context: format!("kind-{}", cluster_name),
        }
    }
}

pub struct FakeBridges(pub World);

#[async_trait]
impl BridgeManager for FakeBridges {
    async fn create_bridge(&self, _deployment: &str, name: &str, subnet: &Subnet) -> AppResult<()> {
        self.0.log(format!("bridge.create {} {}", name, subnet));
        self.0.with(|s| match s.bridges.get(name) {
            Some(existing) if existing != subnet => Err(AppError::bridge_conflict(format!(
                "{} exists with subnet {}",
                name, existing
            ))),
            _ => {
                s.bridges.insert(name.to_string(), *subnet);
                Ok(())
            }
        })
    }

    async fn remove_bridge(&self, name: &str) -> AppResult<()> {
        self.0.log(format!("bridge.remove {}", name));
        self.0.with(|s| s.bridges.remove(name));
        Ok(())
    }

    async fn bridge_exists(&self, name: &str) -> AppResult<bool> {
        Ok(self.0.with(|s| s.bridges.contains_key(name)))
    }

    async fn bridge_subnet(&self, name: &str) -> AppResult<Option<Subnet>> {
        Ok(self.0.with(|s| s.bridges.get(name).copied()))
    }
}

pub struct FakeGateway(pub World);

#[async_trait]
impl GatewayRuntime for FakeGateway {
    async fn start(&self, _deployment: &str, container: &str, _image: &str) -> AppResult<()> {
        self.0.log(format!("gateway.start {}", container));
        self.0.with(|s| {
            if s.fail_gateway_start {
                return Err(AppError::gateway_attach("image pull failed"));
            }
            s.containers.entry(container.to_string()).or_default();
            Ok(())
        })
    }

    async fn connect(&self, container: &str, bridge: &str) -> AppResult<BridgeAttachment> {
        self.0.log(format!("gateway.connect {}", bridge));
        self.0.with(|s| {
            let subnet = *s
                .bridges
                .get(bridge)
                .ok_or_else(|| AppError::gateway_attach(format!("network {} not found", bridge)))?;
            let connected = s
                .containers
                .get_mut(container)
                .ok_or_else(|| AppError::gateway_attach(format!("{} is not running", container)))?;
            if !connected.iter().any(|b| b == bridge) {
                connected.push(bridge.to_string());
            }
            let position = connected.iter().position(|b| b == bridge).unwrap_or(0);
            let address = Ipv4Addr::from(u32::from(subnet.network()) + 2);
            Ok(BridgeAttachment {
                interface: format!("eth{}", position + 1),
                address: address.to_string(),
            })
        })
    }

    async fn exec(&self, container: &str, command: Vec<String>) -> AppResult<()> {
        let line = format!("{} {}", container, command.join(" "));
        self.0.log(format!("exec {}", line));
        self.0.with(|s| {
            if s.fail_exec.iter().any(|p| line.contains(p.as_str())) {
                Err(AppError::command(format!("{}: RTNETLINK answers: Invalid argument", line)))
            } else {
                Ok(())
            }
        })
    }

    async fn remove(&self, container: &str) -> AppResult<()> {
        self.0.log(format!("gateway.remove {}", container));
        self.0.with(|s| s.containers.remove(container));
        Ok(())
    }
}

pub fn settings() -> OrchestratorConfig {
    OrchestratorConfig {
        worker_limit: 4,
        retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        },
        subnet_pool: "172.30.0.0/16".parse().unwrap(),
        gateway_image: "electrocucaracha/wanem".to_string(),
    }
}

pub fn orchestrator_with(registry: Registry, world: &World) -> Orchestrator {
    orchestrator_with_settings(registry, world, settings())
}

pub fn orchestrator_with_settings(
    registry: Registry,
    world: &World,
    settings: OrchestratorConfig,
) -> Orchestrator {
    Orchestrator::new(
        registry,
        Arc::new(FakeProvisioner(world.clone())),
        Arc::new(FakeBridges(world.clone())),
        Arc::new(FakeGateway(world.clone())),
        settings,
    )
}

pub async fn setup() -> (Orchestrator, World) {
    let registry = Registry::open("sqlite::memory:").await.unwrap();
    let world = World::new();
    (orchestrator_with(registry, &world), world)
}

pub fn topology(yaml: &str) -> TopologyConfig {
    TopologyConfig::from_yaml(yaml).unwrap()
}

/// east and west, 100ms and 1% loss from east to west
pub const DEMO: &str = r#"
clusters:
  - name: east
  - name: west
links:
  - from: east
    to: west
    latencyMs: 100
    lossPct: 1
"#;
