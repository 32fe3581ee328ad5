//! Topology description: the raw configuration and the validated graph

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::network::Subnet;

/// Longest name Docker and KIND accept for a network/cluster
const MAX_NAME_LEN: usize = 63;
const MAX_LATENCY_MS: i64 = 60_000;

/// Topology as written in the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopologyConfig {
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
}

/// One cluster entry in the configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    pub name: String,
    /// Subnet of the cluster's bridge network (allocated when absent)
    #[serde(default)]
    pub node_subnet: Option<String>,
    #[serde(default)]
    pub pod_subnet: Option<String>,
    #[serde(default)]
    pub service_subnet: Option<String>,
    /// kindest/node image override
    #[serde(default)]
    pub node_image: Option<String>,
}

/// WAN characteristics of traffic flowing `from` one cluster `to` another
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub latency_ms: i64,
    #[serde(default)]
    pub jitter_ms: i64,
    #[serde(default)]
    pub bandwidth_kbps: Option<i64>,
    #[serde(default)]
    pub loss_pct: f64,
}

impl TopologyConfig {
    /// Parse a YAML (or JSON) topology
    pub fn from_yaml(contents: &str) -> AppResult<Self> {
        serde_yaml::from_str(contents)
            .map_err(|e| AppError::invalid_topology(format!("failed to parse topology: {}", e)))
    }

    pub async fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            AppError::invalid_topology(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&contents)
    }
}

/// Validated WAN parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct WanParams {
    pub latency_ms: u32,
    pub jitter_ms: u32,
    pub bandwidth_kbps: Option<u32>,
    pub loss_pct: f64,
}

impl WanParams {
    fn from_link(link: &LinkConfig) -> AppResult<Self> {
        let pair = format!("{}->{}", link.from, link.to);

        if !(0..=MAX_LATENCY_MS).contains(&link.latency_ms) {
            return Err(AppError::invalid_topology(format!(
                "link {}: latency {}ms is outside 0..={}",
                pair, link.latency_ms, MAX_LATENCY_MS
            )));
        }
        if link.jitter_ms < 0 || link.jitter_ms > link.latency_ms {
            return Err(AppError::invalid_topology(format!(
                "link {}: jitter {}ms must be between 0 and the latency",
                pair, link.jitter_ms
            )));
        }
        if !link.loss_pct.is_finite() || !(0.0..=100.0).contains(&link.loss_pct) {
            return Err(AppError::invalid_topology(format!(
                "link {}: loss {}% is outside 0..=100",
                pair, link.loss_pct
            )));
        }
        let bandwidth_kbps = match link.bandwidth_kbps {
            None => None,
            Some(bw) if bw > 0 && bw <= u32::MAX as i64 => Some(bw as u32),
            Some(bw) => {
                return Err(AppError::invalid_topology(format!(
                    "link {}: bandwidth {}kbps must be positive",
                    pair, bw
                )))
            }
        };

        Ok(Self {
            latency_ms: link.latency_ms as u32,
            jitter_ms: link.jitter_ms as u32,
            bandwidth_kbps,
            loss_pct: link.loss_pct,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSpec {
    pub name: String,
    pub node_subnet: Option<Subnet>,
    pub pod_subnet: Option<Subnet>,
    pub service_subnet: Option<Subnet>,
    pub node_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LinkRule {
    pub from: String,
    pub to: String,
    pub params: WanParams,
}

impl LinkRule {
    pub fn pair(&self) -> String {
        format!("{}->{}", self.from, self.to)
    }
}

/// A fully validated deployment graph. Only [`Topology::validate`] builds one.
#[derive(Debug, Clone, PartialEq)]
pub struct Topology {
    name: String,
    clusters: Vec<ClusterSpec>,
    links: Vec<LinkRule>,
}

impl Topology {
    /// Validate a raw configuration into a deployment graph
    pub fn validate(name: &str, config: &TopologyConfig) -> AppResult<Self> {
        validate_name("deployment", name)?;

        if config.clusters.is_empty() {
            return Err(AppError::invalid_topology(format!(
                "deployment {} has no clusters",
                name
            )));
        }

        let mut seen = HashSet::new();
        let mut clusters = Vec::with_capacity(config.clusters.len());
        for cluster in &config.clusters {
            validate_name("cluster", &cluster.name)?;
            if !seen.insert(cluster.name.as_str()) {
                return Err(AppError::invalid_topology(format!(
                    "duplicate cluster name: {}",
                    cluster.name
                )));
            }
            let qualified = format!("{}-{}", name, cluster.name);
            if qualified.len() > MAX_NAME_LEN {
                return Err(AppError::invalid_topology(format!(
                    "{} is longer than {} characters",
                    qualified, MAX_NAME_LEN
                )));
            }

            clusters.push(ClusterSpec {
                name: cluster.name.clone(),
                node_subnet: parse_subnet(&cluster.node_subnet)?,
                pod_subnet: parse_subnet(&cluster.pod_subnet)?,
                service_subnet: parse_subnet(&cluster.service_subnet)?,
                node_image: cluster.node_image.clone(),
            });
        }

        let explicit: Vec<(&str, Subnet)> = clusters
            .iter()
            .filter_map(|c| c.node_subnet.map(|s| (c.name.as_str(), s)))
            .collect();
        for (i, (a_name, a)) in explicit.iter().enumerate() {
            for (b_name, b) in &explicit[i + 1..] {
                if a.overlaps(b) {
                    return Err(AppError::invalid_topology(format!(
                        "node subnets of {} ({}) and {} ({}) overlap",
                        a_name, a, b_name, b
                    )));
                }
            }
        }

        let mut pairs = HashSet::new();
        let mut links = Vec::with_capacity(config.links.len());
        for link in &config.links {
            for end in [&link.from, &link.to] {
                if !seen.contains(end.as_str()) {
                    return Err(AppError::invalid_topology(format!(
                        "link {}->{} references unknown cluster {}",
                        link.from, link.to, end
                    )));
                }
            }
            if link.from == link.to {
                return Err(AppError::invalid_topology(format!(
                    "link {}->{} loops back to its source",
                    link.from, link.to
                )));
            }
            if !pairs.insert((link.from.as_str(), link.to.as_str())) {
                return Err(AppError::invalid_topology(format!(
                    "duplicate link {}->{}",
                    link.from, link.to
                )));
            }
            links.push(LinkRule {
                from: link.from.clone(),
                to: link.to.clone(),
                params: WanParams::from_link(link)?,
            });
        }

        Ok(Self {
            name: name.to_string(),
            clusters,
            links,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clusters(&self) -> &[ClusterSpec] {
        &self.clusters
    }

    pub fn links(&self) -> &[LinkRule] {
        &self.links
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterSpec> {
        self.clusters.iter().find(|c| c.name == name)
    }

    /// Bridge name for a cluster, unique across deployments
    pub fn bridge_name(&self, cluster: &str) -> String {
        bridge_name(&self.name, cluster)
    }
}

pub fn bridge_name(deployment: &str, cluster: &str) -> String {
    format!("{}-{}", deployment, cluster)
}

fn parse_subnet(value: &Option<String>) -> AppResult<Option<Subnet>> {
    value.as_deref().map(str::parse).transpose()
}

fn validate_name(what: &str, name: &str) -> AppResult<()> {
    if name.is_empty() {
        return Err(AppError::invalid_topology(format!("{} name is empty", what)));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid_chars || name.starts_with('-') || name.ends_with('-') || name.len() > MAX_NAME_LEN {
        return Err(AppError::invalid_topology(format!(
            "{} name '{}' must be a lower-case DNS label",
            what, name
        )));
    }
    Ok(())
}
