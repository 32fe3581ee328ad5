//! Tests for data models
//!
//! These tests verify topology parsing and validation.

use multicluster::error::ErrorKind;
use multicluster::models::{Topology, TopologyConfig};

const FULL: &str = r#"
clusters:
  - name: east
    nodeSubnet: 172.40.1.0/24
    podSubnet: 10.244.0.0/16
    serviceSubnet: 10.96.0.0/16
  - name: west
    nodeImage: kindest/node:v1.28.0
links:
  - from: east
    to: west
    latencyMs: 120
    jitterMs: 10
    bandwidthKbps: 10240
    lossPct: 0.5
  - from: west
    to: east
    latencyMs: 80
"#;

fn invalid(yaml: &str) -> String {
    let config = TopologyConfig::from_yaml(yaml).unwrap();
    let err = Topology::validate("demo", &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTopology);
    err.to_string()
}

#[test]
fn test_parse_full_topology() {
    let config = TopologyConfig::from_yaml(FULL).unwrap();
    assert_eq!(config.clusters.len(), 2);
    assert_eq!(config.clusters[0].node_subnet.as_deref(), Some("172.40.1.0/24"));
    assert_eq!(config.clusters[1].node_image.as_deref(), Some("kindest/node:v1.28.0"));

    let topology = Topology::validate("demo", &config).unwrap();
    assert_eq!(topology.name(), "demo");
    assert_eq!(topology.clusters().len(), 2);
    assert_eq!(
        topology.clusters()[0].node_subnet.map(|s| s.to_string()),
        Some("172.40.1.0/24".to_string())
    );

    let east_west = &topology.links()[0];
    assert_eq!(east_west.pair(), "east->west");
    assert_eq!(east_west.params.latency_ms, 120);
    assert_eq!(east_west.params.jitter_ms, 10);
    assert_eq!(east_west.params.bandwidth_kbps, Some(10240));
    assert_eq!(east_west.params.loss_pct, 0.5);

    // Links are directional
    let west_east = &topology.links()[1];
    assert_eq!(west_east.pair(), "west->east");
    assert_eq!(west_east.params.bandwidth_kbps, None);
}

#[test]
fn test_json_topology() {
    let config = TopologyConfig::from_yaml(
        r#"{"clusters": [{"name": "solo"}], "links": []}"#,
    )
    .unwrap();
    let topology = Topology::validate("single", &config).unwrap();
    assert_eq!(topology.clusters().len(), 1);
    assert!(topology.links().is_empty());
}

#[test]
fn test_malformed_yaml() {
    let err = TopologyConfig::from_yaml("clusters: [name: : ]]").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTopology);
}

#[test]
fn test_rejects_empty_topology() {
    let msg = invalid("clusters: []");
    assert!(msg.contains("no clusters"));
}

#[test]
fn test_rejects_duplicate_cluster() {
    let msg = invalid("clusters:\n  - name: east\n  - name: east\n");
    assert!(msg.contains("duplicate cluster"));
}

#[test]
fn test_rejects_unknown_link_endpoint() {
    let msg = invalid(
        "clusters:\n  - name: east\nlinks:\n  - from: east\n    to: mars\n    latencyMs: 5\n",
    );
    assert!(msg.contains("mars"));
}

#[test]
fn test_rejects_self_link() {
    invalid("clusters:\n  - name: east\nlinks:\n  - from: east\n    to: east\n");
}

#[test]
fn test_rejects_duplicate_link() {
    invalid(
        r#"
clusters:
  - name: east
  - name: west
links:
  - from: east
    to: west
    latencyMs: 10
  - from: east
    to: west
    latencyMs: 20
"#,
    );
}

#[test]
fn test_rejects_out_of_range_parameters() {
    let base = "clusters:\n  - name: a\n  - name: b\nlinks:\n  - from: a\n    to: b\n";
    for link in [
        "    latencyMs: -1\n",
        "    latencyMs: 10\n    jitterMs: 20\n",
        "    lossPct: 101\n",
        "    lossPct: -0.5\n",
        "    bandwidthKbps: 0\n",
    ] {
        invalid(&format!("{}{}", base, link));
    }
}

#[test]
fn test_rejects_overlapping_explicit_subnets() {
    let msg = invalid(
        r#"
clusters:
  - name: east
    nodeSubnet: 172.40.0.0/16
  - name: west
    nodeSubnet: 172.40.8.0/24
"#,
    );
    assert!(msg.contains("overlap"));
}

#[test]
fn test_rejects_bad_names() {
    invalid("clusters:\n  - name: East_1\n");
    invalid("clusters:\n  - name: ''\n");

    let config = TopologyConfig::from_yaml("clusters:\n  - name: east\n").unwrap();
    let err = Topology::validate("Bad Name", &config).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTopology);

    let long = "x".repeat(60);
    let err = Topology::validate(&long, &config).unwrap_err();
    assert!(err.to_string().contains("longer than"));
}

#[test]
fn test_rejects_bad_subnet() {
    invalid("clusters:\n  - name: east\n    nodeSubnet: 300.1.0.0/24\n");
    invalid("clusters:\n  - name: east\n    nodeSubnet: 10.0.0.0/40\n");
}

#[tokio::test]
async fn test_topology_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yml");
    tokio::fs::write(&path, FULL).await.unwrap();

    let config = TopologyConfig::from_file(&path).await.unwrap();
    assert_eq!(config, TopologyConfig::from_yaml(FULL).unwrap());

    let err = TopologyConfig::from_file(dir.path().join("missing.yml"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTopology);
    assert!(err.to_string().contains("missing.yml"));
}
