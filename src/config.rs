use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::retry::RetryConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_port")]
    pub port: u16,

    /// Location of the deployment registry
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Image used for the routing/WAN-emulation gateway container
    #[serde(default = "default_wanem_image")]
    pub wanem_image: String,

    /// Maximum number of clusters created in parallel
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,

    /// Pool that bridge subnets are carved from when a cluster has none
    #[serde(default = "default_subnet_pool")]
    pub subnet_pool: String,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// API server probes after `kind create cluster` returns
    #[serde(default = "default_readiness_attempts")]
    pub readiness_attempts: u32,

    #[serde(default = "default_docker_bin")]
    pub docker_bin: String,

    #[serde(default = "default_kind_bin")]
    pub kind_bin: String,
}

fn default_port() -> u16 {
    8080
}

fn default_database_url() -> String {
    "sqlite://multicluster.db".to_string()
}

fn default_wanem_image() -> String {
    "electrocucaracha/wanem".to_string()
}

fn default_worker_limit() -> usize {
    4
}

fn default_subnet_pool() -> String {
    "172.30.0.0/16".to_string()
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_initial_delay_ms() -> u64 {
    500
}

fn default_readiness_attempts() -> u32 {
    30
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

fn default_kind_bin() -> String {
    "kind".to_string()
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("MULTICLUSTER"))
            .build()?;

        let settings: Config = config.try_deserialize()?;

        Ok(settings)
    }

    /// Bounded backoff used at the bridge and cluster adapter boundary
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_attempts.max(1),
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            ..RetryConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            database_url: default_database_url(),
            wanem_image: default_wanem_image(),
            worker_limit: default_worker_limit(),
            subnet_pool: default_subnet_pool(),
            retry_attempts: default_retry_attempts(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            readiness_attempts: default_readiness_attempts(),
            docker_bin: default_docker_bin(),
            kind_bin: default_kind_bin(),
        }
    }
}
