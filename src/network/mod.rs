//! Network module for multicluster
//!
//! Bridge networks hosting each cluster, and the subnets they are built on.

mod bridge;
mod subnet;

pub use bridge::{BridgeManager, DockerBridgeManager, DEPLOYMENT_LABEL};
pub use subnet::{Subnet, SubnetAllocator};
