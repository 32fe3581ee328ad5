//! Inter-cluster gateway
//!
//! One container per deployment routes between the cluster bridges and
//! emulates the WAN with `tc` (htb + netem):
//! - Latency and jitter
//! - Packet loss
//! - Bandwidth limiting

mod controller;
mod runtime;
pub mod tc;

pub use controller::GatewayController;
pub use runtime::{find_interface, BridgeAttachment, DockerGateway, GatewayRuntime};

#[cfg(test)]
pub use runtime::MockGatewayRuntime;
