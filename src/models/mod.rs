pub mod deployment;
pub mod topology;

pub use deployment::*;
pub use topology::*;
