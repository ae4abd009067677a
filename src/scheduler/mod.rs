//! Stateless placement of jobs onto live machines.

pub mod assigner;
pub mod cluster;

pub use assigner::{place, Decision};
pub use cluster::{ClusterState, MachineLoad};
