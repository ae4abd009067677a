pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod job;
pub mod machine;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod timer;
pub mod unit;

pub use error::{FleetError, Result};
