use std::time::Duration;

use thiserror::Error;

/// Errors returned by a [`Registry`](crate::registry::Registry) backend.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Compare-and-swap failed on key {key}")]
    Conflict { key: String },

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Registry operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Watch cursor {requested} is older than retained history (oldest {oldest})")]
    CursorCompacted { requested: u64, oldest: u64 },

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode registry value: {0}")]
    Codec(#[from] serde_json::Error),
}

impl RegistryError {
    /// Transient failures are retried with backoff and never surface as
    /// unit-level failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Unavailable(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors returned by a [`UnitManager`](crate::unit::UnitManager) or by the
/// agent's local unit operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnitError {
    #[error("Unit {0} is not loaded")]
    NotLoaded(String),

    #[error("Unit {name} is already loaded with different contents")]
    ContentConflict { name: String },

    #[error("Unit manager failed on {name}: {reason}")]
    Manager { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum FleetError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Unit error: {0}")]
    Unit(#[from] UnitError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid unit file: {0}")]
    InvalidUnitFile(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(RegistryError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(RegistryError::Unavailable("down".into()).is_transient());
        assert!(!RegistryError::Conflict { key: "k".into() }.is_transient());
        assert!(RegistryError::Conflict { key: "k".into() }.is_conflict());
    }
}
