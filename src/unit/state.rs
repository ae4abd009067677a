use serde::{Deserialize, Serialize};

use crate::job::JobState;
use crate::unit::UnitHash;

/// Execution state of a unit as observed on one machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Inactive,
    Loading,
    Loaded,
    Launching,
    Launched,
    Unloading,
}

impl UnitStatus {
    /// Collapse the transitional states onto the three job states the agent
    /// reconciles against. A unit that is starting counts as loaded until it
    /// is actually running.
    pub fn job_state(self) -> JobState {
        match self {
            UnitStatus::Inactive => JobState::Inactive,
            UnitStatus::Launched => JobState::Launched,
            UnitStatus::Loading
            | UnitStatus::Loaded
            | UnitStatus::Launching
            | UnitStatus::Unloading => JobState::Loaded,
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Inactive => write!(f, "inactive"),
            UnitStatus::Loading => write!(f, "loading"),
            UnitStatus::Loaded => write!(f, "loaded"),
            UnitStatus::Launching => write!(f, "launching"),
            UnitStatus::Launched => write!(f, "launched"),
            UnitStatus::Unloading => write!(f, "unloading"),
        }
    }
}

/// Canonical observed state of one unit on one machine, as published to the
/// registry by the machine hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitState {
    pub name: String,
    pub machine_id: String,
    pub status: UnitStatus,
    pub hash: Option<UnitHash>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitional_states_count_as_loaded() {
        assert_eq!(UnitStatus::Loading.job_state(), JobState::Loaded);
        assert_eq!(UnitStatus::Launching.job_state(), JobState::Loaded);
        assert_eq!(UnitStatus::Unloading.job_state(), JobState::Loaded);
        assert_eq!(UnitStatus::Launched.job_state(), JobState::Launched);
        assert_eq!(UnitStatus::Inactive.job_state(), JobState::Inactive);
    }

    #[test]
    fn serializes_in_camel_case() {
        let state = UnitState {
            name: "foo.service".into(),
            machine_id: "XXX".into(),
            status: UnitStatus::Launched,
            hash: None,
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["machineId"], "XXX");
        assert_eq!(json["status"], "launched");
    }
}
