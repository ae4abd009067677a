use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};
use crate::job::Requirements;
use crate::unit::{UnitFile, UnitHash, UnitStatus};

/// Target (and locally reconciled) state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Inactive,
    Loaded,
    Launched,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Inactive => write!(f, "inactive"),
            JobState::Loaded => write!(f, "loaded"),
            JobState::Launched => write!(f, "launched"),
        }
    }
}

impl FromStr for JobState {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "inactive" => Ok(JobState::Inactive),
            "loaded" => Ok(JobState::Loaded),
            "launched" => Ok(JobState::Launched),
            other => Err(FleetError::InvalidJob(format!("unknown job state {:?}", other))),
        }
    }
}

/// The part of a job that is stored as its registry object. Target state and
/// assignment live under separate keys with their own writers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobObject {
    pub name: String,
    pub unit: UnitFile,
}

/// A declared unit of work, assembled from its registry keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: String,
    pub unit: UnitFile,
    pub target_state: JobState,
    /// Machine the engine assigned this job to, if any.
    pub target_machine: Option<String>,
}

impl Job {
    /// New, unscheduled job with target state `inactive`.
    pub fn new(name: &str, unit: UnitFile) -> Result<Self> {
        validate_name(name)?;
        Ok(Self {
            name: name.to_string(),
            unit,
            target_state: JobState::Inactive,
            target_machine: None,
        })
    }

    pub fn with_target_state(mut self, state: JobState) -> Self {
        self.target_state = state;
        self
    }

    pub fn from_object(object: JobObject, target_state: JobState, target_machine: Option<String>) -> Self {
        Self {
            name: object.name,
            unit: object.unit,
            target_state,
            target_machine,
        }
    }

    pub fn object(&self) -> JobObject {
        JobObject {
            name: self.name.clone(),
            unit: self.unit.clone(),
        }
    }

    pub fn hash(&self) -> UnitHash {
        self.unit.hash()
    }

    pub fn requirements(&self) -> Requirements {
        Requirements::from_unit(&self.unit)
    }

    pub fn is_scheduled(&self) -> bool {
        self.target_machine.is_some()
    }
}

/// Observed state of a job: where it is believed to run and what that machine
/// last reported. Always derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedJobState {
    pub state: Option<UnitStatus>,
    pub machine_id: Option<String>,
    pub hostname: Option<String>,
}

/// Unit names must look like `name.suffix`.
pub fn validate_name(name: &str) -> Result<()> {
    let (prefix, suffix) = name
        .rsplit_once('.')
        .ok_or_else(|| FleetError::InvalidJob(format!("{:?} has no unit type suffix", name)))?;

    if prefix.is_empty() || suffix.is_empty() {
        return Err(FleetError::InvalidJob(format!(
            "{:?} must be of the form name.suffix",
            name
        )));
    }

    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || ":_.@-".contains(*c)))
    {
        return Err(FleetError::InvalidJob(format!(
            "{:?} contains invalid character {:?}",
            name, c
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        for name in ["foo.service", "web@1.service", "a-b_c:d.socket", "x.y.timer"] {
            assert!(validate_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn rejects_malformed_names() {
        for name in ["foo", ".service", "foo.", "", "foo bar.service", "foo/.service"] {
            assert!(validate_name(name).is_err(), "{} should be invalid", name);
        }
    }

    #[test]
    fn new_job_is_inactive_and_unscheduled() {
        let job = Job::new("foo.service", UnitFile::default()).unwrap();
        assert_eq!(job.target_state, JobState::Inactive);
        assert!(!job.is_scheduled());
    }

    #[test]
    fn job_state_round_trips_through_strings() {
        for state in [JobState::Inactive, JobState::Loaded, JobState::Launched] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert!("running".parse::<JobState>().is_err());
    }
}
