use std::collections::BTreeMap;

use crate::job::{Job, JobState};
use crate::unit::UnitHash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    LoadUnit,
    UnloadUnit,
    StartUnit,
    StopUnit,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::LoadUnit => write!(f, "load"),
            TaskKind::UnloadUnit => write!(f, "unload"),
            TaskKind::StartUnit => write!(f, "start"),
            TaskKind::StopUnit => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub kind: TaskKind,
    pub reason: &'static str,
}

impl Task {
    fn new(kind: TaskKind, reason: &'static str) -> Self {
        Self { kind, reason }
    }
}

/// Ordered steps for one unit. If a step fails the rest of the chain is
/// skipped; other chains still run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskChain {
    pub unit: String,
    /// Desired job, present when the chain loads the unit.
    pub job: Option<Job>,
    pub tasks: Vec<Task>,
}

/// A unit as the local unit manager currently has it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalUnit {
    pub state: JobState,
    pub hash: Option<UnitHash>,
}

const REASON_ORPHAN: &str = "unit is not scheduled to this machine";
const REASON_INACTIVE: &str = "target state is inactive";
const REASON_CHANGED: &str = "unit contents changed";
const REASON_MISSING: &str = "unit is scheduled here but not loaded";
const REASON_LAUNCH: &str = "target state is launched";
const REASON_LOADED: &str = "target state is loaded";

/// Decide what to do to make `actual` match `desired`.
///
/// Chains that only take units down come first so a pass frees a unit name
/// before anything is loaded in its place. Within each group units are in
/// name order.
pub fn plan(
    desired: &BTreeMap<String, Job>,
    actual: &BTreeMap<String, LocalUnit>,
) -> Vec<TaskChain> {
    let mut teardown = Vec::new();
    let mut bringup = Vec::new();

    for (name, local) in actual {
        let reason = match desired.get(name) {
            None => REASON_ORPHAN,
            Some(job) if job.target_state == JobState::Inactive => REASON_INACTIVE,
            Some(job) if local.hash.as_ref().is_some_and(|h| *h != job.hash()) => REASON_CHANGED,
            Some(_) => continue,
        };
        teardown.push(TaskChain {
            unit: name.clone(),
            job: None,
            tasks: take_down(local.state, reason),
        });
    }

    for (name, job) in desired {
        if job.target_state == JobState::Inactive {
            continue;
        }

        let local = actual
            .get(name)
            .filter(|l| l.hash.as_ref().map_or(true, |h| *h == job.hash()));

        let mut tasks = Vec::new();
        match local {
            None => {
                tasks.push(Task::new(TaskKind::LoadUnit, REASON_MISSING));
                if job.target_state == JobState::Launched {
                    tasks.push(Task::new(TaskKind::StartUnit, REASON_LAUNCH));
                }
            }
            Some(local) => match (job.target_state, local.state) {
                (JobState::Launched, JobState::Loaded) => {
                    tasks.push(Task::new(TaskKind::StartUnit, REASON_LAUNCH));
                }
                (JobState::Loaded, JobState::Launched) => {
                    tasks.push(Task::new(TaskKind::StopUnit, REASON_LOADED));
                }
                _ => {}
            },
        }

        if !tasks.is_empty() {
            bringup.push(TaskChain {
                unit: name.clone(),
                job: Some(job.clone()),
                tasks,
            });
        }
    }

    teardown.extend(bringup);
    teardown
}

fn take_down(state: JobState, reason: &'static str) -> Vec<Task> {
    let mut tasks = Vec::with_capacity(2);
    if state == JobState::Launched {
        tasks.push(Task::new(TaskKind::StopUnit, reason));
    }
    tasks.push(Task::new(TaskKind::UnloadUnit, reason));
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::UnitFile;

    fn job(name: &str, contents: &str, target: JobState) -> Job {
        Job::new(name, UnitFile::parse(contents).unwrap())
            .unwrap()
            .with_target_state(target)
    }

    fn kinds(chain: &TaskChain) -> Vec<TaskKind> {
        chain.tasks.iter().map(|t| t.kind).collect()
    }

    #[test]
    fn loads_and_starts_missing_units() {
        let desired = BTreeMap::from([(
            "a.service".to_string(),
            job("a.service", "", JobState::Launched),
        )]);
        let chains = plan(&desired, &BTreeMap::new());
        assert_eq!(chains.len(), 1);
        assert_eq!(kinds(&chains[0]), vec![TaskKind::LoadUnit, TaskKind::StartUnit]);
        assert!(chains[0].job.is_some());
    }

    #[test]
    fn orphans_are_stopped_and_unloaded_first() {
        let desired = BTreeMap::from([(
            "a.service".to_string(),
            job("a.service", "", JobState::Loaded),
        )]);
        let actual = BTreeMap::from([(
            "z.service".to_string(),
            LocalUnit {
                state: JobState::Launched,
                hash: None,
            },
        )]);
        let chains = plan(&desired, &actual);
        assert_eq!(chains[0].unit, "z.service");
        assert_eq!(kinds(&chains[0]), vec![TaskKind::StopUnit, TaskKind::UnloadUnit]);
        assert_eq!(chains[1].unit, "a.service");
        assert_eq!(kinds(&chains[1]), vec![TaskKind::LoadUnit]);
    }

    #[test]
    fn changed_contents_are_replaced() {
        let old = job("a.service", "[Service]\nExecStart=/bin/old\n", JobState::Launched);
        let new = job("a.service", "[Service]\nExecStart=/bin/new\n", JobState::Launched);
        let desired = BTreeMap::from([("a.service".to_string(), new)]);
        let actual = BTreeMap::from([(
            "a.service".to_string(),
            LocalUnit {
                state: JobState::Launched,
                hash: Some(old.hash()),
            },
        )]);

        let chains = plan(&desired, &actual);
        assert_eq!(chains.len(), 2);
        assert_eq!(kinds(&chains[0]), vec![TaskKind::StopUnit, TaskKind::UnloadUnit]);
        assert_eq!(kinds(&chains[1]), vec![TaskKind::LoadUnit, TaskKind::StartUnit]);
    }

    #[test]
    fn converged_state_plans_nothing() {
        let a = job("a.service", "", JobState::Launched);
        let actual = BTreeMap::from([(
            "a.service".to_string(),
            LocalUnit {
                state: JobState::Launched,
                hash: Some(a.hash()),
            },
        )]);
        let desired = BTreeMap::from([("a.service".to_string(), a)]);
        assert!(plan(&desired, &actual).is_empty());
    }

    #[test]
    fn target_transitions() {
        let launched = job("a.service", "", JobState::Launched);
        let loaded = job("a.service", "", JobState::Loaded);
        let inactive = job("a.service", "", JobState::Inactive);
        let local = |state| {
            BTreeMap::from([(
                "a.service".to_string(),
                LocalUnit {
                    state,
                    hash: Some(launched.hash()),
                },
            )])
        };

        let chains = plan(
            &BTreeMap::from([("a.service".to_string(), launched.clone())]),
            &local(JobState::Loaded),
        );
        assert_eq!(kinds(&chains[0]), vec![TaskKind::StartUnit]);

        let chains = plan(
            &BTreeMap::from([("a.service".to_string(), loaded)]),
            &local(JobState::Launched),
        );
        assert_eq!(kinds(&chains[0]), vec![TaskKind::StopUnit]);

        let chains = plan(
            &BTreeMap::from([("a.service".to_string(), inactive)]),
            &local(JobState::Launched),
        );
        assert_eq!(chains.len(), 1);
        assert_eq!(kinds(&chains[0]), vec![TaskKind::StopUnit, TaskKind::UnloadUnit]);
        assert_eq!(chains[0].tasks[0].reason, REASON_INACTIVE);
    }
}
