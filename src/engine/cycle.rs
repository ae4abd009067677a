use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::RegistryError;
use crate::job::{Job, JobState};
use crate::registry::{Assignment, RegistryClient};
use crate::scheduler::{place, ClusterState, Decision};

/// Counters for one scheduling cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub scheduled: usize,
    pub unscheduled: usize,
    pub unschedulable: usize,
    pub conflicts: usize,
    pub errors: usize,
}

impl CycleStats {
    /// True if the cycle wrote anything.
    pub fn changed(&self) -> bool {
        self.scheduled > 0 || self.unscheduled > 0
    }
}

/// Why a job is currently not placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobCondition {
    pub job: String,
    pub reason: String,
    #[serde(skip)]
    pub(crate) fingerprint: u64,
}

/// Per-job outcome of a write, folded into [`CycleStats`].
enum Write {
    Done,
    Lost,
    Failed,
}

/// One pass of drift repair and placement.
///
/// `still_leader` is checked before every write so an engine that loses its
/// lease mid-cycle stops writing.
pub(crate) async fn run(
    client: &RegistryClient,
    conditions: &mut BTreeMap<String, JobCondition>,
    still_leader: impl Fn() -> bool,
) -> Result<CycleStats, RegistryError> {
    let snapshot = client.job_snapshot().await?;
    let mut cluster = ClusterState::new(client.machines().await?);
    let mut stats = CycleStats::default();

    // Jobs whose assignment changed under us this cycle are left alone until
    // the next one.
    let mut contended: BTreeSet<String> = BTreeSet::new();

    for (name, assignment) in &snapshot.assignments {
        let reason = match snapshot.jobs.get(name) {
            None => Some("job no longer exists"),
            Some(job) if job.target_state == JobState::Inactive => Some("target state is inactive"),
            Some(_) if !cluster.is_alive(&assignment.machine_id) => Some("machine is not live"),
            Some(_) => None,
        };

        let Some(reason) = reason else {
            if let Some(job) = snapshot.jobs.get(name) {
                cluster.assign(name, &assignment.machine_id, job.requirements().conflicts);
            }
            continue;
        };

        if !still_leader() {
            return Ok(stats);
        }
        match unschedule(client, assignment, reason).await {
            Write::Done => stats.unscheduled += 1,
            Write::Lost => {
                stats.conflicts += 1;
                contended.insert(name.clone());
            }
            Write::Failed => {
                stats.errors += 1;
                contended.insert(name.clone());
            }
        }
    }

    for (name, job) in &snapshot.jobs {
        if job.target_state == JobState::Inactive || contended.contains(name) {
            continue;
        }
        if cluster.machine_of(name).is_some() {
            continue;
        }

        let fingerprint = fingerprint(&cluster, job);
        if conditions
            .get(name)
            .is_some_and(|c| c.fingerprint == fingerprint)
        {
            stats.unschedulable += 1;
            continue;
        }

        match place(job, &cluster) {
            Decision::Place(machine_id) => {
                if !still_leader() {
                    return Ok(stats);
                }
                match client.schedule_job(name, &machine_id).await {
                    Ok(assignment) => {
                        tracing::info!(job = %name, machine_id = %machine_id, version = assignment.version, "Job scheduled");
                        cluster.assign(name, &machine_id, job.requirements().conflicts);
                        conditions.remove(name);
                        stats.scheduled += 1;
                    }
                    Err(e) if e.is_conflict() => {
                        tracing::debug!(job = %name, "Assignment changed concurrently, discarding decision");
                        stats.conflicts += 1;
                    }
                    Err(e) => {
                        tracing::warn!(job = %name, error = %e, "Failed to schedule job");
                        stats.errors += 1;
                    }
                }
            }
            Decision::Unschedulable(reason) => {
                if conditions.get(name).map(|c| &c.reason) != Some(&reason) {
                    tracing::info!(job = %name, reason = %reason, "Job is unschedulable");
                }
                conditions.insert(
                    name.clone(),
                    JobCondition {
                        job: name.clone(),
                        reason,
                        fingerprint,
                    },
                );
                stats.unschedulable += 1;
            }
        }
    }

    conditions.retain(|name, _| {
        snapshot
            .jobs
            .get(name)
            .is_some_and(|j| j.target_state != JobState::Inactive)
            && cluster.machine_of(name).is_none()
    });

    Ok(stats)
}

async fn unschedule(client: &RegistryClient, assignment: &Assignment, reason: &str) -> Write {
    match client.unschedule_job(assignment).await {
        Ok(()) => {
            tracing::info!(
                job = %assignment.job,
                machine_id = %assignment.machine_id,
                reason,
                "Job unscheduled"
            );
            Write::Done
        }
        Err(e) if e.is_conflict() => {
            tracing::debug!(job = %assignment.job, "Assignment changed concurrently, discarding decision");
            Write::Lost
        }
        Err(e) => {
            tracing::warn!(job = %assignment.job, error = %e, "Failed to unschedule job");
            Write::Failed
        }
    }
}

/// Everything a placement decision for `job` depends on.
fn fingerprint(cluster: &ClusterState, job: &Job) -> u64 {
    let mut hasher = DefaultHasher::new();
    cluster.fingerprint().hash(&mut hasher);
    job.hash().hash(&mut hasher);
    hasher.finish()
}
