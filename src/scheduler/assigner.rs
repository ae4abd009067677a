use crate::job::{glob_match, Job};
use crate::machine::format_metadata;
use crate::scheduler::cluster::{ClusterState, MachineLoad};

/// Outcome of placing one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Place(String),
    Unschedulable(String),
}

/// Pick a machine for `job`.
///
/// Live machines are filtered by every constraint in the job's `[X-Fleet]`
/// section. Among the survivors the least loaded machine wins, ties going to
/// the smallest machine ID. The function has no side effects and the same
/// inputs always give the same answer.
pub fn place(job: &Job, cluster: &ClusterState) -> Decision {
    let req = job.requirements();
    let mut candidates: Vec<&MachineLoad> = cluster.machines().collect();

    if candidates.is_empty() {
        return Decision::Unschedulable("no live machines".to_string());
    }

    if let Some(pinned) = &req.machine_id {
        candidates.retain(|m| &m.machine.id == pinned);
        if candidates.is_empty() {
            return Decision::Unschedulable(format!("required machine {} is not live", pinned));
        }
    }

    if !req.metadata.is_empty() {
        candidates.retain(|m| m.machine.satisfies_metadata(&req.metadata));
        if candidates.is_empty() {
            return Decision::Unschedulable(format!(
                "no live machine has the required metadata {}",
                format_metadata(&req.metadata)
            ));
        }
    }

    for peer in &req.machine_of {
        let Some(host) = cluster.machine_of(peer) else {
            return Decision::Unschedulable(format!("co-located unit {} is not scheduled", peer));
        };
        candidates.retain(|m| m.machine.id == host);
        if candidates.is_empty() {
            return Decision::Unschedulable(format!(
                "co-located unit {} runs on a machine excluded by other constraints",
                peer
            ));
        }
    }

    candidates.retain(|m| {
        !m.units.iter().any(|other| {
            other != &job.name
                && (req.conflicts_with(&job.name, other)
                    || cluster
                        .conflicts_of(other)
                        .iter()
                        .any(|p| glob_match(p, &job.name)))
        })
    });
    if candidates.is_empty() {
        return Decision::Unschedulable("every eligible machine runs a conflicting unit".to_string());
    }

    // Least loaded, then smallest ID.
    candidates
        .into_iter()
        .min_by(|a, b| {
            a.load()
                .cmp(&b.load())
                .then_with(|| a.machine.id.cmp(&b.machine.id))
        })
        .map(|m| Decision::Place(m.machine.id.clone()))
        .unwrap_or_else(|| Decision::Unschedulable("no live machines".to_string()))
}
