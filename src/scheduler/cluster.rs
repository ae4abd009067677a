use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use crate::machine::MachineState;

/// A live machine and the jobs currently assigned to it.
#[derive(Debug, Clone)]
pub struct MachineLoad {
    pub machine: MachineState,
    pub units: BTreeSet<String>,
}

impl MachineLoad {
    pub fn load(&self) -> usize {
        self.units.len()
    }
}

/// The engine's view of the cluster during one scheduling cycle: live
/// machines and the assignments that point at them. Placement reads it, the
/// engine updates it after every decision it manages to write.
#[derive(Debug, Clone, Default)]
pub struct ClusterState {
    machines: BTreeMap<String, MachineLoad>,
    assignments: BTreeMap<String, String>,
    /// `Conflicts=` patterns of assigned jobs, by job name.
    conflicts: BTreeMap<String, Vec<String>>,
}

impl ClusterState {
    pub fn new(machines: impl IntoIterator<Item = MachineState>) -> Self {
        let machines = machines
            .into_iter()
            .map(|m| {
                (
                    m.id.clone(),
                    MachineLoad {
                        machine: m,
                        units: BTreeSet::new(),
                    },
                )
            })
            .collect();
        Self {
            machines,
            ..Default::default()
        }
    }

    pub fn is_alive(&self, machine_id: &str) -> bool {
        self.machines.contains_key(machine_id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &MachineLoad> {
        self.machines.values()
    }

    /// Record that `job` runs on `machine_id`. Assignments to machines that
    /// are not live are ignored; the engine removes those before placing.
    pub fn assign(&mut self, job: &str, machine_id: &str, conflicts: Vec<String>) {
        let Some(load) = self.machines.get_mut(machine_id) else {
            return;
        };
        load.units.insert(job.to_string());
        self.assignments
            .insert(job.to_string(), machine_id.to_string());
        if !conflicts.is_empty() {
            self.conflicts.insert(job.to_string(), conflicts);
        }
    }

    /// Machine `job` is assigned to, if any.
    pub fn machine_of(&self, job: &str) -> Option<&str> {
        self.assignments.get(job).map(String::as_str)
    }

    pub fn load(&self, machine_id: &str) -> usize {
        self.machines.get(machine_id).map_or(0, MachineLoad::load)
    }

    pub fn conflicts_of(&self, job: &str) -> &[String] {
        self.conflicts.get(job).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Hash of everything placement depends on besides the job itself: live
    /// machines, their metadata and the assignment set.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        for (id, load) in &self.machines {
            id.hash(&mut hasher);
            load.machine.metadata.hash(&mut hasher);
        }
        self.assignments.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_to_dead_machines_are_ignored() {
        let mut cluster = ClusterState::new(vec![MachineState::new("a")]);
        cluster.assign("x.service", "a", vec![]);
        cluster.assign("y.service", "gone", vec![]);

        assert_eq!(cluster.load("a"), 1);
        assert_eq!(cluster.machine_of("x.service"), Some("a"));
        assert_eq!(cluster.machine_of("y.service"), None);
    }

    #[test]
    fn fingerprint_tracks_assignments_and_metadata() {
        let mut cluster = ClusterState::new(vec![MachineState::new("a"), MachineState::new("b")]);
        let before = cluster.fingerprint();

        cluster.assign("x.service", "a", vec![]);
        let assigned = cluster.fingerprint();
        assert_ne!(before, assigned);

        // Assignments to dead machines do not count.
        let mut other = ClusterState::new(vec![MachineState::new("a"), MachineState::new("b")]);
        other.assign("x.service", "gone", vec![]);
        assert_eq!(other.fingerprint(), before);

        let tagged = ClusterState::new(vec![
            MachineState::new("a").with_metadata("region", "us"),
            MachineState::new("b"),
        ]);
        assert_ne!(tagged.fingerprint(), before);
    }
}
