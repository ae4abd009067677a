use std::collections::{BTreeMap, BTreeSet};

use crate::unit::UnitFile;

/// Reserved unit section holding placement constraints.
pub const FLEET_SECTION: &str = "X-Fleet";

/// Placement constraints declared in a job's `[X-Fleet]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requirements {
    /// `MachineID=`: pin to a single machine.
    pub machine_id: Option<String>,
    /// `MachineMetadata=key=value`: per key, the machine must carry one of
    /// the listed values.
    pub metadata: BTreeMap<String, BTreeSet<String>>,
    /// `Conflicts=`: glob patterns of units that may not share a machine.
    pub conflicts: Vec<String>,
    /// `MachineOf=`: units this job must be co-located with.
    pub machine_of: Vec<String>,
}

impl Requirements {
    pub fn from_unit(unit: &UnitFile) -> Self {
        let mut req = Requirements::default();

        for opt in unit.section(FLEET_SECTION) {
            match opt.name.as_str() {
                "MachineID" => req.machine_id = Some(opt.value.clone()),
                "MachineMetadata" => {
                    for item in opt.value.split_whitespace() {
                        let item = item.trim_matches('"');
                        match item.split_once('=') {
                            Some((k, v)) if !k.is_empty() && !v.is_empty() => {
                                req.metadata
                                    .entry(k.to_string())
                                    .or_default()
                                    .insert(v.to_string());
                            }
                            _ => {
                                tracing::warn!(value = %item, "Ignoring malformed MachineMetadata requirement");
                            }
                        }
                    }
                }
                "Conflicts" => req
                    .conflicts
                    .extend(opt.value.split_whitespace().map(str::to_string)),
                "MachineOf" => req
                    .machine_of
                    .extend(opt.value.split_whitespace().map(str::to_string)),
                other => {
                    tracing::warn!(option = %other, "Ignoring unknown [X-Fleet] option");
                }
            }
        }

        req
    }

    /// Whether a unit called `name` is excluded by this job's conflicts. A job
    /// never conflicts with itself.
    pub fn conflicts_with(&self, own_name: &str, name: &str) -> bool {
        own_name != name && self.conflicts.iter().any(|p| glob_match(p, name))
    }

    pub fn is_empty(&self) -> bool {
        *self == Requirements::default()
    }
}

/// Shell-style glob supporting `*` and `?`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();

    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<usize> = None;
    let mut mark = 0;

    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ni;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ni = mark;
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fleet(lines: &str) -> Requirements {
        Requirements::from_unit(&UnitFile::parse(&format!("[X-Fleet]\n{}", lines)).unwrap())
    }

    #[test]
    fn no_section_means_no_requirements() {
        let req = Requirements::from_unit(&UnitFile::parse("[Service]\nExecStart=/bin/true").unwrap());
        assert!(req.is_empty());
    }

    #[test]
    fn collects_metadata_values_per_key() {
        let req = fleet("MachineMetadata=region=us-west\nMachineMetadata=region=us-east disk=ssd");
        assert_eq!(
            req.metadata["region"],
            BTreeSet::from(["us-east".to_string(), "us-west".to_string()])
        );
        assert_eq!(req.metadata["disk"], BTreeSet::from(["ssd".to_string()]));
    }

    #[test]
    fn last_machine_id_wins() {
        let req = fleet("MachineID=aaa\nMachineID=bbb");
        assert_eq!(req.machine_id.as_deref(), Some("bbb"));
    }

    #[test]
    fn conflicts_match_globs_but_not_self() {
        let req = fleet("Conflicts=web*.service");
        assert!(req.conflicts_with("web1.service", "web2.service"));
        assert!(!req.conflicts_with("web1.service", "web1.service"));
        assert!(!req.conflicts_with("web1.service", "db.service"));
    }

    #[test]
    fn glob_semantics() {
        assert!(glob_match("*", "anything"));
        assert!(glob_match("foo?.service", "foo1.service"));
        assert!(!glob_match("foo?.service", "foo12.service"));
        assert!(glob_match("a*b*c", "aXXbYYc"));
        assert!(!glob_match("a*b*c", "aXXbYY"));
        assert!(glob_match("exact.service", "exact.service"));
    }
}
