/// Default namespace for every key this crate writes.
pub const DEFAULT_PREFIX: &str = "/fleet/";

/// Registry key layout. Each kind of record lives in its own namespace with a
/// single writer:
///
/// | key | writer |
/// |---|---|
/// | `job/<name>/object` | client |
/// | `job/<name>/target-state` | client |
/// | `job/<name>/target` | engine (assignment) |
/// | `machines/<id>/object` | the machine (presence lease) |
/// | `states/<name>/<machine>` | the machine hosting the unit |
/// | `engine/leader` | the leader engine (lease) |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

/// Which record of a job a key refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKey {
    Object,
    TargetState,
    Target,
}

impl KeyLayout {
    pub fn new(prefix: &str) -> Self {
        let mut prefix = prefix.to_string();
        if !prefix.starts_with('/') {
            prefix.insert(0, '/');
        }
        if !prefix.ends_with('/') {
            prefix.push('/');
        }
        Self { prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn jobs(&self) -> String {
        format!("{}job/", self.prefix)
    }

    pub fn job_object(&self, name: &str) -> String {
        format!("{}job/{}/object", self.prefix, name)
    }

    pub fn job_target_state(&self, name: &str) -> String {
        format!("{}job/{}/target-state", self.prefix, name)
    }

    pub fn job_target(&self, name: &str) -> String {
        format!("{}job/{}/target", self.prefix, name)
    }

    pub fn machines(&self) -> String {
        format!("{}machines/", self.prefix)
    }

    pub fn machine(&self, id: &str) -> String {
        format!("{}machines/{}/object", self.prefix, id)
    }

    pub fn states(&self) -> String {
        format!("{}states/", self.prefix)
    }

    pub fn unit_state(&self, name: &str, machine_id: &str) -> String {
        format!("{}states/{}/{}", self.prefix, name, machine_id)
    }

    pub fn leader(&self) -> String {
        format!("{}engine/leader", self.prefix)
    }

    /// Split a key under `job/` into the job name and which record it is.
    pub fn parse_job_key(&self, key: &str) -> Option<(String, JobKey)> {
        let rest = key.strip_prefix(&self.jobs())?;
        let (name, leaf) = rest.rsplit_once('/')?;
        let kind = match leaf {
            "object" => JobKey::Object,
            "target-state" => JobKey::TargetState,
            "target" => JobKey::Target,
            _ => return None,
        };
        Some((name.to_string(), kind))
    }
}
