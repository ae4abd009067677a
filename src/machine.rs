use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

pub type Metadata = BTreeMap<String, BTreeSet<String>>;

/// A machine as published in its presence record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineState {
    pub id: String,
    pub public_ip: Option<String>,
    pub hostname: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    pub registered_at: DateTime<Utc>,
}

impl MachineState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            public_ip: None,
            hostname: None,
            metadata: Metadata::new(),
            registered_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata
            .entry(key.to_string())
            .or_default()
            .insert(value.to_string());
        self
    }

    pub fn with_public_ip(mut self, ip: &str) -> Self {
        self.public_ip = Some(ip.to_string());
        self
    }

    /// True if every required key is present with at least one of the
    /// accepted values.
    pub fn satisfies_metadata(&self, required: &Metadata) -> bool {
        required.iter().all(|(key, accepted)| {
            self.metadata
                .get(key)
                .is_some_and(|values| !values.is_disjoint(accepted))
        })
    }
}

/// Parse `key=value[,key=value...]` into machine metadata.
pub fn parse_metadata(raw: &str) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .filter(|(k, v)| !k.trim().is_empty() && !v.trim().is_empty())
            .ok_or_else(|| {
                FleetError::Internal(format!("invalid metadata {:?}, expected key=value", pair))
            })?;
        metadata
            .entry(key.trim().to_string())
            .or_default()
            .insert(value.trim().to_string());
    }
    Ok(metadata)
}

/// Render metadata back as `key=value,key=value`.
pub fn format_metadata(metadata: &Metadata) -> String {
    metadata
        .iter()
        .flat_map(|(k, values)| values.iter().map(move |v| format!("{}={}", k, v)))
        .collect::<Vec<_>>()
        .join(",")
}

/// Use the configured machine ID, else `/etc/machine-id`, else a fresh one.
/// A generated ID is not stable across restarts, so production nodes should
/// configure one.
pub fn resolve_machine_id(configured: Option<String>) -> String {
    if let Some(id) = configured.filter(|id| !id.trim().is_empty()) {
        return id.trim().to_string();
    }

    match std::fs::read_to_string("/etc/machine-id") {
        Ok(contents) if !contents.trim().is_empty() => contents.trim().to_string(),
        _ => {
            let id = uuid::Uuid::new_v4().simple().to_string();
            tracing::warn!(machine_id = %id, "No machine ID configured, generated one");
            id
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_metadata_pairs() {
        let md = parse_metadata("region=us-west, disk=ssd,disk=hdd").unwrap();
        assert_eq!(md["region"], BTreeSet::from(["us-west".to_string()]));
        assert_eq!(md["disk"].len(), 2);
        assert!(parse_metadata("").unwrap().is_empty());
        assert!(parse_metadata("novalue").is_err());
        assert!(parse_metadata("=x").is_err());
    }

    #[test]
    fn metadata_matching() {
        let machine = MachineState::new("m1")
            .with_metadata("region", "us-west")
            .with_metadata("disk", "ssd");

        let mut required = Metadata::new();
        required.insert(
            "region".into(),
            BTreeSet::from(["us-east".to_string(), "us-west".to_string()]),
        );
        assert!(machine.satisfies_metadata(&required));

        required.insert("gpu".into(), BTreeSet::from(["yes".to_string()]));
        assert!(!machine.satisfies_metadata(&required));

        assert!(machine.satisfies_metadata(&Metadata::new()));
    }

    #[test]
    fn configured_machine_id_wins() {
        assert_eq!(resolve_machine_id(Some(" XXX ".into())), "XXX");
    }
}
