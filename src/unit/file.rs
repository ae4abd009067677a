use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{FleetError, Result};

/// A single `Name=Value` line inside a `[Section]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOption {
    pub section: String,
    pub name: String,
    pub value: String,
}

impl UnitOption {
    pub fn new(section: &str, name: &str, value: &str) -> Self {
        Self {
            section: section.to_string(),
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// SHA-256 of a unit's canonical serialization, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitHash(String);

impl UnitHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(7)]
    }
}

impl std::fmt::Display for UnitHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parsed unit file. Options keep their file order, and repeated names are
/// preserved since several options (`Conflicts`, `MachineMetadata`) may appear
/// more than once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFile {
    pub options: Vec<UnitOption>,
}

impl UnitFile {
    pub fn from_options(options: Vec<UnitOption>) -> Self {
        Self { options }
    }

    /// Parse systemd-style unit contents.
    ///
    /// Blank lines and lines starting with `#` or `;` are skipped, a trailing
    /// backslash continues a value onto the next line.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut options = Vec::new();
        let mut section: Option<String> = None;
        let mut pending: Option<(String, String)> = None;

        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.trim();

            if let Some((name, mut value)) = pending.take() {
                if let Some(stripped) = line.strip_suffix('\\') {
                    value.push(' ');
                    value.push_str(stripped.trim());
                    pending = Some((name, value));
                } else {
                    value.push(' ');
                    value.push_str(line);
                    Self::push(&mut options, &section, name, value);
                }
                continue;
            }

            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if line.starts_with('[') {
                let name = line
                    .strip_prefix('[')
                    .and_then(|l| l.strip_suffix(']'))
                    .filter(|n| !n.is_empty())
                    .ok_or_else(|| {
                        FleetError::InvalidUnitFile(format!(
                            "malformed section header on line {}",
                            lineno + 1
                        ))
                    })?;
                section = Some(name.to_string());
                continue;
            }

            if section.is_none() {
                return Err(FleetError::InvalidUnitFile(format!(
                    "option outside of a section on line {}",
                    lineno + 1
                )));
            }

            let (name, value) = line.split_once('=').ok_or_else(|| {
                FleetError::InvalidUnitFile(format!("expected Name=Value on line {}", lineno + 1))
            })?;
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(FleetError::InvalidUnitFile(format!(
                    "empty option name on line {}",
                    lineno + 1
                )));
            }

            let value = value.trim();
            if let Some(stripped) = value.strip_suffix('\\') {
                pending = Some((name, stripped.trim().to_string()));
            } else {
                Self::push(&mut options, &section, name, value.to_string());
            }
        }

        if let Some((name, value)) = pending {
            Self::push(&mut options, &section, name, value);
        }

        Ok(Self { options })
    }

    fn push(options: &mut Vec<UnitOption>, section: &Option<String>, name: String, value: String) {
        if let Some(section) = section {
            options.push(UnitOption {
                section: section.clone(),
                name,
                value,
            });
        }
    }

    /// All options of a section, in file order.
    pub fn section<'a>(&'a self, section: &'a str) -> impl Iterator<Item = &'a UnitOption> + 'a {
        self.options.iter().filter(move |o| o.section == section)
    }

    /// Every value of `name` within `section`.
    pub fn values<'a>(&'a self, section: &str, name: &str) -> Vec<&'a str> {
        self.options
            .iter()
            .filter(|o| o.section == section && o.name == name)
            .map(|o| o.value.as_str())
            .collect()
    }

    /// The last value of `name` within `section`.
    pub fn value(&self, section: &str, name: &str) -> Option<&str> {
        self.values(section, name).last().copied()
    }

    /// Canonical text form; sections are emitted in order of first appearance.
    pub fn serialize(&self) -> String {
        let mut sections: Vec<&str> = Vec::new();
        for opt in &self.options {
            if !sections.contains(&opt.section.as_str()) {
                sections.push(&opt.section);
            }
        }

        let mut out = String::new();
        for (i, section) in sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{}]\n", section));
            for opt in self.section(section) {
                out.push_str(&format!("{}={}\n", opt.name, opt.value));
            }
        }
        out
    }

    pub fn hash(&self) -> UnitHash {
        let mut hasher = Sha256::new();
        hasher.update(self.serialize().as_bytes());
        UnitHash(hex::encode(hasher.finalize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# comment
[Unit]
Description=Hello

[Service]
ExecStart=/bin/sh -c \
  "while true; do echo hi; sleep 1; done"

[X-Fleet]
Conflicts=web*.service
Conflicts=db.service
MachineMetadata=region=us-west
"#;

    #[test]
    fn parses_sections_and_repeated_options() {
        let unit = UnitFile::parse(SAMPLE).unwrap();
        assert_eq!(unit.value("Unit", "Description"), Some("Hello"));
        assert_eq!(
            unit.values("X-Fleet", "Conflicts"),
            vec!["web*.service", "db.service"]
        );
        assert_eq!(
            unit.value("X-Fleet", "MachineMetadata"),
            Some("region=us-west")
        );
    }

    #[test]
    fn joins_continuation_lines() {
        let unit = UnitFile::parse(SAMPLE).unwrap();
        assert_eq!(
            unit.value("Service", "ExecStart"),
            Some(r#"/bin/sh -c "while true; do echo hi; sleep 1; done""#)
        );
    }

    #[test]
    fn empty_contents_is_an_empty_unit() {
        let unit = UnitFile::parse("").unwrap();
        assert!(unit.options.is_empty());
        assert_eq!(unit.serialize(), "");
    }

    #[test]
    fn values_outlive_the_lookup_keys() {
        let unit = UnitFile::parse(SAMPLE).unwrap();
        let found = {
            let section = String::from("X-Fleet");
            let name = String::from("Conflicts");
            unit.values(&section, &name)
        };
        assert_eq!(found, vec!["web*.service", "db.service"]);
    }

    #[test]
    fn rejects_option_outside_section() {
        assert!(UnitFile::parse("ExecStart=/bin/true").is_err());
    }

    #[test]
    fn rejects_line_without_equals() {
        assert!(UnitFile::parse("[Service]\nExecStart").is_err());
    }

    #[test]
    fn hash_ignores_formatting_but_not_content() {
        let a = UnitFile::parse("[Service]\nExecStart=/bin/true\n").unwrap();
        let b = UnitFile::parse("\n\n[Service]\n  ExecStart = /bin/true  \n").unwrap();
        let c = UnitFile::parse("[Service]\nExecStart=/bin/false\n").unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
        assert_eq!(a.hash().as_str().len(), 64);
        assert_eq!(a.hash().short().len(), 7);
    }
}
