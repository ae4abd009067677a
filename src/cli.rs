//! Client-side operations behind the `fleet-lite` subcommands that talk to
//! the registry directly.

use std::path::Path;

use serde::Serialize;

use crate::error::{FleetError, Result};
use crate::job::{Job, JobState};
use crate::machine::format_metadata;
use crate::registry::RegistryClient;
use crate::unit::UnitFile;

/// Read a unit file from disk as a new job named after the file.
pub async fn job_from_file(path: &Path) -> Result<Job> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FleetError::InvalidJob(format!("{} has no file name", path.display())))?;
    let contents = tokio::fs::read_to_string(path).await?;
    let unit = UnitFile::parse(&contents)?;
    Job::new(name, unit)
}

/// Unit name for a command-line argument that is either a name or a path.
pub fn unit_name(arg: &str) -> &str {
    Path::new(arg)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(arg)
}

/// Submit jobs from unit files with the given target state. A job that
/// already exists with identical contents is left alone.
pub async fn submit(client: &RegistryClient, paths: &[String], state: JobState) -> Result<Vec<String>> {
    let mut submitted = Vec::new();
    for path in paths {
        let job = job_from_file(Path::new(path)).await?.with_target_state(state);
        match client.job(&job.name).await? {
            Some(existing) if existing.hash() == job.hash() => {
                tracing::debug!(job = %job.name, "Job already submitted");
            }
            Some(_) => {
                return Err(FleetError::InvalidJob(format!(
                    "job {} already exists with different contents",
                    job.name
                )))
            }
            None => {
                client.create_job(&job).await?;
                submitted.push(job.name);
            }
        }
    }
    Ok(submitted)
}

/// Move each job to `state`. Arguments naming a missing job are submitted
/// first when they point at a unit file.
pub async fn set_state(client: &RegistryClient, args: &[String], state: JobState) -> Result<()> {
    for arg in args {
        let name = unit_name(arg);
        if client.job(name).await?.is_none() {
            if Path::new(arg).is_file() {
                submit(client, std::slice::from_ref(arg), state).await?;
                continue;
            }
            return Err(FleetError::JobNotFound(name.to_string()));
        }
        client.set_target_state(name, state).await?;
    }
    Ok(())
}

pub async fn destroy(client: &RegistryClient, args: &[String]) -> Result<()> {
    for arg in args {
        client.destroy_job(unit_name(arg)).await?;
    }
    Ok(())
}

// =============================================================================
// Listings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitRow {
    pub unit: String,
    pub machine: String,
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitFileRow {
    pub unit: String,
    pub hash: String,
    pub desired: String,
    pub state: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineRow {
    pub machine: String,
    pub ip: String,
    pub metadata: String,
}

/// Every published unit state.
pub async fn unit_rows(client: &RegistryClient) -> Result<Vec<UnitRow>> {
    Ok(client
        .unit_states()
        .await?
        .into_iter()
        .map(|s| UnitRow {
            unit: s.name,
            machine: s.machine_id,
            state: s.status.to_string(),
        })
        .collect())
}

/// Every job with its target state, observed state and assignment.
pub async fn unit_file_rows(client: &RegistryClient) -> Result<Vec<UnitFileRow>> {
    let mut observed = client.job_states().await?;
    Ok(client
        .jobs()
        .await?
        .into_iter()
        .map(|job| {
            let seen = observed.remove(&job.name);
            UnitFileRow {
                hash: job.hash().short().to_string(),
                desired: job.target_state.to_string(),
                state: seen
                    .as_ref()
                    .and_then(|s| s.state)
                    .map_or_else(|| "-".to_string(), |s| s.to_string()),
                target: job.target_machine.unwrap_or_else(|| "-".to_string()),
                unit: job.name,
            }
        })
        .collect())
}

pub async fn machine_rows(client: &RegistryClient) -> Result<Vec<MachineRow>> {
    Ok(client
        .machines()
        .await?
        .into_iter()
        .map(|m| MachineRow {
            ip: m.public_ip.unwrap_or_else(|| "-".to_string()),
            metadata: if m.metadata.is_empty() {
                "-".to_string()
            } else {
                format_metadata(&m.metadata)
            },
            machine: m.id,
        })
        .collect())
}

/// Left-aligned columns sized to their widest cell.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.len()).collect();
    for row in rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| {
        let mut out = String::new();
        for (i, cell) in cells.iter().enumerate() {
            if i + 1 == cells.len() {
                out.push_str(cell);
            } else {
                out.push_str(&format!("{:<width$}  ", cell, width = widths[i]));
            }
        }
        out
    };

    let mut out = line(headers.to_vec());
    out.push('\n');
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
        out.push('\n');
    }
    out
}

impl UnitRow {
    pub const HEADERS: [&'static str; 3] = ["UNIT", "MACHINE", "STATE"];

    pub fn cells(&self) -> Vec<String> {
        vec![self.unit.clone(), self.machine.clone(), self.state.clone()]
    }
}

impl UnitFileRow {
    pub const HEADERS: [&'static str; 5] = ["UNIT", "HASH", "DSTATE", "STATE", "TARGET"];

    pub fn cells(&self) -> Vec<String> {
        vec![
            self.unit.clone(),
            self.hash.clone(),
            self.desired.clone(),
            self.state.clone(),
            self.target.clone(),
        ]
    }
}

impl MachineRow {
    pub const HEADERS: [&'static str; 3] = ["MACHINE", "IP", "METADATA"];

    pub fn cells(&self) -> Vec<String> {
        vec![self.machine.clone(), self.ip.clone(), self.metadata.clone()]
    }
}
