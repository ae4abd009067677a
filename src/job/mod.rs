//! Jobs: declared units of work with a target state and placement
//! constraints.

#[allow(clippy::module_inception)]
pub mod job;
pub mod requirements;

pub use job::{validate_name, Job, JobObject, JobState, ObservedJobState};
pub use requirements::{glob_match, Requirements, FLEET_SECTION};
