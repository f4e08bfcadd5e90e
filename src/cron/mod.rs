//! Recurring triggers
//!
//! [`CronScheduler`] watches stored cron workflows and submits a new
//! instance through the controller whenever a schedule comes due, honouring
//! the concurrency policy and starting deadline of each cron workflow.

mod schedule;
mod scheduler;

pub use schedule::{Due, Schedule, normalize_schedule};
pub use scheduler::{CronOutcome, CronScheduler, SkipReason};

use crate::model::CronWorkflow;
use crate::resolver::Resolver;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ScheduleError {
    #[error("invalid schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("invalid cron workflow '{name}': {}", errors.join("; "))]
    InvalidCronWorkflow { name: String, errors: Vec<String> },
}

/// Starting deadline as a duration, `None` when it does not fit one
pub(crate) fn deadline_duration(seconds: u64) -> Option<chrono::Duration> {
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
}

/// Validate a cron workflow, collecting every problem
///
/// The embedded workflow spec gets the same checks as a template, so a
/// cron workflow that passes can always be resolved with its defaults.
pub fn lint(cron: &CronWorkflow) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if cron.metadata.name.trim().is_empty() {
        errors.push("metadata.name is required".to_string());
    }
    if let Err(e) = Schedule::parse(&cron.spec.schedule) {
        errors.push(e.to_string());
    }
    if cron.spec.workflow_spec.entrypoint.is_none() {
        errors.push("workflow_spec.entrypoint is required for cron workflows".to_string());
    }
    if let Some(seconds) = cron.spec.starting_deadline_seconds {
        if deadline_duration(seconds).is_none() {
            errors.push(format!(
                "starting_deadline_seconds {} is out of range",
                seconds
            ));
        }
    }
    if let Err(spec_errors) = Resolver::new().lint(&cron.spec.workflow_spec) {
        errors.extend(spec_errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
