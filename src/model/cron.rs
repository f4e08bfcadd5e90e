//! Cron workflow types

use super::{ObjectMeta, WorkflowSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// How a new trigger interacts with still-running instances
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum ConcurrencyPolicy {
    /// Instances may overlap
    #[default]
    Allow,
    /// Skip the trigger while a prior instance is running
    Forbid,
    /// Terminate running instances, then create the new one
    Replace,
}

impl fmt::Display for ConcurrencyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConcurrencyPolicy::Allow => "Allow",
            ConcurrencyPolicy::Forbid => "Forbid",
            ConcurrencyPolicy::Replace => "Replace",
        };
        f.write_str(s)
    }
}

/// Scheduling configuration of a cron workflow
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CronWorkflowSpec {
    /// Cron expression or human-readable schedule
    pub schedule: String,

    #[serde(default)]
    pub concurrency_policy: ConcurrencyPolicy,

    /// Runs evaluated later than this after their scheduled time are skipped
    pub starting_deadline_seconds: Option<u64>,

    /// Suspended cron workflows fire nothing
    #[serde(default)]
    pub suspend: bool,

    /// Spec of the workflows created on each trigger
    pub workflow_spec: WorkflowSpec,
}

impl CronWorkflowSpec {
    pub fn starting_deadline(&self) -> Option<Duration> {
        self.starting_deadline_seconds.map(Duration::from_secs)
    }
}

/// Reference to an instance created by a cron workflow
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ActiveWorkflowRef {
    pub uid: Uuid,
    pub name: String,
}

/// Bookkeeping maintained by the cron scheduler
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct CronWorkflowStatus {
    /// Scheduled time of the most recent trigger that was handled
    pub last_scheduled_time: Option<DateTime<Utc>>,

    /// Instances created by this cron workflow that were non-terminal at last check
    #[serde(default)]
    pub active: Vec<ActiveWorkflowRef>,
}

/// A workflow spec fired on a schedule
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CronWorkflow {
    pub metadata: ObjectMeta,
    pub spec: CronWorkflowSpec,
    #[serde(default)]
    pub status: CronWorkflowStatus,
}

impl CronWorkflow {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        schedule: impl Into<String>,
        workflow_spec: WorkflowSpec,
    ) -> Self {
        Self {
            metadata: ObjectMeta::named(name, namespace),
            spec: CronWorkflowSpec {
                schedule: schedule.into(),
                concurrency_policy: ConcurrencyPolicy::default(),
                starting_deadline_seconds: None,
                suspend: false,
                workflow_spec,
            },
            status: CronWorkflowStatus::default(),
        }
    }

    pub fn with_policy(mut self, policy: ConcurrencyPolicy) -> Self {
        self.spec.concurrency_policy = policy;
        self
    }

    pub fn with_starting_deadline(mut self, seconds: u64) -> Self {
        self.spec.starting_deadline_seconds = Some(seconds);
        self
    }
}
