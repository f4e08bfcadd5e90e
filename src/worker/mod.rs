//! Worker resource providers
//!
//! A provider runs one node's unit of work and reports the outcome on a
//! channel. Delivery is at-least-once and unordered; the controller guards
//! every transition so duplicates and stale reports are harmless.
//!
//! # Example
//!
//! ```ignore
//! use flowctl::worker::{ShellWorker, WorkerProvider, WorkRequest, WorkKey};
//!
//! let worker = ShellWorker::new(".");
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! worker.start(request, tx).await?;
//! let report = rx.recv().await;
//! ```

mod shell;

#[cfg(test)]
pub(crate) mod scripted;

pub use shell::ShellWorker;

use crate::model::{NodeOutcome, Phase};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identity of one attempt of one node
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkKey {
    pub workflow_uid: Uuid,
    pub node: String,
    pub attempt: u32,
}

impl WorkKey {
    pub fn new(workflow_uid: Uuid, node: impl Into<String>, attempt: u32) -> Self {
        Self {
            workflow_uid,
            node: node.into(),
            attempt,
        }
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.workflow_uid, self.node, self.attempt)
    }
}

/// Request to run one node attempt
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub key: WorkKey,
    pub workflow_name: String,
    pub namespace: String,
    /// Rendered shell command
    pub command: String,
}

/// Terminal status a worker can report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportedStatus {
    Succeeded,
    /// Abnormal or non-zero outcome of the work itself
    Failed,
    /// The outcome could not be determined
    Error,
}

impl From<ReportedStatus> for Phase {
    fn from(status: ReportedStatus) -> Self {
        match status {
            ReportedStatus::Succeeded => Phase::Succeeded,
            ReportedStatus::Failed => Phase::Failed,
            ReportedStatus::Error => Phase::Error,
        }
    }
}

/// Outcome report for one node attempt
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub key: WorkKey,
    pub status: ReportedStatus,
    pub outcome: NodeOutcome,
}

impl WorkerReport {
    pub fn new(key: WorkKey, status: ReportedStatus, outcome: NodeOutcome) -> Self {
        Self {
            key,
            status,
            outcome,
        }
    }
}

/// Channel on which providers deliver reports
pub type ReportSender = mpsc::UnboundedSender<WorkerReport>;

/// Receiving side of [`ReportSender`]
pub type ReportReceiver = mpsc::UnboundedReceiver<WorkerReport>;

/// Current state of a unit of work, as seen by polling
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Running,
    Finished(WorkerReport),
    /// The provider has no record of the work
    Vanished,
}

/// Errors from worker providers
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Provider cannot be reached right now
    #[error("worker provider unavailable: {message}")]
    Unavailable { message: String },

    /// Provider rejected the request
    #[error("worker fault: {message}")]
    Fault { message: String },
}

impl WorkerError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Unavailable { .. })
    }
}

/// Trait for providers that execute node work
#[async_trait]
pub trait WorkerProvider: Send + Sync {
    /// Get the provider name
    fn name(&self) -> &str;

    /// Start work for `request.key`; starting a key twice is a no-op
    async fn start(&self, request: WorkRequest, reports: ReportSender) -> Result<(), WorkerError>;

    /// Poll the state of a previously started unit of work
    async fn observe(&self, key: &WorkKey) -> Result<Observation, WorkerError>;

    /// Ask a unit of work to stop; unknown or finished keys are ignored
    async fn cancel(&self, key: &WorkKey) -> Result<(), WorkerError>;

    /// Drop bookkeeping for a settled key
    async fn forget(&self, _key: &WorkKey) {}
}
