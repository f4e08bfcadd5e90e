//! Error type of the public engine API

use crate::cron::ScheduleError;
use crate::resolver::ResolveError;
use crate::store::StoreError;
use crate::worker::WorkerError;
use thiserror::Error;

/// Errors surfaced by the controller and scheduler
///
/// Execution-time faults never show up here: they are recorded as node and
/// workflow phases instead.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    /// Observation kept failing after every retry
    #[error("could not observe node '{node}' of workflow '{workflow}': {message}")]
    TransientObservationFailure {
        workflow: String,
        node: String,
        message: String,
    },

    #[error("controller loop is already running")]
    AlreadyRunning,

    #[error("timed out waiting for workflow \"{name}\"")]
    Timeout { name: String },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_not_found())
    }
}
