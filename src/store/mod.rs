//! Persistent stores for live objects and archived workflows

mod archive;
mod schema;
mod sqlite;

pub use archive::WorkflowArchive;
pub use sqlite::SqliteStore;

use crate::model::{CronWorkflow, Workflow, WorkflowTemplate};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Kind names used in error messages
pub const KIND_WORKFLOW: &str = "workflow";
pub const KIND_TEMPLATE: &str = "workflowtemplate";
pub const KIND_CRON: &str = "cronworkflow";
pub const KIND_ARCHIVED: &str = "archived workflow";

/// Errors from the live instance store and the archive
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} \"{name}\" not found")]
    NotFound { kind: &'static str, name: String },

    /// Retryable by the caller with a fresh generated name
    #[error("{kind} \"{name}\" already exists")]
    NameCollision { kind: &'static str, name: String },

    /// Optimistic revision check failed
    #[error("{kind} \"{name}\" was modified concurrently (expected revision {expected}, found {actual})")]
    Conflict {
        kind: &'static str,
        name: String,
        expected: u64,
        actual: u64,
    },

    #[error("workflow \"{name}\" is not in a terminal phase")]
    NotTerminal { name: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub(crate) fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind,
            name: name.into(),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage {
            message: e.to_string(),
        }
    }
}

/// Filters for listing archived workflows
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub namespace: Option<String>,
    pub name_prefix: Option<String>,
    /// Every entry must match exactly
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Default::default()
        }
    }

    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Parse `key=value` selectors as given on the command line
    pub fn parse_labels(selector: &str) -> Result<BTreeMap<String, String>, String> {
        selector
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => {
                    Ok((k.trim().to_string(), v.trim().to_string()))
                }
                _ => Err(format!("label selector '{}' is not in key=value form", pair)),
            })
            .collect()
    }
}

/// Durable storage for live workflows, templates and cron workflows
///
/// Every update carries the revision the caller read; a mismatch fails with
/// [`StoreError::Conflict`]. Returned objects carry their new revision.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Create a workflow; re-creating the same UID returns the stored copy
    async fn create_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError>;
    async fn get_workflow(&self, uid: Uuid) -> Result<Workflow, StoreError>;
    async fn get_workflow_by_name(&self, namespace: &str, name: &str)
    -> Result<Workflow, StoreError>;
    /// Newest first; `None` lists every namespace
    async fn list_workflows(&self, namespace: Option<&str>) -> Result<Vec<Workflow>, StoreError>;
    async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError>;
    async fn delete_workflow(&self, uid: Uuid) -> Result<(), StoreError>;

    async fn create_template(&self, template: &WorkflowTemplate)
    -> Result<WorkflowTemplate, StoreError>;
    async fn get_template(&self, namespace: &str, name: &str)
    -> Result<WorkflowTemplate, StoreError>;
    async fn list_templates(&self, namespace: Option<&str>)
    -> Result<Vec<WorkflowTemplate>, StoreError>;
    async fn delete_template(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn create_cron(&self, cron: &CronWorkflow) -> Result<CronWorkflow, StoreError>;
    async fn get_cron(&self, namespace: &str, name: &str) -> Result<CronWorkflow, StoreError>;
    async fn list_crons(&self, namespace: Option<&str>) -> Result<Vec<CronWorkflow>, StoreError>;
    async fn update_cron(&self, cron: &CronWorkflow) -> Result<CronWorkflow, StoreError>;
    async fn delete_cron(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}

/// Immutable history of terminal workflows, keyed by UID
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Store a terminal snapshot; a second put for the same UID is a no-op
    async fn put(&self, workflow: &Workflow) -> Result<(), StoreError>;
    async fn get(&self, uid: Uuid) -> Result<Workflow, StoreError>;
    /// Matching snapshots, most recently finished first
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Workflow>, StoreError>;
    async fn delete(&self, uid: Uuid) -> Result<(), StoreError>;
}
