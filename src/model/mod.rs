//! Object model shared by the resolver, controller, scheduler and stores
//!
//! Three kinds of user-declared objects exist:
//! - `WorkflowTemplate`: a reusable DAG of shell steps with default parameters
//! - `CronWorkflow`: a workflow spec wrapped with a schedule and concurrency policy
//! - `Workflow`: a concrete, executing instance produced by the resolver
//!
//! User objects are written as TOML manifests tagged by `kind`.

mod cron;
mod template;
mod workflow;

pub use cron::{ActiveWorkflowRef, ConcurrencyPolicy, CronWorkflow, CronWorkflowSpec, CronWorkflowStatus};
pub use template::{Manifest, ParameterDef, StepTemplate, WorkflowSpec, WorkflowTemplate};
pub use workflow::{
    NodeOutcome, NodeRecord, NodeSpec, Phase, ResolvedSpec, Workflow, WorkflowStatus,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Label set on instances created from a workflow template
pub const LABEL_WORKFLOW_TEMPLATE: &str = "flowctl/workflow-template";

/// Label set on instances created by a cron workflow
pub const LABEL_CRON_WORKFLOW: &str = "flowctl/cron-workflow";

/// Metadata carried by every stored object
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ObjectMeta {
    /// Object name (unique within a namespace and kind)
    pub name: String,

    /// Owning namespace; empty means "use the configured default"
    #[serde(default)]
    pub namespace: String,

    /// Free-form labels used for filtering
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Unique identifier, assigned to workflow instances at resolution time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uuid>,

    /// Store revision for optimistic concurrency; 0 means never stored
    #[serde(default)]
    pub revision: u64,

    /// Creation timestamp, set by the store on create
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Create metadata with just a name and namespace
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Fill in the namespace if the manifest left it empty
    pub fn default_namespace(&mut self, namespace: &str) {
        if self.namespace.is_empty() {
            self.namespace = namespace.to_string();
        }
    }
}
