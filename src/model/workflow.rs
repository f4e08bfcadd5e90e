//! Workflow instance and node records

use super::ObjectMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle status of a node or a workflow instance
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    /// Node that can never start because the workflow is failing or terminating
    Omitted,
}

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Phase::Succeeded | Phase::Failed | Phase::Error | Phase::Omitted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Succeeded => "Succeeded",
            Phase::Failed => "Failed",
            Phase::Error => "Error",
            Phase::Omitted => "Omitted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Phase::Pending),
            "Running" => Ok(Phase::Running),
            "Succeeded" => Ok(Phase::Succeeded),
            "Failed" => Ok(Phase::Failed),
            "Error" => Ok(Phase::Error),
            "Omitted" => Ok(Phase::Omitted),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

/// Resolved, executable node definition
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    /// Command with all parameters substituted
    pub run: String,
    pub depends_on: Vec<String>,
    pub retries: u32,
}

/// Concrete spec of an instance, produced by the resolver
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ResolvedSpec {
    pub entrypoint: String,
    pub parameters: BTreeMap<String, String>,
    /// Nodes in topological order, entrypoint first
    pub nodes: Vec<NodeSpec>,
}

/// Outcome payload reported for a unit of work
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct NodeOutcome {
    pub exit_code: Option<i32>,
    pub message: Option<String>,
    pub output: Option<String>,
}

impl NodeOutcome {
    pub fn exit(code: i32) -> Self {
        Self {
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Execution state of one DAG vertex
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NodeRecord {
    /// Path of the node within the DAG (`<workflow>.<step>`)
    pub path: String,
    pub name: String,
    pub phase: Phase,
    /// Predecessors that must be `Succeeded` before this node starts
    pub depends_on: Vec<String>,
    /// Current attempt, starting at 1 once the node has been started
    pub attempt: u32,
    /// Retries allowed after the first attempt
    pub retry_limit: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<NodeOutcome>,
    pub message: Option<String>,
}

impl NodeRecord {
    pub fn new(workflow_name: &str, spec: &NodeSpec) -> Self {
        Self {
            path: format!("{}.{}", workflow_name, spec.name),
            name: spec.name.clone(),
            phase: Phase::Pending,
            depends_on: spec.depends_on.clone(),
            attempt: 0,
            retry_limit: spec.retries,
            started_at: None,
            finished_at: None,
            outcome: None,
            message: None,
        }
    }

    pub fn retries_left(&self) -> bool {
        self.attempt <= self.retry_limit
    }
}

/// Observed state of an instance
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkflowStatus {
    pub phase: Phase,
    pub nodes: BTreeMap<String, NodeRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    /// Set once termination was requested; running nodes get a grace period
    pub terminating_at: Option<DateTime<Utc>>,
    /// Terminal snapshot has been written to the archive
    #[serde(default)]
    pub archived: bool,
}

/// A materialized execution of a template
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Workflow {
    pub metadata: ObjectMeta,
    pub spec: ResolvedSpec,
    pub status: WorkflowStatus,
}

impl Workflow {
    /// Build a pending instance from a resolved spec
    pub fn new(metadata: ObjectMeta, spec: ResolvedSpec) -> Self {
        let nodes = spec
            .nodes
            .iter()
            .map(|n| (n.name.clone(), NodeRecord::new(&metadata.name, n)))
            .collect();

        Self {
            metadata,
            spec,
            status: WorkflowStatus {
                nodes,
                ..Default::default()
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// UID assigned at resolution; nil only for hand-built objects
    pub fn uid(&self) -> Uuid {
        self.metadata.uid.unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.status.phase.is_terminal()
    }

    pub fn node(&self, name: &str) -> Option<&NodeRecord> {
        self.status.nodes.get(name)
    }

    /// Duration between start and finish, if both are known
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.status.started_at, self.status.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}
