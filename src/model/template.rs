//! Workflow template and manifest types

use super::{CronWorkflow, ObjectMeta};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Parameter declared by a workflow spec
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ParameterDef {
    /// Parameter name, referenced as `workflow.parameters.<name>`
    pub name: String,

    /// Default value; a parameter without one is required
    pub default: Option<String>,

    /// Description for help text
    #[serde(default)]
    pub description: String,
}

/// One step of a workflow DAG
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct StepTemplate {
    /// Step name (unique within the spec)
    pub name: String,

    /// Shell command, rendered with the workflow context before execution
    pub run: String,

    /// Steps that must succeed before this one may start
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Times a failed attempt is re-queued before the node settles
    #[serde(default)]
    pub retries: u32,
}

impl StepTemplate {
    pub fn new(name: impl Into<String>, run: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: run.into(),
            depends_on: Vec::new(),
            retries: 0,
        }
    }

    pub fn depends_on(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// DAG specification shared by bare workflows, templates and cron workflows
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WorkflowSpec {
    /// Default root step; reusable templates usually leave this empty
    pub entrypoint: Option<String>,

    /// Declared parameters with optional defaults
    #[serde(default)]
    pub parameters: Vec<ParameterDef>,

    /// Steps of the DAG
    #[serde(default)]
    pub steps: Vec<StepTemplate>,
}

impl WorkflowSpec {
    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&StepTemplate> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Look up a parameter declaration by name
    pub fn parameter(&self, name: &str) -> Option<&ParameterDef> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Structural validation; cycles are checked by the resolver
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.steps.is_empty() {
            errors.push("spec has no steps".to_string());
        }

        let mut seen_names = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                errors.push("step with empty name".to_string());
            }
            if !seen_names.insert(step.name.as_str()) {
                errors.push(format!("duplicate step name: {}", step.name));
            }
            if step.run.trim().is_empty() {
                errors.push(format!("step '{}' missing 'run' command", step.name));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen_names.contains(dep.as_str()) {
                    errors.push(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    ));
                }
                if dep == &step.name {
                    errors.push(format!("step '{}' depends on itself", step.name));
                }
            }
        }

        let mut seen_params = HashSet::new();
        for param in &self.parameters {
            if !seen_params.insert(param.name.as_str()) {
                errors.push(format!("duplicate parameter: {}", param.name));
            }
        }

        if let Some(ref entrypoint) = self.entrypoint {
            if !seen_names.contains(entrypoint.as_str()) {
                errors.push(format!("entrypoint '{}' is not a step", entrypoint));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// A named, namespaced DAG specification
///
/// The same shape backs both `kind = "WorkflowTemplate"` (stored, reusable)
/// and `kind = "Workflow"` (submitted directly) manifests.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorkflowTemplate {
    pub metadata: ObjectMeta,
    pub spec: WorkflowSpec,
}

impl WorkflowTemplate {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: WorkflowSpec) -> Self {
        Self {
            metadata: ObjectMeta::named(name, namespace),
            spec,
        }
    }
}

/// A manifest file, tagged by `kind`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum Manifest {
    Workflow(WorkflowTemplate),
    WorkflowTemplate(WorkflowTemplate),
    CronWorkflow(CronWorkflow),
}

impl Manifest {
    /// Parse a TOML manifest
    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Kind name as written in manifests
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Workflow(_) => "Workflow",
            Manifest::WorkflowTemplate(_) => "WorkflowTemplate",
            Manifest::CronWorkflow(_) => "CronWorkflow",
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Manifest::Workflow(t) | Manifest::WorkflowTemplate(t) => &t.metadata.name,
            Manifest::CronWorkflow(c) => &c.metadata.name,
        }
    }

    /// The DAG spec carried by the manifest
    pub fn spec(&self) -> &WorkflowSpec {
        match self {
            Manifest::Workflow(t) | Manifest::WorkflowTemplate(t) => &t.spec,
            Manifest::CronWorkflow(c) => &c.spec.workflow_spec,
        }
    }
}
