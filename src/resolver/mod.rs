//! Template resolution
//!
//! Expands a template reference plus caller overrides into a concrete,
//! executable [`Workflow`]. Resolution performs no I/O and never waits; a
//! failed resolution creates nothing.
//!
//! # Example
//!
//! ```ignore
//! use flowctl::resolver::{Resolver, SubmitOptions, TemplateRef};
//!
//! let resolver = Resolver::new();
//! let opts = SubmitOptions::default()
//!     .with_entrypoint("whalesay-template")
//!     .with_parameter("message", "TEST");
//! let wf = resolver.resolve(TemplateRef::WorkflowTemplate(&template), &opts)?;
//! ```

mod dag;
mod render;

pub use dag::{descendants, select, topological_order};
pub use render::{CommandRenderer, RenderContext};

use crate::model::{
    CronWorkflow, LABEL_CRON_WORKFLOW, LABEL_WORKFLOW_TEMPLATE, NodeSpec, ObjectMeta,
    ResolvedSpec, Workflow, WorkflowSpec, WorkflowTemplate,
};
use rand::Rng;
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

const NAME_SUFFIX_LEN: usize = 5;
const NAME_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Errors raised while resolving a template
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ResolveError {
    #[error("{hint}")]
    MissingEntrypoint { template: String, hint: String },

    #[error("entrypoint '{entrypoint}' is not a step of '{template}'")]
    UnknownEntrypoint { template: String, entrypoint: String },

    #[error("unknown parameter '{name}' for '{template}'")]
    UnknownParameter { template: String, name: String },

    #[error("parameter '{name}' of '{template}' is required and has no default")]
    MissingParameter { template: String, name: String },

    #[error("dependency deadlock at step '{step}': {reason}")]
    DependencyDeadlock { step: String, reason: String },

    #[error("invalid template '{template}': {}", errors.join("; "))]
    InvalidTemplate { template: String, errors: Vec<String> },

    #[error("failed to render step '{step}': {message}")]
    Render { step: String, message: String },
}

/// Source a workflow instance is resolved from
#[derive(Debug, Clone, Copy)]
pub enum TemplateRef<'a> {
    /// A bare workflow manifest, submitted directly
    Workflow(&'a WorkflowTemplate),
    /// A stored, reusable template; the caller must name an entrypoint
    WorkflowTemplate(&'a WorkflowTemplate),
    /// The workflow spec wrapped by a cron workflow
    CronWorkflow(&'a CronWorkflow),
}

impl<'a> TemplateRef<'a> {
    pub fn kind(&self) -> &'static str {
        match self {
            TemplateRef::Workflow(_) => "Workflow",
            TemplateRef::WorkflowTemplate(_) => "WorkflowTemplate",
            TemplateRef::CronWorkflow(_) => "CronWorkflow",
        }
    }

    pub fn metadata(&self) -> &'a ObjectMeta {
        match self {
            TemplateRef::Workflow(t) | TemplateRef::WorkflowTemplate(t) => &t.metadata,
            TemplateRef::CronWorkflow(c) => &c.metadata,
        }
    }

    pub fn spec(&self) -> &'a WorkflowSpec {
        match self {
            TemplateRef::Workflow(t) | TemplateRef::WorkflowTemplate(t) => &t.spec,
            TemplateRef::CronWorkflow(c) => &c.spec.workflow_spec,
        }
    }
}

/// Caller-supplied overrides
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Root step; mandatory for `WorkflowTemplate` sources
    pub entrypoint: Option<String>,

    /// Parameter overrides by name
    pub parameters: BTreeMap<String, String>,

    /// Namespace for the instance; defaults to the source's namespace
    pub namespace: Option<String>,

    /// Extra labels for the instance
    pub labels: BTreeMap<String, String>,
}

impl SubmitOptions {
    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = Some(entrypoint.into());
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Parse `name=value` pairs as given on the command line
    pub fn parse_parameters(pairs: &[String]) -> Result<BTreeMap<String, String>, String> {
        pairs
            .iter()
            .map(|pair| match pair.split_once('=') {
                Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
                _ => Err(format!("parameter '{}' is not in name=value form", pair)),
            })
            .collect()
    }
}

/// Append a random lowercase alphanumeric suffix to `base`
pub fn generate_name(base: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..NAME_SUFFIX_LEN)
        .map(|_| {
            let idx = rng.random_range(0..NAME_SUFFIX_ALPHABET.len());
            NAME_SUFFIX_ALPHABET[idx] as char
        })
        .collect();
    format!("{}-{}", base, suffix)
}

/// Turns template references into concrete workflow instances
#[derive(Default)]
pub struct Resolver {
    renderer: CommandRenderer,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            renderer: CommandRenderer::new(),
        }
    }

    /// Resolve a template reference into a new pending instance
    pub fn resolve(
        &self,
        source: TemplateRef<'_>,
        opts: &SubmitOptions,
    ) -> Result<Workflow, ResolveError> {
        let meta = source.metadata();
        let spec = source.spec();
        let template = meta.name.as_str();

        if let Err(errors) = spec.validate() {
            return Err(ResolveError::InvalidTemplate {
                template: template.to_string(),
                errors,
            });
        }

        let entrypoint = self.entrypoint(source, opts)?;
        if spec.step(&entrypoint).is_none() {
            return Err(ResolveError::UnknownEntrypoint {
                template: template.to_string(),
                entrypoint,
            });
        }

        let parameters = resolve_parameters(template, spec, &opts.parameters)?;
        let steps = dag::select(spec, &entrypoint)?;

        let name = match source {
            TemplateRef::Workflow(_) => meta.name.clone(),
            TemplateRef::WorkflowTemplate(_) | TemplateRef::CronWorkflow(_) => {
                generate_name(&meta.name)
            }
        };
        let namespace = opts
            .namespace
            .clone()
            .unwrap_or_else(|| meta.namespace.clone());
        let uid = Uuid::new_v4();

        let ctx = RenderContext {
            name: &name,
            namespace: &namespace,
            uid,
            parameters: &parameters,
        };
        let mut nodes = Vec::with_capacity(steps.len());
        for step in steps {
            let run = self
                .renderer
                .render(&step.run, &ctx)
                .map_err(|message| ResolveError::Render {
                    step: step.name.clone(),
                    message,
                })?;
            nodes.push(NodeSpec {
                name: step.name.clone(),
                run,
                depends_on: step.depends_on.clone(),
                retries: step.retries,
            });
        }

        let mut labels = meta.labels.clone();
        match source {
            TemplateRef::Workflow(_) => {}
            TemplateRef::WorkflowTemplate(_) => {
                labels.insert(LABEL_WORKFLOW_TEMPLATE.to_string(), meta.name.clone());
            }
            TemplateRef::CronWorkflow(_) => {
                labels.insert(LABEL_CRON_WORKFLOW.to_string(), meta.name.clone());
            }
        }
        labels.extend(opts.labels.clone());

        tracing::debug!(
            source = source.kind(),
            template,
            workflow = %name,
            %entrypoint,
            nodes = nodes.len(),
            "Resolved workflow"
        );

        let metadata = ObjectMeta {
            name,
            namespace,
            labels,
            uid: Some(uid),
            revision: 0,
            created_at: None,
        };

        Ok(Workflow::new(
            metadata,
            ResolvedSpec {
                entrypoint,
                parameters,
                nodes,
            },
        ))
    }

    /// Validate a spec the way resolution would, collecting every problem
    pub fn lint(&self, spec: &WorkflowSpec) -> Result<(), Vec<String>> {
        let mut errors = spec.validate().err().unwrap_or_default();
        if let Err(e) = dag::topological_order(&spec.steps) {
            errors.push(e.to_string());
        }
        if let Some(ref entrypoint) = spec.entrypoint {
            if spec.step(entrypoint).is_some() {
                if let Err(e) = dag::select(spec, entrypoint) {
                    let msg = e.to_string();
                    if !errors.contains(&msg) {
                        errors.push(msg);
                    }
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn entrypoint(
        &self,
        source: TemplateRef<'_>,
        opts: &SubmitOptions,
    ) -> Result<String, ResolveError> {
        let template = source.metadata().name.clone();

        if let Some(ref entrypoint) = opts.entrypoint {
            return Ok(entrypoint.clone());
        }

        match source {
            TemplateRef::WorkflowTemplate(_) => Err(ResolveError::MissingEntrypoint {
                template,
                hint: "When submitting a Workflow from a WorkflowTemplate an entrypoint must be passed with --entrypoint".into(),
            }),
            TemplateRef::Workflow(_) | TemplateRef::CronWorkflow(_) => {
                source.spec().entrypoint.clone().ok_or_else(|| {
                    ResolveError::MissingEntrypoint {
                        hint: format!(
                            "{} '{}' has no spec.entrypoint; pass one with --entrypoint",
                            source.kind(),
                            template
                        ),
                        template,
                    }
                })
            }
        }
    }
}

/// Merge overrides onto declared defaults
fn resolve_parameters(
    template: &str,
    spec: &WorkflowSpec,
    overrides: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ResolveError> {
    for name in overrides.keys() {
        if spec.parameter(name).is_none() {
            return Err(ResolveError::UnknownParameter {
                template: template.to_string(),
                name: name.clone(),
            });
        }
    }

    let mut resolved = BTreeMap::new();
    for param in &spec.parameters {
        let value = overrides
            .get(&param.name)
            .or(param.default.as_ref())
            .ok_or_else(|| ResolveError::MissingParameter {
                template: template.to_string(),
                name: param.name.clone(),
            })?;
        resolved.insert(param.name.clone(), value.clone());
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ParameterDef, Phase, StepTemplate};

    fn whalesay_template() -> WorkflowTemplate {
        WorkflowTemplate::new(
            "workflow-template-whalesay-template",
            "argo",
            WorkflowSpec {
                entrypoint: None,
                parameters: vec![ParameterDef {
                    name: "message".into(),
                    default: None,
                    description: String::new(),
                }],
                steps: vec![StepTemplate::new(
                    "whalesay-template",
                    "echo {{ workflow.parameters.message }}",
                )],
            },
        )
    }

    fn basic_workflow() -> WorkflowTemplate {
        WorkflowTemplate::new(
            "basic",
            "argo",
            WorkflowSpec {
                entrypoint: Some("hello".into()),
                parameters: vec![ParameterDef {
                    name: "greeting".into(),
                    default: Some("hello".into()),
                    description: String::new(),
                }],
                steps: vec![
                    StepTemplate::new("hello", "echo {{ workflow.parameters.greeting }}"),
                    StepTemplate::new("world", "echo world").depends_on(&["hello"]),
                ],
            },
        )
    }

    #[test]
    fn test_workflow_template_requires_entrypoint() {
        let resolver = Resolver::new();
        let template = whalesay_template();
        let opts = SubmitOptions::default().with_parameter("message", "TEST");

        let err = resolver
            .resolve(TemplateRef::WorkflowTemplate(&template), &opts)
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingEntrypoint { .. }));
        assert!(err.to_string().contains("--entrypoint"));
    }

    #[test]
    fn test_workflow_template_with_entrypoint() {
        let resolver = Resolver::new();
        let template = whalesay_template();
        let opts = SubmitOptions::default()
            .with_entrypoint("whalesay-template")
            .with_parameter("message", "TEST");

        let wf = resolver
            .resolve(TemplateRef::WorkflowTemplate(&template), &opts)
            .unwrap();

        assert_eq!(wf.spec.entrypoint, "whalesay-template");
        assert_eq!(wf.spec.nodes[0].name, "whalesay-template");
        assert_eq!(wf.spec.nodes[0].run, "echo TEST");
        assert_eq!(wf.phase(), Phase::Pending);
        assert_eq!(wf.namespace(), "argo");
        assert!(wf.metadata.uid.is_some());
        assert_eq!(
            wf.metadata.labels.get(LABEL_WORKFLOW_TEMPLATE).map(String::as_str),
            Some("workflow-template-whalesay-template")
        );

        let suffix = wf
            .name()
            .strip_prefix("workflow-template-whalesay-template-")
            .unwrap();
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(
            suffix
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let resolver = Resolver::new();
        let template = whalesay_template();
        let opts = SubmitOptions::default()
            .with_entrypoint("whalesay-template")
            .with_parameter("message", "TEST")
            .with_parameter("colour", "red");

        let err = resolver
            .resolve(TemplateRef::WorkflowTemplate(&template), &opts)
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownParameter {
                template: "workflow-template-whalesay-template".into(),
                name: "colour".into(),
            }
        );
    }

    #[test]
    fn test_missing_required_parameter() {
        let resolver = Resolver::new();
        let template = whalesay_template();
        let opts = SubmitOptions::default().with_entrypoint("whalesay-template");

        let err = resolver
            .resolve(TemplateRef::WorkflowTemplate(&template), &opts)
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingParameter { ref name, .. } if name == "message"));
    }

    #[test]
    fn test_bare_workflow_keeps_name_and_defaults() {
        let resolver = Resolver::new();
        let template = basic_workflow();

        let wf = resolver
            .resolve(TemplateRef::Workflow(&template), &SubmitOptions::default())
            .unwrap();

        assert_eq!(wf.name(), "basic");
        assert_eq!(wf.spec.entrypoint, "hello");
        assert_eq!(wf.spec.parameters.get("greeting").unwrap(), "hello");
        assert_eq!(wf.spec.nodes.len(), 2);
        assert_eq!(wf.node("world").unwrap().depends_on, vec!["hello".to_string()]);
        assert!(!wf.metadata.labels.contains_key(LABEL_WORKFLOW_TEMPLATE));
    }

    #[test]
    fn test_override_replaces_default() {
        let resolver = Resolver::new();
        let template = basic_workflow();
        let opts = SubmitOptions::default().with_parameter("greeting", "hi");

        let wf = resolver
            .resolve(TemplateRef::Workflow(&template), &opts)
            .unwrap();
        assert_eq!(wf.spec.nodes[0].run, "echo hi");
    }

    #[test]
    fn test_entrypoint_selects_subgraph() {
        let resolver = Resolver::new();
        let template = basic_workflow();
        let opts = SubmitOptions::default().with_entrypoint("world");

        let wf = resolver
            .resolve(TemplateRef::Workflow(&template), &opts)
            .unwrap_err();
        // world depends on hello, which is upstream of the entrypoint
        assert!(matches!(wf, ResolveError::DependencyDeadlock { .. }));
    }

    #[test]
    fn test_unknown_entrypoint() {
        let resolver = Resolver::new();
        let template = basic_workflow();
        let opts = SubmitOptions::default().with_entrypoint("nope");

        let err = resolver
            .resolve(TemplateRef::Workflow(&template), &opts)
            .unwrap_err();
        assert!(matches!(err, ResolveError::UnknownEntrypoint { .. }));
    }

    #[test]
    fn test_cyclic_template_rejected() {
        let resolver = Resolver::new();
        let template = WorkflowTemplate::new(
            "cyclic",
            "argo",
            WorkflowSpec {
                entrypoint: Some("a".into()),
                parameters: vec![],
                steps: vec![
                    StepTemplate::new("a", "true").depends_on(&["b"]),
                    StepTemplate::new("b", "true").depends_on(&["a"]),
                ],
            },
        );

        let err = resolver
            .resolve(TemplateRef::Workflow(&template), &SubmitOptions::default())
            .unwrap_err();
        assert!(matches!(err, ResolveError::DependencyDeadlock { .. }));
    }

    #[test]
    fn test_cron_source_generates_name_and_label() {
        let resolver = Resolver::new();
        let cron = CronWorkflow::new(
            "test-cron-wf-basic",
            "argo",
            "* * * * *",
            basic_workflow().spec,
        );

        let wf = resolver
            .resolve(TemplateRef::CronWorkflow(&cron), &SubmitOptions::default())
            .unwrap();
        assert!(wf.name().starts_with("test-cron-wf-basic-"));
        assert_eq!(
            wf.metadata.labels.get(LABEL_CRON_WORKFLOW).map(String::as_str),
            Some("test-cron-wf-basic")
        );
    }

    #[test]
    fn test_generated_names_differ() {
        let a = generate_name("wf");
        let b = generate_name("wf");
        assert!(a.starts_with("wf-"));
        // 36^5 possibilities; a clash here is vanishingly unlikely
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_parameters() {
        let parsed =
            SubmitOptions::parse_parameters(&["message=TEST".into(), "eq=a=b".into()]).unwrap();
        assert_eq!(parsed.get("message").unwrap(), "TEST");
        assert_eq!(parsed.get("eq").unwrap(), "a=b");
        assert!(SubmitOptions::parse_parameters(&["novalue".into()]).is_err());
    }

    #[test]
    fn test_lint_collects_problems() {
        let resolver = Resolver::new();
        let spec = WorkflowSpec {
            entrypoint: Some("a".into()),
            parameters: vec![],
            steps: vec![
                StepTemplate::new("a", "true").depends_on(&["b"]),
                StepTemplate::new("b", "true").depends_on(&["a", "ghost"]),
            ],
        };
        let errors = resolver.lint(&spec).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("ghost")));
        assert!(errors.iter().any(|e| e.contains("cycle")));

        assert!(resolver.lint(&basic_workflow().spec).is_ok());
    }
}
