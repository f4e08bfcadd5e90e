//! CLI command implementations

use super::output::OutputHandler;
use crate::config::EngineConfig;
use crate::cron::{self, CronScheduler};
use crate::engine::WorkflowController;
use crate::model::{Manifest, Phase, Workflow};
use crate::resolver::{Resolver, SubmitOptions, TemplateRef};
use crate::retry::RetryPolicy;
use crate::signals::{CancellationToken, with_cancellation};
use crate::store::{ArchiveStore, InstanceStore, ListFilter, SqliteStore, WorkflowArchive};
use crate::worker::{ShellWorker, WorkerProvider};
use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const DEFAULT_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// Controller and scheduler wired to one set of stores
pub struct Engine {
    pub controller: Arc<WorkflowController>,
    pub scheduler: Arc<CronScheduler>,
}

impl Engine {
    /// Open the configured database and run nodes with the shell worker
    pub fn open(config: &EngineConfig, working_dir: &Path) -> Result<Self> {
        let db_path = config.store.database_path()?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let store = SqliteStore::open(&db_path)
            .with_context(|| format!("opening {}", db_path.display()))?;
        let archive = WorkflowArchive::open(&db_path, RetryPolicy::from_config(&config.retry))
            .with_context(|| format!("opening archive {}", db_path.display()))?;
        let worker_dir = config
            .controller
            .working_dir
            .as_deref()
            .map(|d| std::path::PathBuf::from(shellexpand::tilde(d).as_ref()))
            .unwrap_or_else(|| working_dir.to_path_buf());

        Ok(Self::from_parts(
            Arc::new(store),
            Arc::new(archive),
            Arc::new(ShellWorker::new(worker_dir)),
            config,
        ))
    }

    pub fn from_parts(
        store: Arc<dyn InstanceStore>,
        archive: Arc<dyn ArchiveStore>,
        worker: Arc<dyn WorkerProvider>,
        config: &EngineConfig,
    ) -> Self {
        let controller = Arc::new(WorkflowController::new(store, archive, worker, config));
        let scheduler = Arc::new(CronScheduler::new(controller.clone(), config.cron.clone()));
        Self {
            controller,
            scheduler,
        }
    }
}

/// Where a submission comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    WorkflowTemplate(String),
    CronWorkflow(String),
}

/// Parse `workflowtemplate/<name>` or `cronworkflow/<name>`
pub fn parse_source(source: &str) -> Result<SourceRef> {
    let (kind, name) = source
        .split_once('/')
        .with_context(|| format!("'{}' is not in kind/name form", source))?;
    if name.trim().is_empty() {
        bail!("'{}' has an empty name", source);
    }
    match kind.to_lowercase().as_str() {
        "workflowtemplate" | "wftmpl" => Ok(SourceRef::WorkflowTemplate(name.to_string())),
        "cronworkflow" | "cronwf" | "cwf" => Ok(SourceRef::CronWorkflow(name.to_string())),
        other => bail!(
            "unsupported source kind '{}' (expected workflowtemplate or cronworkflow)",
            other
        ),
    }
}

/// Read and parse a manifest file
pub fn load_manifest(path: &Path) -> Result<Manifest> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Manifest::from_toml(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// What to submit and how
#[derive(Debug, Clone, Default)]
pub struct SubmitArgs {
    pub file: Option<std::path::PathBuf>,
    pub from: Option<String>,
    pub entrypoint: Option<String>,
    pub parameters: Vec<String>,
    pub namespace: Option<String>,
    pub timeout: Option<Duration>,
}

/// Submit a workflow and drive it to completion
///
/// Nodes run in this process, so the command keeps the controller loop
/// alive until the instance is terminal, the timeout passes, or the token
/// is cancelled.
pub async fn submit(
    engine: &Engine,
    args: SubmitArgs,
    token: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let mut opts = SubmitOptions {
        entrypoint: args.entrypoint.clone(),
        parameters: SubmitOptions::parse_parameters(&args.parameters)
            .map_err(|e| anyhow::anyhow!(e))?,
        namespace: args.namespace.clone(),
        ..Default::default()
    };
    let namespace = args
        .namespace
        .clone()
        .unwrap_or_else(|| engine.controller.default_namespace().to_string());

    let controller = engine.controller.clone();
    let loop_token = token.clone();
    let controller_loop = tokio::spawn(async move { controller.run(loop_token).await });

    let submitted: Result<Workflow> = async {
        let wf = match (&args.file, &args.from) {
            (Some(path), None) => match load_manifest(path)? {
                Manifest::Workflow(ref wf) => {
                    engine
                        .controller
                        .submit(TemplateRef::Workflow(wf), &opts)
                        .await?
                }
                Manifest::WorkflowTemplate(ref t) => {
                    engine
                        .controller
                        .submit(TemplateRef::WorkflowTemplate(t), &opts)
                        .await?
                }
                Manifest::CronWorkflow(ref c) => {
                    engine
                        .controller
                        .submit(TemplateRef::CronWorkflow(c), &opts)
                        .await?
                }
            },
            (None, Some(source)) => {
                opts.namespace = Some(namespace.clone());
                match parse_source(source)? {
                    SourceRef::WorkflowTemplate(name) => {
                        engine
                            .controller
                            .submit_template(&namespace, &name, &opts)
                            .await?
                    }
                    SourceRef::CronWorkflow(name) => {
                        engine.controller.submit_cron(&namespace, &name, &opts).await?
                    }
                }
            }
            (Some(_), Some(_)) => bail!("give either a manifest file or --from, not both"),
            (None, None) => bail!("nothing to submit: give a manifest file or --from kind/name"),
        };
        Ok(wf)
    }
    .await;

    let wf = match submitted {
        Ok(wf) => wf,
        Err(e) => {
            token.cancel();
            let _ = controller_loop.await;
            return Err(e);
        }
    };
    handler.info(&format!("Workflow {} submitted", wf.name()));

    let wait = engine
        .controller
        .wait_for_completion(wf.uid(), args.timeout.unwrap_or(DEFAULT_WAIT));
    let finished = with_cancellation(&token, wait).await;

    token.cancel();
    controller_loop
        .await
        .context("controller loop panicked")??;

    let wf = match finished {
        Some(result) => result?,
        None => {
            handler.info("Interrupted; the workflow was left running");
            engine.controller.get_by_uid(wf.uid()).await?
        }
    };
    handler.workflow(&wf);
    Ok(exit_code(&wf))
}

fn exit_code(wf: &Workflow) -> i32 {
    if wf.phase() == Phase::Succeeded { 0 } else { 1 }
}

pub async fn list_workflows(
    engine: &Engine,
    namespace: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let wfs = engine.controller.list(namespace).await?;
    handler.workflows(&wfs);
    Ok(0)
}

pub async fn get_workflow(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let wf = engine.controller.get(namespace, name).await?;
    handler.workflow(&wf);
    Ok(0)
}

pub async fn delete_workflow(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    engine.controller.delete(namespace, name).await?;
    handler.info(&format!("Workflow '{}' deleted", name));
    Ok(0)
}

pub async fn terminate_workflow(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let wf = engine.controller.terminate(namespace, name).await?;
    handler.info(&format!("Workflow '{}' terminating", name));
    handler.workflow(&wf);
    Ok(0)
}

/// Lint a manifest file, reporting every problem found
pub fn lint_manifest(path: &Path, handler: &dyn OutputHandler) -> Result<i32> {
    let manifest = match load_manifest(path) {
        Ok(m) => m,
        Err(e) => {
            handler.info(&format!("✗ {:#}", e));
            return Ok(1);
        }
    };

    let mut errors = match manifest {
        Manifest::CronWorkflow(ref c) => cron::lint(c).err().unwrap_or_default(),
        Manifest::Workflow(_) | Manifest::WorkflowTemplate(_) => Vec::new(),
    };
    if let Err(spec_errors) = Resolver::new().lint(manifest.spec()) {
        for e in spec_errors {
            if !errors.contains(&e) {
                errors.push(e);
            }
        }
    }
    if manifest.name().trim().is_empty() && !errors.iter().any(|e| e.contains("metadata.name")) {
        errors.push("metadata.name is required".to_string());
    }

    if errors.is_empty() {
        handler.info(&format!(
            "✓ {} '{}' validated ({} steps)",
            manifest.kind(),
            manifest.name(),
            manifest.spec().steps.len()
        ));
        Ok(0)
    } else {
        handler.info(&format!(
            "✗ {} '{}' has {} error(s):",
            manifest.kind(),
            manifest.name(),
            errors.len()
        ));
        for err in &errors {
            handler.info(&format!("  - {}", err));
        }
        Ok(1)
    }
}

pub async fn create_template(
    engine: &Engine,
    path: &Path,
    namespace: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let Manifest::WorkflowTemplate(mut template) = load_manifest(path)? else {
        bail!("{} is not a WorkflowTemplate manifest", path.display());
    };
    if let Err(errors) = Resolver::new().lint(&template.spec) {
        bail!(
            "invalid template '{}':\n  {}",
            template.metadata.name,
            errors.join("\n  ")
        );
    }
    if let Some(ns) = namespace {
        template.metadata.namespace = ns.to_string();
    }
    template
        .metadata
        .default_namespace(engine.controller.default_namespace());
    template.metadata.created_at = Some(engine.controller.now());

    let created = engine.controller.store().create_template(&template).await?;
    handler.template(&created);
    Ok(0)
}

pub async fn list_templates(
    engine: &Engine,
    namespace: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let templates = engine.controller.store().list_templates(namespace).await?;
    handler.templates(&templates);
    Ok(0)
}

pub async fn get_template(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let template = engine.controller.store().get_template(namespace, name).await?;
    handler.template(&template);
    Ok(0)
}

pub async fn delete_template(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    engine
        .controller
        .store()
        .delete_template(namespace, name)
        .await?;
    handler.info(&format!("WorkflowTemplate '{}' deleted", name));
    Ok(0)
}

pub async fn create_cron(
    engine: &Engine,
    path: &Path,
    namespace: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let Manifest::CronWorkflow(mut cron) = load_manifest(path)? else {
        bail!("{} is not a CronWorkflow manifest", path.display());
    };
    if let Some(ns) = namespace {
        cron.metadata.namespace = ns.to_string();
    }
    let created = engine.scheduler.create(cron).await?;
    handler.cron(&created);
    Ok(0)
}

pub async fn list_crons(
    engine: &Engine,
    namespace: Option<&str>,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let crons = engine.scheduler.list(namespace).await?;
    handler.crons(&crons);
    Ok(0)
}

pub async fn get_cron(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let cron = engine.scheduler.get(namespace, name).await?;
    handler.cron(&cron);
    Ok(0)
}

pub async fn delete_cron(
    engine: &Engine,
    namespace: &str,
    name: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    engine.scheduler.delete(namespace, name).await?;
    handler.info(&format!("CronWorkflow '{}' deleted", name));
    Ok(0)
}

pub async fn set_cron_suspended(
    engine: &Engine,
    namespace: &str,
    name: &str,
    suspend: bool,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let cron = if suspend {
        engine.scheduler.suspend(namespace, name).await?
    } else {
        engine.scheduler.resume(namespace, name).await?
    };
    handler.cron(&cron);
    Ok(0)
}

/// Filters for `archive list`
#[derive(Debug, Clone, Default)]
pub struct ArchiveListArgs {
    pub namespace: Option<String>,
    pub name_prefix: Option<String>,
    pub selector: Option<String>,
}

impl ArchiveListArgs {
    pub fn to_filter(&self) -> Result<ListFilter> {
        let labels = match self.selector {
            Some(ref s) => ListFilter::parse_labels(s).map_err(|e| anyhow::anyhow!(e))?,
            None => Default::default(),
        };
        Ok(ListFilter {
            namespace: self.namespace.clone(),
            name_prefix: self.name_prefix.clone(),
            labels,
        })
    }
}

pub async fn list_archived(
    engine: &Engine,
    args: &ArchiveListArgs,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let wfs = engine.controller.archive().list(&args.to_filter()?).await?;
    handler.workflows(&wfs);
    Ok(0)
}

pub async fn get_archived(engine: &Engine, uid: &str, handler: &dyn OutputHandler) -> Result<i32> {
    let uid = parse_uid(uid)?;
    let wf = engine.controller.archive().get(uid).await?;
    handler.workflow(&wf);
    Ok(0)
}

pub async fn delete_archived(
    engine: &Engine,
    uid: &str,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    let parsed = parse_uid(uid)?;
    engine.controller.archive().delete(parsed).await?;
    handler.info(&format!("Archived workflow '{}' deleted", uid));
    Ok(0)
}

fn parse_uid(uid: &str) -> Result<Uuid> {
    Uuid::parse_str(uid).with_context(|| format!("'{}' is not a workflow UID", uid))
}

/// Run the controller and cron loops until the token is cancelled
pub async fn run_controller(
    engine: &Engine,
    token: CancellationToken,
    handler: &dyn OutputHandler,
) -> Result<i32> {
    handler.info("Controller running; press Ctrl+C to stop");
    let (controller, scheduler) = tokio::join!(
        engine.controller.run(token.clone()),
        engine.scheduler.run(token.clone()),
    );
    controller?;
    scheduler?;
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CronWorkflow, WorkflowTemplate};
    use crate::worker::ReportedStatus;
    use crate::worker::scripted::ScriptedWorker;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockHandler {
        messages: Mutex<Vec<String>>,
        workflows: Mutex<Vec<Workflow>>,
        templates: Mutex<Vec<WorkflowTemplate>>,
        crons: Mutex<Vec<CronWorkflow>>,
    }

    impl OutputHandler for MockHandler {
        fn workflow(&self, wf: &Workflow) {
            self.workflows.lock().unwrap().push(wf.clone());
        }
        fn workflows(&self, wfs: &[Workflow]) {
            self.workflows.lock().unwrap().extend_from_slice(wfs);
        }
        fn template(&self, template: &WorkflowTemplate) {
            self.templates.lock().unwrap().push(template.clone());
        }
        fn templates(&self, templates: &[WorkflowTemplate]) {
            self.templates.lock().unwrap().extend_from_slice(templates);
        }
        fn cron(&self, cron: &CronWorkflow) {
            self.crons.lock().unwrap().push(cron.clone());
        }
        fn crons(&self, crons: &[CronWorkflow]) {
            self.crons.lock().unwrap().extend_from_slice(crons);
        }
        fn info(&self, message: &str) {
            self.messages.lock().unwrap().push(message.to_string());
        }
    }

    const TEMPLATE: &str = r#"
kind = "WorkflowTemplate"

[metadata]
name = "basic"
namespace = "default"

[spec]

[[spec.parameters]]
name = "message"
default = "hello"

[[spec.steps]]
name = "whalesay-template"
run = "echo {{ workflow.parameters.message }}"
"#;

    const CRON: &str = r#"
kind = "CronWorkflow"

[metadata]
name = "nightly"

[spec]
schedule = "@daily"
concurrency_policy = "Forbid"

[spec.workflow_spec]
entrypoint = "main"

[[spec.workflow_spec.steps]]
name = "main"
run = "true"
"#;

    const CYCLIC: &str = r#"
kind = "WorkflowTemplate"

[metadata]
name = "loop"

[spec]

[[spec.steps]]
name = "a"
run = "true"
depends_on = ["b"]

[[spec.steps]]
name = "b"
run = "true"
depends_on = ["a"]
"#;

    fn engine(worker: ScriptedWorker) -> Engine {
        Engine::from_parts(
            Arc::new(SqliteStore::open_in_memory().unwrap()),
            Arc::new(WorkflowArchive::open_in_memory().unwrap()),
            Arc::new(worker),
            &EngineConfig::default(),
        )
    }

    fn write_manifest(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_parse_source() {
        assert_eq!(
            parse_source("workflowtemplate/basic").unwrap(),
            SourceRef::WorkflowTemplate("basic".into())
        );
        assert_eq!(
            parse_source("CronWorkflow/nightly").unwrap(),
            SourceRef::CronWorkflow("nightly".into())
        );
        assert!(parse_source("basic").is_err());
        assert!(parse_source("workflowtemplate/").is_err());
        assert!(parse_source("pod/basic").is_err());
    }

    #[test]
    fn test_lint_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let handler = MockHandler::default();

        let good = write_manifest(&dir, "basic.toml", TEMPLATE);
        assert_eq!(lint_manifest(&good, &handler).unwrap(), 0);

        let cyclic = write_manifest(&dir, "loop.toml", CYCLIC);
        assert_eq!(lint_manifest(&cyclic, &handler).unwrap(), 1);

        let messages = handler.messages.lock().unwrap();
        assert!(messages[0].starts_with("✓ WorkflowTemplate 'basic'"));
        assert!(messages[0].contains("validated"));
        assert!(messages.iter().any(|m| m.starts_with("✗ WorkflowTemplate 'loop'")));
    }

    #[tokio::test]
    async fn test_template_create_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(ScriptedWorker::manual());
        let handler = MockHandler::default();

        let path = write_manifest(&dir, "basic.toml", TEMPLATE);
        assert_eq!(create_template(&engine, &path, None, &handler).await.unwrap(), 0);
        assert_eq!(list_templates(&engine, None, &handler).await.unwrap(), 0);

        let templates = handler.templates.lock().unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(templates[1].metadata.name, "basic");
    }

    #[tokio::test]
    async fn test_create_template_rejects_other_kinds() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(ScriptedWorker::manual());
        let handler = MockHandler::default();

        let path = write_manifest(&dir, "cron.toml", CRON);
        assert!(create_template(&engine, &path, None, &handler).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_from_template_waits_for_completion() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(ScriptedWorker::auto(ReportedStatus::Succeeded));
        let handler = MockHandler::default();

        let path = write_manifest(&dir, "basic.toml", TEMPLATE);
        create_template(&engine, &path, None, &handler).await.unwrap();

        let args = SubmitArgs {
            from: Some("workflowtemplate/basic".into()),
            entrypoint: Some("whalesay-template".into()),
            parameters: vec!["message=TEST".into()],
            timeout: Some(Duration::from_secs(10)),
            ..Default::default()
        };
        let code = submit(&engine, args, CancellationToken::new(), &handler)
            .await
            .unwrap();
        assert_eq!(code, 0);

        let wfs = handler.workflows.lock().unwrap();
        assert_eq!(wfs.len(), 1);
        assert_eq!(wfs[0].phase(), Phase::Succeeded);
        assert_eq!(wfs[0].spec.parameters["message"], "TEST");
    }

    #[tokio::test]
    async fn test_submit_without_entrypoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(ScriptedWorker::auto(ReportedStatus::Succeeded));
        let handler = MockHandler::default();

        let path = write_manifest(&dir, "basic.toml", TEMPLATE);
        create_template(&engine, &path, None, &handler).await.unwrap();

        let args = SubmitArgs {
            from: Some("workflowtemplate/basic".into()),
            ..Default::default()
        };
        assert!(
            submit(&engine, args, CancellationToken::new(), &handler)
                .await
                .is_err()
        );
        assert!(engine.controller.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cron_create_and_suspend() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(ScriptedWorker::manual());
        let handler = MockHandler::default();

        let path = write_manifest(&dir, "cron.toml", CRON);
        create_cron(&engine, &path, None, &handler).await.unwrap();
        set_cron_suspended(&engine, "default", "nightly", true, &handler)
            .await
            .unwrap();

        let crons = handler.crons.lock().unwrap();
        assert_eq!(crons.len(), 2);
        assert_eq!(crons[0].metadata.namespace, "default");
        assert!(!crons[0].spec.suspend);
        assert!(crons[1].spec.suspend);
    }

    #[tokio::test]
    async fn test_archive_commands() {
        let engine = engine(ScriptedWorker::manual());
        let handler = MockHandler::default();

        let missing = Uuid::new_v4().to_string();
        assert!(get_archived(&engine, &missing, &handler).await.is_err());
        assert!(get_archived(&engine, "not-a-uid", &handler).await.is_err());

        let args = ArchiveListArgs {
            selector: Some("flowctl/workflow-template=basic".into()),
            ..Default::default()
        };
        assert_eq!(list_archived(&engine, &args, &handler).await.unwrap(), 0);
        assert!(handler.workflows.lock().unwrap().is_empty());
    }
}
