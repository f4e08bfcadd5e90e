//! Reconciliation of live workflow instances

use super::machine::{self, Transition};
use crate::clock::{Clock, SystemClock};
use crate::config::{ControllerSettings, EngineConfig};
use crate::error::EngineError;
use crate::model::{NodeOutcome, Phase, Workflow};
use crate::resolver::{Resolver, SubmitOptions, TemplateRef};
use crate::retry::RetryPolicy;
use crate::signals::CancellationToken;
use crate::store::{ArchiveStore, InstanceStore, StoreError};
use crate::worker::{
    Observation, ReportReceiver, ReportSender, ReportedStatus, WorkKey, WorkRequest, WorkerError,
    WorkerProvider, WorkerReport,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

const COMPLETION_POLL: Duration = Duration::from_millis(100);

/// Side effects produced by one state machine pass
#[derive(Debug, Default)]
struct Effects {
    transitions: Vec<Transition>,
    start: Vec<String>,
    cancel: Vec<(String, u32)>,
    settled: Vec<WorkKey>,
}

/// Drives workflow instances from submission to a terminal phase
///
/// Transitions of one instance are serialized by a per-instance lock and
/// every write is checked against the stored revision, so several
/// controllers sharing one store never apply a pass twice.
pub struct WorkflowController {
    store: Arc<dyn InstanceStore>,
    archive: Arc<dyn ArchiveStore>,
    worker: Arc<dyn WorkerProvider>,
    clock: Arc<dyn Clock>,
    resolver: Resolver,
    settings: ControllerSettings,
    default_namespace: String,
    retry: RetryPolicy,
    reports_tx: ReportSender,
    reports_rx: Mutex<ReportReceiver>,
    locks: std::sync::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl WorkflowController {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        archive: Arc<dyn ArchiveStore>,
        worker: Arc<dyn WorkerProvider>,
        config: &EngineConfig,
    ) -> Self {
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        Self {
            store,
            archive,
            worker,
            clock: Arc::new(SystemClock),
            resolver: Resolver::new(),
            settings: config.controller.clone(),
            default_namespace: config.defaults.namespace.clone(),
            retry: RetryPolicy::from_config(&config.retry),
            reports_tx,
            reports_rx: Mutex::new(reports_rx),
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn archive(&self) -> &Arc<dyn ArchiveStore> {
        &self.archive
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn default_namespace(&self) -> &str {
        &self.default_namespace
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Resolve and create a new instance, then start its root nodes
    ///
    /// Resolution errors are returned before anything is stored. Faults
    /// after creation are recorded on the instance, never returned.
    pub async fn submit(
        &self,
        source: TemplateRef<'_>,
        opts: &SubmitOptions,
    ) -> Result<Workflow, EngineError> {
        let mut opts = opts.clone();
        if opts.namespace.is_none() && source.metadata().namespace.is_empty() {
            opts.namespace = Some(self.default_namespace.clone());
        }
        let generates_names = !matches!(source, TemplateRef::Workflow(_));

        let mut collisions = 0;
        let created = loop {
            let mut wf = self.resolver.resolve(source, &opts)?;
            wf.metadata.created_at = Some(self.clock.now());

            let result = self
                .retry
                .run("create workflow", StoreError::is_retryable, || {
                    self.store.create_workflow(&wf)
                })
                .await;
            match result {
                Ok(created) => break created,
                Err(StoreError::NameCollision { name, .. })
                    if generates_names && collisions < self.settings.name_collision_retries =>
                {
                    collisions += 1;
                    tracing::debug!(%name, collisions, "Generated name taken, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        tracing::info!(
            workflow = %created.name(),
            namespace = %created.namespace(),
            uid = %created.uid(),
            source = source.kind(),
            "Submitted workflow"
        );

        let uid = created.uid();
        match self.process(uid, Vec::new(), false).await {
            Ok(Some(latest)) => Ok(latest),
            Ok(None) => Ok(created),
            Err(e) => {
                tracing::warn!(workflow = %created.name(), error = %e, "Initial reconcile failed");
                Ok(created)
            }
        }
    }

    /// Submit from a stored workflow template
    pub async fn submit_template(
        &self,
        namespace: &str,
        name: &str,
        opts: &SubmitOptions,
    ) -> Result<Workflow, EngineError> {
        let template = self.store.get_template(namespace, name).await?;
        self.submit(TemplateRef::WorkflowTemplate(&template), opts)
            .await
    }

    /// Submit one run of a stored cron workflow immediately
    pub async fn submit_cron(
        &self,
        namespace: &str,
        name: &str,
        opts: &SubmitOptions,
    ) -> Result<Workflow, EngineError> {
        let cron = self.store.get_cron(namespace, name).await?;
        self.submit(TemplateRef::CronWorkflow(&cron), opts).await
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<Workflow, EngineError> {
        Ok(self.store.get_workflow_by_name(namespace, name).await?)
    }

    pub async fn get_by_uid(&self, uid: Uuid) -> Result<Workflow, EngineError> {
        Ok(self.store.get_workflow(uid).await?)
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.store.list_workflows(namespace).await?)
    }

    /// Remove a live instance
    ///
    /// Running nodes are asked to stop on a best-effort basis. A terminal
    /// instance that missed its archive write is archived first.
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<Workflow, EngineError> {
        let uid = self.store.get_workflow_by_name(namespace, name).await?.uid();
        let lock = self.lock_for(uid);
        let guard = lock.lock().await;

        let wf = self.store.get_workflow(uid).await?;
        if !wf.is_terminal() {
            let running: Vec<(String, u32)> = wf
                .status
                .nodes
                .values()
                .filter(|n| n.phase == Phase::Running)
                .map(|n| (n.name.clone(), n.attempt))
                .collect();
            self.cancel_nodes(&wf, &running).await;
        } else if !wf.status.archived {
            if let Err(e) = self.archive.put(&wf).await {
                tracing::warn!(workflow = %wf.name(), error = %e, "Failed to archive before delete");
            }
        }

        self.store.delete_workflow(uid).await?;
        drop(guard);
        self.forget_lock(uid);
        for node in wf.status.nodes.values() {
            self.worker
                .forget(&WorkKey::new(uid, node.name.clone(), node.attempt))
                .await;
        }

        tracing::info!(workflow = %wf.name(), namespace = %wf.namespace(), "Deleted workflow");
        Ok(wf)
    }

    /// Request termination of a live instance by name
    pub async fn terminate(&self, namespace: &str, name: &str) -> Result<Workflow, EngineError> {
        let uid = self.store.get_workflow_by_name(namespace, name).await?.uid();
        match self.terminate_uid(uid).await? {
            Some(wf) => Ok(wf),
            None => Err(StoreError::not_found(crate::store::KIND_WORKFLOW, name).into()),
        }
    }

    /// Request termination of a live instance by UID
    ///
    /// Pending nodes are omitted and running nodes are cancelled. The
    /// instance becomes terminal once every running node has stopped or the
    /// grace period has passed.
    pub async fn terminate_uid(&self, uid: Uuid) -> Result<Option<Workflow>, EngineError> {
        self.process(uid, Vec::new(), true).await
    }

    /// Feed one worker report through the state machine
    pub async fn handle_report(&self, report: WorkerReport) -> Result<Transition, EngineError> {
        let uid = report.key.workflow_uid;
        let key = report.key.clone();
        let lock = self.lock_for(uid);
        let guard = lock.lock().await;
        let processed = self.process_locked(uid, vec![report]).await;
        drop(guard);

        match processed? {
            Some((wf, transitions)) => {
                self.release_if_settled(&wf);
                Ok(transitions
                    .into_iter()
                    .next()
                    .unwrap_or(Transition::Ignored("no transition")))
            }
            None => {
                self.forget_lock(uid);
                self.worker.forget(&key).await;
                tracing::debug!(%key, "Report for unknown workflow ignored");
                Ok(Transition::Ignored("workflow not found"))
            }
        }
    }

    /// Poll running nodes of one instance and advance it
    pub async fn reconcile(&self, uid: Uuid) -> Result<Option<Workflow>, EngineError> {
        let lock = self.lock_for(uid);
        let guard = lock.lock().await;
        let reconciled = self.reconcile_locked(uid).await;
        drop(guard);

        let reconciled = reconciled?;
        match reconciled {
            Some(ref wf) => self.release_if_settled(wf),
            None => self.forget_lock(uid),
        }
        Ok(reconciled)
    }

    async fn reconcile_locked(&self, uid: Uuid) -> Result<Option<Workflow>, EngineError> {
        let wf = match self.store.get_workflow(uid).await {
            Ok(wf) => wf,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if wf.is_terminal() {
            if !wf.status.archived {
                return Ok(Some(self.archive_terminal(wf).await));
            }
            return Ok(Some(wf));
        }

        let observed = self.observe_running(&wf).await;
        Ok(self.process_locked(uid, observed).await?.map(|(wf, _)| wf))
    }

    /// Reconcile every live instance once
    pub async fn resync_all(&self) -> Result<(), EngineError> {
        let workflows = self.store.list_workflows(None).await?;
        for wf in workflows {
            if wf.is_terminal() && wf.status.archived {
                continue;
            }
            if let Err(e) = self.reconcile(wf.uid()).await {
                tracing::warn!(workflow = %wf.name(), error = %e, "Reconcile failed");
            }
        }
        Ok(())
    }

    /// Process every report already queued, including ones produced meanwhile
    pub async fn drain_reports(&self) -> Result<usize, EngineError> {
        let mut rx = self
            .reports_rx
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning)?;

        let mut handled = 0;
        while let Ok(report) = rx.try_recv() {
            self.handle_report(report).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Run the reconciliation loop until `token` is cancelled
    pub async fn run(&self, token: CancellationToken) -> Result<(), EngineError> {
        let mut rx = self
            .reports_rx
            .try_lock()
            .map_err(|_| EngineError::AlreadyRunning)?;
        let mut ticker = tokio::time::interval(self.settings.resync_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            worker = self.worker.name(),
            resync_ms = self.settings.resync_interval_ms,
            "Controller started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(report) = rx.recv() => {
                    let key = report.key.clone();
                    if let Err(e) = self.handle_report(report).await {
                        tracing::warn!(%key, error = %e, "Failed to handle report");
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.resync_all().await {
                        tracing::warn!(error = %e, "Resync failed");
                    }
                }
            }
        }

        tracing::info!("Controller stopped");
        Ok(())
    }

    /// Wait until an instance is terminal
    ///
    /// Needs a running [`run`](Self::run) loop. Falls back to the archive if
    /// the live instance is deleted while waiting.
    pub async fn wait_for_completion(
        &self,
        uid: Uuid,
        timeout: Duration,
    ) -> Result<Workflow, EngineError> {
        let poll = async {
            loop {
                match self.store.get_workflow(uid).await {
                    Ok(wf) if wf.is_terminal() => return Ok(wf),
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => return Ok(self.archive.get(uid).await?),
                    Err(e) => return Err(EngineError::from(e)),
                }
                tokio::time::sleep(COMPLETION_POLL).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| EngineError::Timeout {
                name: uid.to_string(),
            })?
    }

    fn lock_for(&self, uid: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(uid).or_default())
    }

    fn forget_lock(&self, uid: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(&uid);
    }

    /// Archived terminal instances never transition again
    fn release_if_settled(&self, wf: &Workflow) {
        if wf.is_terminal() && wf.status.archived {
            self.forget_lock(wf.uid());
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|l| l.len()).unwrap_or(0)
    }

    async fn process(
        &self,
        uid: Uuid,
        reports: Vec<WorkerReport>,
        terminate: bool,
    ) -> Result<Option<Workflow>, EngineError> {
        let lock = self.lock_for(uid);
        let guard = lock.lock().await;
        let processed = self.process_guarded(uid, reports, terminate).await;
        drop(guard);

        let processed = processed?;
        match processed {
            Some(ref wf) => self.release_if_settled(wf),
            None => self.forget_lock(uid),
        }
        Ok(processed)
    }

    async fn process_guarded(
        &self,
        uid: Uuid,
        reports: Vec<WorkerReport>,
        terminate: bool,
    ) -> Result<Option<Workflow>, EngineError> {
        if terminate {
            let Some((wf, fx)) = self.commit(uid, &reports, true).await? else {
                return Ok(None);
            };
            self.apply_effects(&wf, &fx).await;
            // Cancellation may already have been acknowledged
            return Ok(self.process_locked(uid, Vec::new()).await?.map(|(wf, _)| wf));
        }
        Ok(self.process_locked(uid, reports).await?.map(|(wf, _)| wf))
    }

    /// One or more state machine passes; the instance lock must be held
    ///
    /// Nodes that cannot be dispatched are fed back as `Error` reports until
    /// a pass starts nothing new.
    async fn process_locked(
        &self,
        uid: Uuid,
        reports: Vec<WorkerReport>,
    ) -> Result<Option<(Workflow, Vec<Transition>)>, EngineError> {
        let mut pending = reports;
        let mut transitions = Vec::new();

        let wf = loop {
            let Some((wf, fx)) = self.commit(uid, &pending, false).await? else {
                return Ok(None);
            };
            transitions.extend(fx.transitions.iter().cloned());
            self.apply_effects(&wf, &fx).await;

            pending = self.dispatch(&wf, &fx.start).await;
            if pending.is_empty() {
                break wf;
            }
        };

        let wf = if wf.is_terminal() && !wf.status.archived {
            self.archive_terminal(wf).await
        } else {
            wf
        };
        Ok(Some((wf, transitions)))
    }

    /// Load, run one pass, and persist with a revision check
    async fn commit(
        &self,
        uid: Uuid,
        reports: &[WorkerReport],
        terminate: bool,
    ) -> Result<Option<(Workflow, Effects)>, EngineError> {
        let mut conflicts = 0;
        loop {
            let current = match self
                .retry
                .run("load workflow", StoreError::is_retryable, || {
                    self.store.get_workflow(uid)
                })
                .await
            {
                Ok(wf) => wf,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            let mut wf = current.clone();
            let fx = self.step(&mut wf, reports, terminate);
            if wf == current {
                return Ok(Some((wf, fx)));
            }

            match self.store.update_workflow(&wf).await {
                Ok(saved) => return Ok(Some((saved, fx))),
                Err(StoreError::Conflict { .. }) if conflicts < self.retry.max_retries => {
                    conflicts += 1;
                    tracing::debug!(workflow = %wf.name(), conflicts, "Revision conflict, reloading");
                }
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn step(&self, wf: &mut Workflow, reports: &[WorkerReport], terminate: bool) -> Effects {
        let now = self.clock.now();
        let uid = wf.uid();
        let mut fx = Effects::default();

        for report in reports {
            let transition = machine::apply_report(wf, report, now);
            if !matches!(transition, Transition::Ignored(_)) {
                fx.settled.push(report.key.clone());
            }
            fx.transitions.push(transition);
        }

        if terminate {
            fx.cancel.extend(machine::terminate(wf, now));
        }

        let grace = chrono::Duration::from_std(self.settings.termination_grace())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        for (node, attempt) in machine::enforce_grace(wf, now, grace) {
            fx.settled.push(WorkKey::new(uid, node.clone(), attempt));
            fx.cancel.push((node, attempt));
        }

        fx.start = machine::advance(wf, now);
        fx
    }

    async fn apply_effects(&self, wf: &Workflow, fx: &Effects) {
        self.cancel_nodes(wf, &fx.cancel).await;
        for key in &fx.settled {
            self.worker.forget(key).await;
        }
    }

    async fn cancel_nodes(&self, wf: &Workflow, nodes: &[(String, u32)]) {
        for (node, attempt) in nodes {
            let key = WorkKey::new(wf.uid(), node.clone(), *attempt);
            if let Err(e) = self.worker.cancel(&key).await {
                tracing::warn!(%key, error = %e, "Failed to cancel node");
            }
        }
    }

    /// Hand started nodes to the worker; returns reports for nodes it refused
    async fn dispatch(&self, wf: &Workflow, nodes: &[String]) -> Vec<WorkerReport> {
        let mut failures = Vec::new();

        for name in nodes {
            let (Some(node), Some(spec)) = (
                wf.node(name),
                wf.spec.nodes.iter().find(|n| &n.name == name),
            ) else {
                continue;
            };

            let request = WorkRequest {
                key: WorkKey::new(wf.uid(), name.clone(), node.attempt),
                workflow_name: wf.name().to_string(),
                namespace: wf.namespace().to_string(),
                command: spec.run.clone(),
            };

            let result = self
                .retry
                .run("start node", WorkerError::is_retryable, || {
                    self.worker.start(request.clone(), self.reports_tx.clone())
                })
                .await;

            if let Err(e) = result {
                tracing::warn!(key = %request.key, error = %e, "Failed to start node");
                failures.push(WorkerReport::new(
                    request.key,
                    ReportedStatus::Error,
                    NodeOutcome::message(format!("failed to start: {}", e)),
                ));
            }
        }

        failures
    }

    /// Poll every running node, turning finished or vanished work into reports
    async fn observe_running(&self, wf: &Workflow) -> Vec<WorkerReport> {
        let mut observed = Vec::new();

        for node in wf.status.nodes.values().filter(|n| n.phase == Phase::Running) {
            let key = WorkKey::new(wf.uid(), node.name.clone(), node.attempt);
            match self.observe(wf, &key).await {
                Ok(Observation::Running) => {}
                Ok(Observation::Finished(report)) => observed.push(report),
                Ok(Observation::Vanished) => observed.push(WorkerReport::new(
                    key,
                    ReportedStatus::Error,
                    NodeOutcome::message("worker resource vanished"),
                )),
                Err(e) => tracing::warn!(%key, error = %e, "Observation failed"),
            }
        }

        observed
    }

    async fn observe(&self, wf: &Workflow, key: &WorkKey) -> Result<Observation, EngineError> {
        self.retry
            .run("observe node", WorkerError::is_retryable, || {
                self.worker.observe(key)
            })
            .await
            .map_err(|e| match e {
                WorkerError::Unavailable { message } => EngineError::TransientObservationFailure {
                    workflow: wf.name().to_string(),
                    node: key.node.clone(),
                    message,
                },
                other => other.into(),
            })
    }

    /// Write the terminal snapshot and record that it was written
    async fn archive_terminal(&self, wf: Workflow) -> Workflow {
        if let Err(e) = self.archive.put(&wf).await {
            tracing::warn!(workflow = %wf.name(), error = %e, "Failed to archive workflow");
            return wf;
        }

        let mut marked = wf.clone();
        marked.status.archived = true;
        match self.store.update_workflow(&marked).await {
            Ok(saved) => saved,
            Err(e) => {
                // Next resync writes the (identical) snapshot again
                tracing::debug!(workflow = %wf.name(), error = %e, "Could not record archive");
                wf
            }
        }
    }
}
