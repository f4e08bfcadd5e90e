use super::schedule::{Due, Schedule};
use super::{ScheduleError, deadline_duration, lint};
use crate::clock::{Clock, SystemClock};
use crate::config::CronSettings;
use crate::engine::WorkflowController;
use crate::error::EngineError;
use crate::model::{
    ActiveWorkflowRef, ConcurrencyPolicy, CronWorkflow, CronWorkflowStatus, LABEL_CRON_WORKFLOW,
};
use crate::resolver::{SubmitOptions, TemplateRef};
use crate::signals::CancellationToken;
use crate::store::StoreError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::time::MissedTickBehavior;

const STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Why a due trigger did not fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A prior instance is still running under `Forbid`
    Forbid,
    /// The trigger was evaluated after its starting deadline
    Deadline,
    /// More occurrences elapsed than the lookback limit allows
    TooManyMissed,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SkipReason::Forbid => "forbid",
            SkipReason::Deadline => "deadline",
            SkipReason::TooManyMissed => "too-many-missed",
        };
        f.write_str(s)
    }
}

/// What one evaluation of a cron workflow did
#[derive(Debug, Clone, PartialEq)]
pub enum CronOutcome {
    Idle,
    Suspended,
    Fired { workflow: String },
    Skipped { reason: SkipReason },
    /// Evaluation failed; the error was also logged
    Failed { error: String },
}

/// Cached state for one watched cron workflow
struct Watcher {
    schedule: Schedule,
}

type WatchKey = (String, String);

/// Scheduler context owning the watchers of every stored cron workflow
///
/// Each tick lists the stored cron workflows, refreshes the watcher set and
/// evaluates every watcher independently. Bookkeeping lives in the cron
/// workflow status, so a restarted scheduler picks up where it left off.
pub struct CronScheduler {
    controller: Arc<WorkflowController>,
    clock: Arc<dyn Clock>,
    settings: CronSettings,
    watchers: Mutex<HashMap<WatchKey, Watcher>>,
}

impl CronScheduler {
    pub fn new(controller: Arc<WorkflowController>, settings: CronSettings) -> Self {
        Self {
            controller,
            clock: Arc::new(SystemClock),
            settings,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of cron workflows currently watched
    pub fn watching(&self) -> usize {
        self.watchers.lock().map(|w| w.len()).unwrap_or(0)
    }

    /// Validate and store a new cron workflow
    pub async fn create(&self, mut cron: CronWorkflow) -> Result<CronWorkflow, EngineError> {
        cron.metadata
            .default_namespace(self.controller.default_namespace());
        if let Err(errors) = lint(&cron) {
            return Err(ScheduleError::InvalidCronWorkflow {
                name: cron.metadata.name.clone(),
                errors,
            }
            .into());
        }
        // Every trigger resolves with default options, so this must succeed now
        self.controller
            .resolver()
            .resolve(TemplateRef::CronWorkflow(&cron), &SubmitOptions::default())?;

        cron.metadata.created_at = Some(self.clock.now());
        cron.status = CronWorkflowStatus::default();
        let created = self.controller.store().create_cron(&cron).await?;

        tracing::info!(
            cron = %created.metadata.name,
            namespace = %created.metadata.namespace,
            schedule = %created.spec.schedule,
            "Created cron workflow"
        );
        Ok(created)
    }

    pub async fn get(&self, namespace: &str, name: &str) -> Result<CronWorkflow, EngineError> {
        Ok(self.controller.store().get_cron(namespace, name).await?)
    }

    pub async fn list(&self, namespace: Option<&str>) -> Result<Vec<CronWorkflow>, EngineError> {
        Ok(self.controller.store().list_crons(namespace).await?)
    }

    /// Delete a cron workflow; instances it already created are left alone
    pub async fn delete(&self, namespace: &str, name: &str) -> Result<(), EngineError> {
        self.controller.store().delete_cron(namespace, name).await?;
        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.remove(&(namespace.to_string(), name.to_string()));
        }
        tracing::info!(cron = %name, %namespace, "Deleted cron workflow");
        Ok(())
    }

    pub async fn suspend(&self, namespace: &str, name: &str) -> Result<CronWorkflow, EngineError> {
        self.set_suspended(namespace, name, true).await
    }

    /// Resume a suspended cron workflow
    ///
    /// Occurrences that elapsed while suspended are not fired: the baseline
    /// moves to the time of resumption.
    pub async fn resume(&self, namespace: &str, name: &str) -> Result<CronWorkflow, EngineError> {
        self.set_suspended(namespace, name, false).await
    }

    async fn set_suspended(
        &self,
        namespace: &str,
        name: &str,
        suspend: bool,
    ) -> Result<CronWorkflow, EngineError> {
        let store = self.controller.store();
        let mut attempts = 0;
        loop {
            let mut cron = store.get_cron(namespace, name).await?;
            if cron.spec.suspend == suspend {
                return Ok(cron);
            }
            cron.spec.suspend = suspend;
            if !suspend {
                cron.status.last_scheduled_time = Some(self.clock.now());
            }

            match store.update_cron(&cron).await {
                Ok(updated) => {
                    tracing::info!(cron = %name, %namespace, suspend, "Updated cron suspension");
                    return Ok(updated);
                }
                Err(StoreError::Conflict { .. }) if attempts < STATUS_WRITE_ATTEMPTS => {
                    attempts += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Evaluate every stored cron workflow once
    ///
    /// A failure on one cron workflow is logged and does not stop the others.
    pub async fn tick(&self) -> Result<Vec<(String, CronOutcome)>, EngineError> {
        let now = self.clock.now();
        let crons = self.controller.store().list_crons(None).await?;
        self.refresh_watchers(&crons);

        let mut outcomes = Vec::with_capacity(crons.len());
        for cron in crons {
            let name = cron.metadata.name.clone();
            match self.evaluate(cron, now).await {
                Ok(outcome) => outcomes.push((name, outcome)),
                Err(e) => {
                    tracing::warn!(cron = %name, error = %e, "Cron evaluation failed");
                    outcomes.push((
                        name,
                        CronOutcome::Failed {
                            error: e.to_string(),
                        },
                    ));
                }
            }
        }
        Ok(outcomes)
    }

    /// Tick on an interval until the token is cancelled, then drop all watchers
    pub async fn run(&self, token: CancellationToken) -> Result<(), EngineError> {
        let mut ticker = tokio::time::interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.settings.tick_interval_ms, "Cron scheduler started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::warn!(error = %e, "Cron tick failed");
                    }
                }
            }
        }

        if let Ok(mut watchers) = self.watchers.lock() {
            watchers.clear();
        }
        tracing::info!("Cron scheduler stopped");
        Ok(())
    }

    /// Sync the watcher set with the stored cron workflows
    fn refresh_watchers(&self, crons: &[CronWorkflow]) {
        let Ok(mut watchers) = self.watchers.lock() else {
            return;
        };

        let mut live = std::collections::HashSet::with_capacity(crons.len());
        for cron in crons {
            let key = watch_key(cron);
            live.insert(key.clone());

            let stale = watchers
                .get(&key)
                .is_none_or(|w| w.schedule.source() != cron.spec.schedule);
            if !stale {
                continue;
            }
            match Schedule::parse(&cron.spec.schedule) {
                Ok(schedule) => {
                    tracing::debug!(
                        cron = %cron.metadata.name,
                        expression = schedule.expression(),
                        "Watching cron workflow"
                    );
                    watchers.insert(key, Watcher { schedule });
                }
                Err(e) => {
                    tracing::warn!(cron = %cron.metadata.name, error = %e, "Unparseable schedule");
                    watchers.remove(&key);
                }
            }
        }
        watchers.retain(|key, _| live.contains(key));
    }

    fn schedule_for(&self, cron: &CronWorkflow) -> Result<Schedule, EngineError> {
        let cached = self
            .watchers
            .lock()
            .ok()
            .and_then(|w| w.get(&watch_key(cron)).map(|w| w.schedule.clone()));
        match cached {
            Some(schedule) => Ok(schedule),
            None => Ok(Schedule::parse(&cron.spec.schedule)?),
        }
    }

    async fn evaluate(
        &self,
        cron: CronWorkflow,
        now: DateTime<Utc>,
    ) -> Result<CronOutcome, EngineError> {
        if cron.spec.suspend {
            return Ok(CronOutcome::Suspended);
        }
        let schedule = self.schedule_for(&cron)?;
        let name = cron.metadata.name.as_str();

        let mut status = cron.status.clone();
        status.active = self.active_instances(&cron).await?;

        let baseline = status
            .last_scheduled_time
            .or(cron.metadata.created_at)
            .unwrap_or(now);

        let outcome = match schedule.due(baseline, now, self.settings.max_missed_schedules) {
            Due::Nothing => CronOutcome::Idle,
            Due::TooManyMissed => {
                tracing::warn!(
                    cron = %name,
                    reason = %SkipReason::TooManyMissed,
                    limit = self.settings.max_missed_schedules,
                    "Skipped cron run"
                );
                status.last_scheduled_time = Some(now);
                CronOutcome::Skipped {
                    reason: SkipReason::TooManyMissed,
                }
            }
            Due::At { scheduled, missed } => {
                if missed > 0 {
                    tracing::warn!(cron = %name, missed, "Missed earlier cron runs");
                }
                status.last_scheduled_time = Some(scheduled);
                match self.skip_reason(&cron, &status, scheduled, now) {
                    Some(reason) => CronOutcome::Skipped { reason },
                    None => return self.fire(&cron, status, scheduled).await,
                }
            }
        };

        if status != cron.status {
            self.save_status(&cron, status).await?;
        }
        Ok(outcome)
    }

    /// Deadline and concurrency checks for a due occurrence
    fn skip_reason(
        &self,
        cron: &CronWorkflow,
        status: &CronWorkflowStatus,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<SkipReason> {
        let name = cron.metadata.name.as_str();

        // A deadline too large to represent never expires
        if let Some(deadline) = cron.spec.starting_deadline_seconds.and_then(deadline_duration) {
            let late = now - scheduled;
            if late > deadline {
                tracing::warn!(
                    cron = %name,
                    reason = %SkipReason::Deadline,
                    scheduled = %scheduled,
                    late_secs = late.num_seconds(),
                    "Skipped cron run"
                );
                return Some(SkipReason::Deadline);
            }
        }

        if cron.spec.concurrency_policy == ConcurrencyPolicy::Forbid && !status.active.is_empty() {
            tracing::warn!(
                cron = %name,
                reason = %SkipReason::Forbid,
                active = status.active.len(),
                scheduled = %scheduled,
                "Skipped cron run"
            );
            return Some(SkipReason::Forbid);
        }
        None
    }

    /// Claim the occurrence, then create its instance
    ///
    /// The advanced `last_scheduled_time` is stored before anything is
    /// submitted, so a failed write never leads to a second instance for the
    /// same occurrence. A submit that fails after the claim loses that
    /// occurrence.
    async fn fire(
        &self,
        cron: &CronWorkflow,
        status: CronWorkflowStatus,
        scheduled: DateTime<Utc>,
    ) -> Result<CronOutcome, EngineError> {
        let name = cron.metadata.name.as_str();
        let Some(claimed) = self.claim(cron, &status, scheduled).await? else {
            tracing::debug!(cron = %name, scheduled = %scheduled, "Occurrence already claimed");
            return Ok(CronOutcome::Idle);
        };

        if cron.spec.concurrency_policy == ConcurrencyPolicy::Replace {
            for prior in &status.active {
                tracing::info!(cron = %name, workflow = %prior.name, "Replacing running workflow");
                if let Err(e) = self.controller.terminate_uid(prior.uid).await {
                    tracing::warn!(workflow = %prior.name, error = %e, "Failed to terminate");
                }
            }
        }

        let wf = match self
            .controller
            .submit(TemplateRef::CronWorkflow(&claimed), &SubmitOptions::default())
            .await
        {
            Ok(wf) => wf,
            Err(e) => {
                tracing::error!(cron = %name, scheduled = %scheduled, error = %e, "Cron run lost");
                return Err(e);
            }
        };
        tracing::info!(
            cron = %name,
            workflow = %wf.name(),
            scheduled = %scheduled,
            "Cron workflow fired"
        );

        let mut recorded = claimed.status.clone();
        if !wf.is_terminal() {
            recorded.active.push(ActiveWorkflowRef {
                uid: wf.uid(),
                name: wf.name().to_string(),
            });
        }
        // Active instances are rediscovered from their labels next tick
        if let Err(e) = self.save_status(&claimed, recorded).await {
            tracing::warn!(cron = %name, workflow = %wf.name(), error = %e, "Failed to record active workflow");
        }

        Ok(CronOutcome::Fired {
            workflow: wf.name().to_string(),
        })
    }

    /// Store `status` unless the occurrence was claimed or suspended meanwhile
    async fn claim(
        &self,
        cron: &CronWorkflow,
        status: &CronWorkflowStatus,
        scheduled: DateTime<Utc>,
    ) -> Result<Option<CronWorkflow>, EngineError> {
        let store = self.controller.store();
        let mut current = cron.clone();
        let mut attempts = 0;
        loop {
            current.status = status.clone();
            match store.update_cron(&current).await {
                Ok(claimed) => return Ok(Some(claimed)),
                Err(StoreError::Conflict { .. }) if attempts < STATUS_WRITE_ATTEMPTS => {
                    attempts += 1;
                    current = store
                        .get_cron(&cron.metadata.namespace, &cron.metadata.name)
                        .await?;
                    let taken = current
                        .status
                        .last_scheduled_time
                        .is_some_and(|t| t >= scheduled);
                    if taken || current.spec.suspend {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Live, non-terminal instances created from this cron workflow
    async fn active_instances(
        &self,
        cron: &CronWorkflow,
    ) -> Result<Vec<ActiveWorkflowRef>, EngineError> {
        let mut active: Vec<ActiveWorkflowRef> = self
            .controller
            .list(Some(&cron.metadata.namespace))
            .await?
            .into_iter()
            .filter(|wf| !wf.is_terminal())
            .filter(|wf| wf.metadata.labels.get(LABEL_CRON_WORKFLOW) == Some(&cron.metadata.name))
            .map(|wf| ActiveWorkflowRef {
                uid: wf.uid(),
                name: wf.name().to_string(),
            })
            .collect();

        // Keep the recorded order, newly discovered instances last
        active.sort_by_key(|a| {
            cron.status
                .active
                .iter()
                .position(|known| known.uid == a.uid)
                .unwrap_or(usize::MAX)
        });
        Ok(active)
    }

    /// Write scheduler bookkeeping, reapplying it over concurrent spec edits
    async fn save_status(
        &self,
        cron: &CronWorkflow,
        status: CronWorkflowStatus,
    ) -> Result<CronWorkflow, EngineError> {
        let store = self.controller.store();
        let mut current = cron.clone();
        let mut attempts = 0;
        loop {
            current.status = status.clone();
            match store.update_cron(&current).await {
                Ok(saved) => return Ok(saved),
                Err(StoreError::Conflict { .. }) if attempts < STATUS_WRITE_ATTEMPTS => {
                    attempts += 1;
                    current = store
                        .get_cron(&cron.metadata.namespace, &cron.metadata.name)
                        .await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn watch_key(cron: &CronWorkflow) -> WatchKey {
    (cron.metadata.namespace.clone(), cron.metadata.name.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineConfig;
    use crate::model::{ParameterDef, Phase, StepTemplate, Workflow, WorkflowSpec, WorkflowTemplate};
    use crate::resolver::ResolveError;
    use crate::store::{ArchiveStore, InstanceStore, SqliteStore, WorkflowArchive};
    use crate::worker::scripted::ScriptedWorker;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::VecDeque;
    use uuid::Uuid;

    /// Store whose cron updates fail according to a queued plan
    struct FlakyCronWrites {
        inner: SqliteStore,
        /// `true` fails the matching `update_cron` call; empty means succeed
        plan: Mutex<VecDeque<bool>>,
    }

    impl FlakyCronWrites {
        fn new(plan: &[bool]) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                plan: Mutex::new(plan.iter().copied().collect()),
            }
        }
    }

    #[async_trait]
    impl InstanceStore for FlakyCronWrites {
        async fn create_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
            self.inner.create_workflow(workflow).await
        }
        async fn get_workflow(&self, uid: Uuid) -> Result<Workflow, StoreError> {
            self.inner.get_workflow(uid).await
        }
        async fn get_workflow_by_name(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<Workflow, StoreError> {
            self.inner.get_workflow_by_name(namespace, name).await
        }
        async fn list_workflows(
            &self,
            namespace: Option<&str>,
        ) -> Result<Vec<Workflow>, StoreError> {
            self.inner.list_workflows(namespace).await
        }
        async fn update_workflow(&self, workflow: &Workflow) -> Result<Workflow, StoreError> {
            self.inner.update_workflow(workflow).await
        }
        async fn delete_workflow(&self, uid: Uuid) -> Result<(), StoreError> {
            self.inner.delete_workflow(uid).await
        }
        async fn create_template(
            &self,
            template: &WorkflowTemplate,
        ) -> Result<WorkflowTemplate, StoreError> {
            self.inner.create_template(template).await
        }
        async fn get_template(
            &self,
            namespace: &str,
            name: &str,
        ) -> Result<WorkflowTemplate, StoreError> {
            self.inner.get_template(namespace, name).await
        }
        async fn list_templates(
            &self,
            namespace: Option<&str>,
        ) -> Result<Vec<WorkflowTemplate>, StoreError> {
            self.inner.list_templates(namespace).await
        }
        async fn delete_template(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_template(namespace, name).await
        }
        async fn create_cron(&self, cron: &CronWorkflow) -> Result<CronWorkflow, StoreError> {
            self.inner.create_cron(cron).await
        }
        async fn get_cron(&self, namespace: &str, name: &str) -> Result<CronWorkflow, StoreError> {
            self.inner.get_cron(namespace, name).await
        }
        async fn list_crons(
            &self,
            namespace: Option<&str>,
        ) -> Result<Vec<CronWorkflow>, StoreError> {
            self.inner.list_crons(namespace).await
        }
        async fn update_cron(&self, cron: &CronWorkflow) -> Result<CronWorkflow, StoreError> {
            let fail = self.plan.lock().unwrap().pop_front().unwrap_or(false);
            if fail {
                return Err(StoreError::Storage {
                    message: "disk I/O error".into(),
                });
            }
            self.inner.update_cron(cron).await
        }
        async fn delete_cron(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
            self.inner.delete_cron(namespace, name).await
        }
    }

    struct Harness {
        scheduler: CronScheduler,
        controller: Arc<WorkflowController>,
        worker: Arc<ScriptedWorker>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        harness_with_store(Arc::new(SqliteStore::open_in_memory().unwrap()))
    }

    fn harness_with_store(store: Arc<dyn InstanceStore>) -> Harness {
        let clock = Arc::new(ManualClock::at("2026-01-01T00:00:30Z"));
        let worker = Arc::new(ScriptedWorker::manual());
        let archive: Arc<dyn ArchiveStore> = Arc::new(WorkflowArchive::open_in_memory().unwrap());
        let config = EngineConfig::default();
        let controller = Arc::new(
            WorkflowController::new(store, archive, worker.clone(), &config)
                .with_clock(clock.clone()),
        );
        let scheduler =
            CronScheduler::new(controller.clone(), config.cron.clone()).with_clock(clock.clone());

        Harness {
            scheduler,
            controller,
            worker,
            clock,
        }
    }

    fn every_minute(policy: ConcurrencyPolicy) -> CronWorkflow {
        CronWorkflow::new(
            "ticker",
            "default",
            "* * * * *",
            WorkflowSpec {
                entrypoint: Some("main".into()),
                parameters: vec![],
                steps: vec![StepTemplate::new("main", "echo tick")],
            },
        )
        .with_policy(policy)
    }

    async fn drain(controller: &WorkflowController) {
        while controller.drain_reports().await.unwrap() > 0 {}
    }

    fn only(outcomes: Vec<(String, CronOutcome)>) -> CronOutcome {
        assert_eq!(outcomes.len(), 1);
        outcomes.into_iter().next().unwrap().1
    }

    #[tokio::test]
    async fn test_create_rejects_bad_schedule() {
        let h = harness();
        let mut cron = every_minute(ConcurrencyPolicy::Allow);
        cron.spec.schedule = "every 0 minutes".into();

        let err = h.scheduler.create(cron).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Schedule(ScheduleError::InvalidCronWorkflow { .. })
        ));
        assert!(h.scheduler.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_cyclic_workflow() {
        let h = harness();
        let mut cron = every_minute(ConcurrencyPolicy::Allow);
        cron.spec.workflow_spec.steps = vec![
            StepTemplate::new("main", "echo a").depends_on(&["b"]),
            StepTemplate::new("b", "echo b").depends_on(&["main"]),
        ];

        let errors = match h.scheduler.create(cron).await.unwrap_err() {
            EngineError::Schedule(ScheduleError::InvalidCronWorkflow { errors, .. }) => errors,
            other => panic!("unexpected error: {other}"),
        };
        assert!(errors.iter().any(|e| e.contains("dependency cycle")));
        assert!(h.scheduler.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_missing_required_parameter() {
        let h = harness();
        let mut cron = every_minute(ConcurrencyPolicy::Allow);
        cron.spec.workflow_spec.parameters = vec![ParameterDef {
            name: "target".into(),
            default: None,
            description: String::new(),
        }];
        cron.spec.workflow_spec.steps =
            vec![StepTemplate::new("main", "echo {{ workflow.parameters.target }}")];

        let err = h.scheduler.create(cron).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Resolve(ResolveError::MissingParameter { ref name, .. }) if name == "target"
        ));
        assert!(h.scheduler.list(None).await.unwrap().is_empty());
        assert!(h.controller.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_out_of_range_deadline() {
        let h = harness();
        let cron = every_minute(ConcurrencyPolicy::Allow)
            .with_starting_deadline(10_000_000_000_000_000);

        let err = h.scheduler.create(cron).await.unwrap_err();
        assert!(err.to_string().contains("starting_deadline_seconds"));
        assert!(h.scheduler.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrepresentable_stored_deadline_never_expires() {
        let h = harness();
        for (name, deadline) in [("huge", 10_000_000_000_000_000), ("max", u64::MAX)] {
            let mut cron = every_minute(ConcurrencyPolicy::Allow).with_starting_deadline(deadline);
            cron.metadata.name = name.into();
            cron.metadata.created_at = Some(h.clock.now());
            h.controller.store().create_cron(&cron).await.unwrap();
        }

        h.clock.advance(Duration::seconds(35));
        let outcomes = h.scheduler.tick().await.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(
            outcomes
                .iter()
                .all(|(_, o)| matches!(o, CronOutcome::Fired { .. }))
        );
    }

    #[tokio::test]
    async fn test_failed_claim_fires_nothing_then_fires_once() {
        let h = harness_with_store(Arc::new(FlakyCronWrites::new(&[true])));
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Failed { .. }
        ));
        assert!(h.controller.list(None).await.unwrap().is_empty());

        h.clock.advance(Duration::seconds(5));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));
        h.clock.advance(Duration::seconds(5));
        assert_eq!(only(h.scheduler.tick().await.unwrap()), CronOutcome::Idle);
        assert_eq!(h.controller.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_active_record_does_not_fire_again() {
        let h = harness_with_store(Arc::new(FlakyCronWrites::new(&[false, true])));
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Forbid))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));
        let cron = h.scheduler.get("default", "ticker").await.unwrap();
        assert!(cron.status.active.is_empty());

        h.clock.advance(Duration::seconds(10));
        assert_eq!(only(h.scheduler.tick().await.unwrap()), CronOutcome::Idle);
        assert_eq!(h.controller.list(None).await.unwrap().len(), 1);

        // The running instance is found by its label and still blocks Forbid
        let cron = h.scheduler.get("default", "ticker").await.unwrap();
        assert_eq!(cron.status.active.len(), 1);
        h.clock.advance(Duration::seconds(60));
        assert_eq!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Skipped {
                reason: SkipReason::Forbid
            }
        );
        assert_eq!(h.controller.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_fires_before_first_occurrence() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(20));
        assert_eq!(only(h.scheduler.tick().await.unwrap()), CronOutcome::Idle);
        assert_eq!(h.scheduler.watching(), 1);
        assert!(h.controller.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_allow_creates_concurrent_instances() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        let first = only(h.scheduler.tick().await.unwrap());
        let CronOutcome::Fired { workflow } = first else {
            panic!("expected a fire, got {:?}", first);
        };
        assert!(workflow.starts_with("ticker-"));

        h.clock.advance(Duration::seconds(60));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));

        let instances = h.controller.list(None).await.unwrap();
        assert_eq!(instances.len(), 2);
        assert!(instances.iter().all(|wf| !wf.is_terminal()));
        assert!(instances.iter().all(|wf| {
            wf.metadata.labels.get(crate::model::LABEL_CRON_WORKFLOW) == Some(&"ticker".to_string())
        }));

        let cron = h.scheduler.get("default", "ticker").await.unwrap();
        assert_eq!(cron.status.active.len(), 2);
        assert_eq!(
            cron.status.last_scheduled_time.unwrap().to_rfc3339(),
            "2026-01-01T00:02:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_same_occurrence_fires_once() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        h.scheduler.tick().await.unwrap();
        h.clock.advance(Duration::seconds(10));
        assert_eq!(only(h.scheduler.tick().await.unwrap()), CronOutcome::Idle);
        assert_eq!(h.controller.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_forbid_skips_while_prior_running() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Forbid))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        h.scheduler.tick().await.unwrap();

        h.clock.advance(Duration::seconds(60));
        assert_eq!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Skipped {
                reason: SkipReason::Forbid
            }
        );
        assert_eq!(h.controller.list(None).await.unwrap().len(), 1);

        let cron = h.scheduler.get("default", "ticker").await.unwrap();
        assert_eq!(
            cron.status.last_scheduled_time.unwrap().to_rfc3339(),
            "2026-01-01T00:02:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_forbid_fires_after_prior_finishes() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Forbid))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        h.scheduler.tick().await.unwrap();
        let key = h.worker.started()[0].clone();
        h.worker
            .finish(&key, crate::worker::ReportedStatus::Succeeded);
        h.controller.resync_all().await.unwrap();
        assert_eq!(
            h.controller.get_by_uid(key.workflow_uid).await.unwrap().phase(),
            Phase::Succeeded
        );

        h.clock.advance(Duration::seconds(60));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));
        let cron = h.scheduler.get("default", "ticker").await.unwrap();
        assert_eq!(cron.status.active.len(), 1);
    }

    #[tokio::test]
    async fn test_replace_terminates_prior() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Replace))
            .await
            .unwrap();

        h.clock.advance(Duration::seconds(35));
        h.scheduler.tick().await.unwrap();
        let prior_key = h.worker.started()[0].clone();

        h.clock.advance(Duration::seconds(60));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));
        assert_eq!(h.worker.cancelled(), vec![prior_key.clone()]);

        drain(&h.controller).await;
        let prior = h.controller.get_by_uid(prior_key.workflow_uid).await.unwrap();
        assert_eq!(prior.phase(), Phase::Error);

        let instances = h.controller.list(None).await.unwrap();
        assert_eq!(instances.len(), 2);
        assert_eq!(instances.iter().filter(|wf| !wf.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_deadline_skips_late_run() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow).with_starting_deadline(10))
            .await
            .unwrap();

        // 30s after the 00:01 occurrence
        h.clock.advance(Duration::seconds(60));
        assert_eq!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Skipped {
                reason: SkipReason::Deadline
            }
        );
        assert!(h.controller.list(None).await.unwrap().is_empty());

        h.clock.advance(Duration::seconds(35));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));
    }

    #[tokio::test]
    async fn test_suspended_fires_nothing_and_resume_skips_backlog() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();
        h.scheduler.suspend("default", "ticker").await.unwrap();

        h.clock.advance(Duration::minutes(5));
        assert_eq!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Suspended
        );
        assert!(h.controller.list(None).await.unwrap().is_empty());

        let resumed = h.scheduler.resume("default", "ticker").await.unwrap();
        assert!(!resumed.spec.suspend);

        h.clock.advance(Duration::seconds(10));
        assert_eq!(only(h.scheduler.tick().await.unwrap()), CronOutcome::Idle);

        h.clock.advance(Duration::seconds(30));
        assert!(matches!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Fired { .. }
        ));
    }

    #[tokio::test]
    async fn test_too_many_missed_skips_backlog() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();

        h.clock.advance(Duration::hours(3));
        assert_eq!(
            only(h.scheduler.tick().await.unwrap()),
            CronOutcome::Skipped {
                reason: SkipReason::TooManyMissed
            }
        );
        assert!(h.controller.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_watcher() {
        let h = harness();
        h.scheduler
            .create(every_minute(ConcurrencyPolicy::Allow))
            .await
            .unwrap();
        h.scheduler.tick().await.unwrap();
        assert_eq!(h.scheduler.watching(), 1);

        h.scheduler.delete("default", "ticker").await.unwrap();
        assert_eq!(h.scheduler.watching(), 0);
        assert!(h.scheduler.tick().await.unwrap().is_empty());
    }
}
