//! In-process worker whose outcomes are scripted by tests

use super::{
    Observation, ReportSender, ReportedStatus, WorkKey, WorkRequest, WorkerError, WorkerProvider,
    WorkerReport,
};
use crate::model::NodeOutcome;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct State {
    started: Vec<WorkRequest>,
    cancelled: Vec<WorkKey>,
    senders: HashMap<WorkKey, ReportSender>,
    finished: HashMap<WorkKey, WorkerReport>,
    vanished: Vec<WorkKey>,
    /// Per-node outcomes consumed one per attempt
    scripts: HashMap<String, VecDeque<ReportedStatus>>,
    unavailable_observations: u32,
}

/// Worker that records requests and reports what the test tells it to
pub struct ScriptedWorker {
    state: Mutex<State>,
    /// Report immediately on start using scripts, falling back to this
    auto: Option<ReportedStatus>,
    /// Answer cancellation with an `Error` report
    ack_cancel: bool,
}

impl ScriptedWorker {
    /// Never reports on its own; tests deliver reports by hand
    pub fn manual() -> Self {
        Self {
            state: Mutex::new(State::default()),
            auto: None,
            ack_cancel: true,
        }
    }

    /// Reports every start immediately with `status` unless scripted otherwise
    pub fn auto(status: ReportedStatus) -> Self {
        Self {
            auto: Some(status),
            ..Self::manual()
        }
    }

    pub fn ignore_cancel(mut self) -> Self {
        self.ack_cancel = false;
        self
    }

    /// Queue outcomes for successive attempts of `node`
    pub fn script(self, node: &str, outcomes: &[ReportedStatus]) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripts
                .entry(node.to_string())
                .or_default()
                .extend(outcomes.iter().copied());
        }
        self
    }

    pub fn fail_next_observations(&self, count: u32) {
        self.state.lock().unwrap().unavailable_observations = count;
    }

    pub fn vanish(&self, key: &WorkKey) {
        let mut state = self.state.lock().unwrap();
        state.senders.remove(key);
        state.vanished.push(key.clone());
    }

    pub fn finish(&self, key: &WorkKey, status: ReportedStatus) {
        let report = WorkerReport::new(key.clone(), status, outcome_for(status));
        self.state
            .lock()
            .unwrap()
            .finished
            .insert(key.clone(), report);
    }

    pub fn started(&self) -> Vec<WorkKey> {
        let state = self.state.lock().unwrap();
        state.started.iter().map(|r| r.key.clone()).collect()
    }

    pub fn started_requests(&self) -> Vec<WorkRequest> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn started_nodes(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.started.iter().map(|r| r.key.node.clone()).collect()
    }

    pub fn cancelled(&self) -> Vec<WorkKey> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

fn outcome_for(status: ReportedStatus) -> NodeOutcome {
    match status {
        ReportedStatus::Succeeded => NodeOutcome::exit(0),
        ReportedStatus::Failed => NodeOutcome {
            exit_code: Some(1),
            message: Some("exit code 1".into()),
            output: None,
        },
        ReportedStatus::Error => NodeOutcome::message("scripted error"),
    }
}

#[async_trait]
impl WorkerProvider for ScriptedWorker {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn start(&self, request: WorkRequest, reports: ReportSender) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap();
        if state.started.iter().any(|r| r.key == request.key) {
            return Ok(());
        }

        let scripted = state
            .scripts
            .get_mut(&request.key.node)
            .and_then(|q| q.pop_front());
        let key = request.key.clone();
        state.started.push(request);

        match scripted.or(self.auto) {
            Some(status) => {
                let report = WorkerReport::new(key.clone(), status, outcome_for(status));
                state.finished.insert(key, report.clone());
                let _ = reports.send(report);
            }
            None => {
                state.senders.insert(key, reports);
            }
        }
        Ok(())
    }

    async fn observe(&self, key: &WorkKey) -> Result<Observation, WorkerError> {
        let mut state = self.state.lock().unwrap();
        if state.unavailable_observations > 0 {
            state.unavailable_observations -= 1;
            return Err(WorkerError::Unavailable {
                message: "scripted outage".into(),
            });
        }
        if state.vanished.contains(key) {
            return Ok(Observation::Vanished);
        }
        if let Some(report) = state.finished.get(key) {
            return Ok(Observation::Finished(report.clone()));
        }
        if state.started.iter().any(|r| &r.key == key) {
            return Ok(Observation::Running);
        }
        Ok(Observation::Vanished)
    }

    async fn cancel(&self, key: &WorkKey) -> Result<(), WorkerError> {
        let mut state = self.state.lock().unwrap();
        state.cancelled.push(key.clone());
        if self.ack_cancel && !state.finished.contains_key(key) {
            let report = WorkerReport::new(
                key.clone(),
                ReportedStatus::Error,
                NodeOutcome::message("cancelled"),
            );
            state.finished.insert(key.clone(), report.clone());
            if let Some(sender) = state.senders.remove(key) {
                let _ = sender.send(report);
            }
        }
        Ok(())
    }
}
