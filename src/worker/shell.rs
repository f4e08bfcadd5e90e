//! Local shell worker

use super::{
    Observation, ReportSender, ReportedStatus, WorkKey, WorkRequest, WorkerError, WorkerProvider,
    WorkerReport,
};
use crate::model::NodeOutcome;
use crate::signals::CancellationToken;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Mutex;

enum Job {
    Running(CancellationToken),
    Finished(WorkerReport),
}

/// Runs node commands through `sh -c` on the local machine
pub struct ShellWorker {
    working_dir: PathBuf,
    jobs: Arc<Mutex<HashMap<WorkKey, Job>>>,
}

impl ShellWorker {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl WorkerProvider for ShellWorker {
    fn name(&self) -> &str {
        "shell"
    }

    async fn start(&self, request: WorkRequest, reports: ReportSender) -> Result<(), WorkerError> {
        let token = CancellationToken::new();
        {
            let mut jobs = self.jobs.lock().await;
            if jobs.contains_key(&request.key) {
                return Ok(());
            }
            jobs.insert(request.key.clone(), Job::Running(token.clone()));
        }

        tracing::debug!(key = %request.key, command = %request.command, "Starting shell work");

        let jobs = Arc::clone(&self.jobs);
        let working_dir = self.working_dir.clone();
        tokio::spawn(async move {
            let (status, outcome) = run_command(&request.command, &working_dir, &token).await;
            let report = WorkerReport::new(request.key.clone(), status, outcome);

            // Cancelled work is never observed again
            let mut held = jobs.lock().await;
            if token.is_cancelled() {
                held.remove(&request.key);
            } else {
                held.insert(request.key, Job::Finished(report.clone()));
            }
            drop(held);

            // Receiver gone means the controller shut down; polling covers the rest
            let _ = reports.send(report);
        });

        Ok(())
    }

    async fn observe(&self, key: &WorkKey) -> Result<Observation, WorkerError> {
        let jobs = self.jobs.lock().await;
        Ok(match jobs.get(key) {
            Some(Job::Running(_)) => Observation::Running,
            Some(Job::Finished(report)) => Observation::Finished(report.clone()),
            None => Observation::Vanished,
        })
    }

    async fn cancel(&self, key: &WorkKey) -> Result<(), WorkerError> {
        let mut jobs = self.jobs.lock().await;
        match jobs.get(key) {
            Some(Job::Running(token)) => {
                tracing::debug!(%key, "Cancelling shell work");
                token.cancel();
            }
            Some(Job::Finished(_)) => {
                jobs.remove(key);
            }
            None => {}
        }
        Ok(())
    }

    async fn forget(&self, key: &WorkKey) {
        let mut jobs = self.jobs.lock().await;
        if matches!(jobs.get(key), Some(Job::Finished(_))) {
            jobs.remove(key);
        }
    }
}

/// Execute a command, killing it if `token` fires first
async fn run_command(
    command: &str,
    working_dir: &Path,
    token: &CancellationToken,
) -> (ReportedStatus, NodeOutcome) {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(e) => {
            return (
                ReportedStatus::Error,
                NodeOutcome::message(format!("failed to spawn: {}", e)),
            );
        }
    };

    // Dropping the wait future drops the child, which kills it
    let output = tokio::select! {
        output = child.wait_with_output() => output,
        _ = token.cancelled() => {
            return (ReportedStatus::Error, NodeOutcome::message("cancelled"));
        }
    };

    match output {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let code = output.status.code();

            if output.status.success() {
                let outcome = NodeOutcome::exit(0).with_output(stdout);
                (ReportedStatus::Succeeded, outcome)
            } else {
                let message = match code {
                    Some(code) if stderr.is_empty() => format!("exit code {}", code),
                    Some(code) => format!("exit code {}: {}", code, stderr),
                    None => "terminated by signal".to_string(),
                };
                let outcome = NodeOutcome {
                    exit_code: code,
                    message: Some(message),
                    output: Some(stdout),
                };
                (ReportedStatus::Failed, outcome)
            }
        }
        Err(e) => (
            ReportedStatus::Error,
            NodeOutcome::message(format!("failed to wait: {}", e)),
        ),
    }
}
