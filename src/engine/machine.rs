//! Node state machine transitions
//!
//! Every function here mutates a workflow in memory and performs no I/O.
//! Transitions are guarded on the current phase and attempt, so applying the
//! same report twice, or a report for an old attempt, changes nothing.

use crate::model::{Phase, Workflow};
use crate::worker::WorkerReport;
use chrono::{DateTime, Utc};
use std::collections::HashSet;

pub const MSG_TERMINATED: &str = "terminated";
const MSG_UPSTREAM_FAILED: &str = "omitted: an upstream node did not succeed";
const MSG_GRACE_EXPIRED: &str = "terminated: grace period expired";

/// Effect of applying one worker report
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Applied { node: String, phase: Phase },
    /// Failed attempt went back to `Pending` for another try
    Requeued { node: String, attempt: u32 },
    Ignored(&'static str),
}

/// Apply a worker report if it matches the node's current attempt
pub fn apply_report(wf: &mut Workflow, report: &WorkerReport, now: DateTime<Utc>) -> Transition {
    if wf.is_terminal() {
        return Transition::Ignored("workflow is terminal");
    }
    let retry_allowed = wf.status.terminating_at.is_none();

    let Some(node) = wf.status.nodes.get_mut(&report.key.node) else {
        return Transition::Ignored("unknown node");
    };
    if node.phase != Phase::Running || node.attempt != report.key.attempt {
        return Transition::Ignored("stale report");
    }

    let phase: Phase = report.status.into();
    node.outcome = Some(report.outcome.clone());
    node.message = report.outcome.message.clone();
    node.finished_at = Some(now);

    if phase != Phase::Succeeded && retry_allowed && node.retries_left() {
        node.phase = Phase::Pending;
        tracing::debug!(
            workflow = %wf.metadata.name,
            node = %node.name,
            attempt = node.attempt,
            retry_limit = node.retry_limit,
            "Node attempt failed, requeued"
        );
        return Transition::Requeued {
            node: node.name.clone(),
            attempt: node.attempt,
        };
    }

    node.phase = phase;
    tracing::debug!(
        workflow = %wf.metadata.name,
        node = %node.name,
        %phase,
        "Node transitioned"
    );
    Transition::Applied {
        node: node.name.clone(),
        phase,
    }
}

/// Start ready nodes, omit unreachable ones and re-aggregate the phase
///
/// Returns the names of nodes moved to `Running`; the caller dispatches them.
pub fn advance(wf: &mut Workflow, now: DateTime<Utc>) -> Vec<String> {
    if wf.is_terminal() {
        return Vec::new();
    }
    if wf.status.started_at.is_none() {
        wf.status.started_at = Some(now);
    }

    let terminating = wf.status.terminating_at.is_some();
    let failing = wf
        .status
        .nodes
        .values()
        .any(|n| matches!(n.phase, Phase::Failed | Phase::Error));

    let mut started = Vec::new();
    if terminating || failing {
        let reason = if terminating {
            MSG_TERMINATED
        } else {
            MSG_UPSTREAM_FAILED
        };
        for node in wf.status.nodes.values_mut() {
            if node.phase == Phase::Pending {
                node.phase = Phase::Omitted;
                node.finished_at = Some(now);
                node.message = Some(reason.to_string());
            }
        }
    } else {
        let known: HashSet<String> = wf.status.nodes.keys().cloned().collect();
        let succeeded: HashSet<String> = wf
            .status
            .nodes
            .values()
            .filter(|n| n.phase == Phase::Succeeded)
            .map(|n| n.name.clone())
            .collect();

        for node in wf.status.nodes.values_mut() {
            if node.phase != Phase::Pending {
                continue;
            }
            if let Some(dep) = node.depends_on.iter().find(|d| !known.contains(*d)) {
                node.phase = Phase::Error;
                node.finished_at = Some(now);
                node.message = Some(format!(
                    "dependency deadlock: '{}' is not part of this workflow",
                    dep
                ));
                continue;
            }
            if node.depends_on.iter().all(|d| succeeded.contains(d)) {
                node.phase = Phase::Running;
                node.attempt += 1;
                node.started_at = Some(now);
                node.finished_at = None;
                node.outcome = None;
                node.message = None;
                started.push(node.name.clone());
            }
        }
    }

    aggregate(wf, now);
    started
}

/// Derive the workflow phase from its nodes
pub fn aggregate(wf: &mut Workflow, now: DateTime<Utc>) {
    if wf.is_terminal() {
        return;
    }
    if wf.status.nodes.values().any(|n| !n.phase.is_terminal()) {
        wf.status.phase = Phase::Running;
        return;
    }

    let first = |phase: Phase| wf.status.nodes.values().find(|n| n.phase == phase);
    let (phase, message) = if wf.status.terminating_at.is_some() {
        (Phase::Error, Some(MSG_TERMINATED.to_string()))
    } else if let Some(node) = first(Phase::Error) {
        (Phase::Error, Some(node_message(&node.path, node.message.as_deref())))
    } else if let Some(node) = first(Phase::Failed) {
        (Phase::Failed, Some(node_message(&node.path, node.message.as_deref())))
    } else {
        (Phase::Succeeded, None)
    };

    wf.status.phase = phase;
    wf.status.message = message;
    wf.status.finished_at = Some(now);
    tracing::info!(
        workflow = %wf.metadata.name,
        namespace = %wf.metadata.namespace,
        %phase,
        "Workflow finished"
    );
}

fn node_message(path: &str, detail: Option<&str>) -> String {
    match detail {
        Some(detail) => format!("node {} did not succeed: {}", path, detail),
        None => format!("node {} did not succeed", path),
    }
}

/// Mark a workflow for termination
///
/// Returns `(node, attempt)` for every running node that must be asked to
/// stop. Pending nodes are omitted by the next [`advance`].
pub fn terminate(wf: &mut Workflow, now: DateTime<Utc>) -> Vec<(String, u32)> {
    if wf.is_terminal() {
        return Vec::new();
    }
    if wf.status.terminating_at.is_none() {
        wf.status.terminating_at = Some(now);
        tracing::info!(workflow = %wf.metadata.name, "Terminating workflow");
    }
    running(wf)
}

/// Force nodes still running after the grace period into `Error`
pub fn enforce_grace(
    wf: &mut Workflow,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> Vec<(String, u32)> {
    let Some(since) = wf.status.terminating_at else {
        return Vec::new();
    };
    if wf.is_terminal() || now < since + grace {
        return Vec::new();
    }

    let forced = running(wf);
    for (name, _) in &forced {
        if let Some(node) = wf.status.nodes.get_mut(name) {
            node.phase = Phase::Error;
            node.finished_at = Some(now);
            node.message = Some(MSG_GRACE_EXPIRED.to_string());
        }
    }
    if !forced.is_empty() {
        tracing::warn!(
            workflow = %wf.metadata.name,
            nodes = forced.len(),
            "Grace period expired, forcing running nodes to Error"
        );
    }
    forced
}

fn running(wf: &Workflow) -> Vec<(String, u32)> {
    wf.status
        .nodes
        .values()
        .filter(|n| n.phase == Phase::Running)
        .map(|n| (n.name.clone(), n.attempt))
        .collect()
}
