//! Dependency graph checks for workflow specs

use super::ResolveError;
use crate::model::{StepTemplate, WorkflowSpec};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

/// Topological sort of all steps, rejecting cycles
///
/// Dependencies always come before their dependents. Among steps that are
/// ready at the same time, declaration order wins.
pub fn topological_order(steps: &[StepTemplate]) -> Result<Vec<String>, ResolveError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.as_str(), i))
        .collect();
    // Unknown names are reported by structural validation
    let deps: Vec<Vec<usize>> = steps
        .iter()
        .map(|s| {
            s.depends_on
                .iter()
                .filter_map(|d| index.get(d.as_str()).copied())
                .collect()
        })
        .collect();

    let mut waiting = vec![0usize; steps.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); steps.len()];
    for (i, step_deps) in deps.iter().enumerate() {
        for &dep in step_deps {
            waiting[i] += 1;
            dependents[dep].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..steps.len())
        .filter(|&i| waiting[i] == 0)
        .map(Reverse)
        .collect();
    let mut result = Vec::with_capacity(steps.len());
    while let Some(Reverse(i)) = ready.pop() {
        result.push(steps[i].name.clone());
        for &next in &dependents[i] {
            waiting[next] -= 1;
            if waiting[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if result.len() == steps.len() {
        return Ok(result);
    }

    // Every unsorted step still waits on another unsorted step, so walking
    // those edges from any of them must revisit a step.
    let Some(start) = (0..steps.len()).find(|&i| waiting[i] > 0) else {
        return Ok(result);
    };
    let mut path = vec![start];
    let mut seen = HashMap::from([(start, 0usize)]);
    let mut current = start;
    while let Some(&next) = deps[current].iter().find(|&&d| waiting[d] > 0) {
        if let Some(&pos) = seen.get(&next) {
            let mut cycle: Vec<&str> = path[pos..].iter().map(|&i| steps[i].name.as_str()).collect();
            cycle.push(steps[next].name.as_str());
            return Err(ResolveError::DependencyDeadlock {
                step: steps[next].name.clone(),
                reason: format!("dependency cycle {}", cycle.join(" -> ")),
            });
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }

    Err(ResolveError::DependencyDeadlock {
        step: steps[start].name.clone(),
        reason: "dependency cycle".to_string(),
    })
}

/// Names of `root` and every step that transitively depends on it
pub fn descendants(steps: &[StepTemplate], root: &str) -> HashSet<String> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for step in steps {
        for dep in &step.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(step.name.as_str());
        }
    }

    let mut reached = HashSet::new();
    let mut queue = VecDeque::from([root]);
    while let Some(name) = queue.pop_front() {
        if !reached.insert(name.to_string()) {
            continue;
        }
        if let Some(next) = dependents.get(name) {
            queue.extend(next.iter().copied());
        }
    }
    reached
}

/// Select the steps executed for `entrypoint`, in topological order
///
/// The selection is the entrypoint plus its descendants. A selected step
/// whose dependency lies outside the selection could never start, so the
/// whole resolution is rejected.
pub fn select<'a>(
    spec: &'a WorkflowSpec,
    entrypoint: &str,
) -> Result<Vec<&'a StepTemplate>, ResolveError> {
    let order = topological_order(&spec.steps)?;
    let selected = descendants(&spec.steps, entrypoint);

    let mut nodes = Vec::with_capacity(selected.len());
    for name in order.iter().filter(|n| selected.contains(n.as_str())) {
        let Some(step) = spec.step(name) else {
            continue;
        };
        for dep in &step.depends_on {
            if !selected.contains(dep) {
                return Err(ResolveError::DependencyDeadlock {
                    step: step.name.clone(),
                    reason: format!(
                        "depends on '{}', which is not reachable from entrypoint '{}'",
                        dep, entrypoint
                    ),
                });
            }
        }
        nodes.push(step);
    }

    Ok(nodes)
}
