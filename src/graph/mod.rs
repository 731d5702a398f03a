//! Task dependency graph
//!
//! The task state machine, readiness evaluation against typed dependencies,
//! cycle detection, topological ordering, and the critical path. Dependencies
//! are stored on the dependent task and point at predecessors.

pub mod decomposer;
pub mod estimator;

pub use decomposer::{DecompositionOptions, DecompositionRule, Decomposer, TaskTemplate};
pub use estimator::{auto_estimate, infer_capabilities};

use crate::models::{DependencyKind, Task, TaskStatus};
use crate::{OrchestratorError, Result};
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// States reachable from `from` in a single step.
///
/// SKIPPED is entered from PENDING/READY when a required predecessor ends in
/// a state that can never satisfy the dependency.
pub fn allowed_task_transitions(from: TaskStatus) -> &'static [TaskStatus] {
    use TaskStatus::*;
    match from {
        Pending => &[Ready, Assigned, Cancelled, Skipped],
        Ready => &[Assigned, Cancelled, Skipped],
        Assigned => &[InProgress, Cancelled],
        InProgress => &[Completed, Failed, Blocked, Paused],
        Blocked => &[InProgress, Cancelled],
        Paused => &[InProgress, Cancelled],
        Completed | Failed | Cancelled | Skipped => &[],
    }
}

/// Apply a task status transition. `started_at` is stamped exactly once on
/// the first IN_PROGRESS entry, `completed_at` on reaching COMPLETED.
pub fn transition_task(task: &mut Task, to: TaskStatus) -> Result<()> {
    let from = task.status;
    if !allowed_task_transitions(from).contains(&to) {
        return Err(OrchestratorError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    let now = Utc::now();
    task.status = to;
    task.updated_at = now;

    match to {
        TaskStatus::InProgress => {
            if task.started_at.is_none() {
                task.started_at = Some(now);
            }
        }
        TaskStatus::Completed => {
            if task.completed_at.is_none() {
                task.completed_at = Some(now);
            }
        }
        _ => {}
    }
    Ok(())
}

/// Whether a predecessor satisfies the start-side constraint of `kind`.
///
/// FINISH_TO_FINISH and START_TO_FINISH constrain the dependent's finish,
/// not its start, so they never hold a task out of READY.
pub fn start_satisfied(kind: DependencyKind, predecessor: &Task) -> bool {
    match kind {
        DependencyKind::FinishToStart => predecessor.status == TaskStatus::Completed,
        DependencyKind::StartToStart => {
            predecessor.has_started() || predecessor.status == TaskStatus::Completed
        }
        DependencyKind::FinishToFinish | DependencyKind::StartToFinish => true,
    }
}

/// Whether a predecessor satisfies the finish-side constraint of `kind`.
pub fn finish_satisfied(kind: DependencyKind, predecessor: &Task) -> bool {
    match kind {
        DependencyKind::FinishToFinish => predecessor.status == TaskStatus::Completed,
        DependencyKind::StartToFinish => {
            predecessor.has_started() || predecessor.status == TaskStatus::Completed
        }
        DependencyKind::FinishToStart | DependencyKind::StartToStart => true,
    }
}

/// A task is ready to start when every required dependency's start
/// constraint holds. Missing predecessors count as unsatisfied.
pub fn is_ready(task: &Task, by_id: &HashMap<Uuid, Task>) -> bool {
    task.dependencies
        .iter()
        .filter(|dependency| dependency.required)
        .all(|dependency| {
            by_id
                .get(&dependency.target_task_id)
                .map(|predecessor| start_satisfied(dependency.kind, predecessor))
                .unwrap_or(false)
        })
}

/// A task may complete when every required finish constraint holds.
pub fn can_complete(task: &Task, by_id: &HashMap<Uuid, Task>) -> bool {
    task.dependencies
        .iter()
        .filter(|dependency| dependency.required)
        .all(|dependency| {
            by_id
                .get(&dependency.target_task_id)
                .map(|predecessor| finish_satisfied(dependency.kind, predecessor))
                .unwrap_or(false)
        })
}

/// A start constraint that can never be satisfied any more: the required
/// predecessor already ended without meeting it.
pub fn unsatisfiable(task: &Task, by_id: &HashMap<Uuid, Task>) -> bool {
    task.dependencies
        .iter()
        .filter(|dependency| dependency.required)
        .any(|dependency| match by_id.get(&dependency.target_task_id) {
            Some(predecessor) => {
                predecessor.status.is_terminal()
                    && !start_satisfied(dependency.kind, predecessor)
            }
            None => false,
        })
}

/// PENDING tasks whose required start constraints are all satisfied,
/// in deterministic id order. Readiness is monotonic: predecessors only
/// move forward, so a task reported here never becomes un-ready.
pub fn ready_task_ids(tasks: &[Task]) -> Vec<Uuid> {
    let by_id: HashMap<Uuid, Task> = tasks.iter().map(|task| (task.id, task.clone())).collect();
    let mut ready: Vec<Uuid> = tasks
        .iter()
        .filter(|task| task.status == TaskStatus::Pending && is_ready(task, &by_id))
        .map(|task| task.id)
        .collect();
    ready.sort();
    ready
}

fn adjacency(tasks: &[Task]) -> (HashMap<Uuid, Vec<Uuid>>, HashMap<Uuid, usize>) {
    let ids: HashSet<Uuid> = tasks.iter().map(|task| task.id).collect();
    // Edges run predecessor -> dependent.
    let mut successors: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    let mut indegree: HashMap<Uuid, usize> = tasks.iter().map(|task| (task.id, 0)).collect();

    for task in tasks {
        for dependency in &task.dependencies {
            if !ids.contains(&dependency.target_task_id) {
                continue;
            }
            successors
                .entry(dependency.target_task_id)
                .or_default()
                .push(task.id);
            *indegree.entry(task.id).or_default() += 1;
        }
    }
    (successors, indegree)
}

/// Kahn's algorithm; ties resolved by smallest id for a stable order.
pub fn topological_order(tasks: &[Task]) -> Result<Vec<Uuid>> {
    let (successors, mut indegree) = adjacency(tasks);

    let mut frontier: VecDeque<Uuid> = {
        let mut roots: Vec<Uuid> = indegree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| *id)
            .collect();
        roots.sort();
        roots.into()
    };

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = frontier.pop_front() {
        order.push(id);
        let mut unlocked = Vec::new();
        for successor in successors.get(&id).into_iter().flatten() {
            if let Some(degree) = indegree.get_mut(successor) {
                *degree -= 1;
                if *degree == 0 {
                    unlocked.push(*successor);
                }
            }
        }
        unlocked.sort();
        for id in unlocked {
            frontier.push_back(id);
        }
    }

    if order.len() != tasks.len() {
        let stuck: Vec<String> = indegree
            .iter()
            .filter(|(id, degree)| **degree > 0 && !order.contains(id))
            .map(|(id, _)| id.to_string())
            .collect();
        return Err(OrchestratorError::CycleDetected(stuck.join(", ")));
    }
    Ok(order)
}

/// Cycle check, run on every structural mutation of the graph.
pub fn detect_cycle(tasks: &[Task]) -> Result<()> {
    topological_order(tasks).map(|_| ())
}

/// Longest path through the DAG weighted by expected hours.
///
/// Ties between equally long paths break toward the lexicographically
/// smaller task id, which keeps the result stable across runs.
pub fn critical_path(tasks: &[Task]) -> Result<Vec<Uuid>> {
    let order = topological_order(tasks)?;
    let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|task| (task.id, task)).collect();

    // Longest distance ending at each node, tracking the best predecessor.
    let mut distance: HashMap<Uuid, f64> = HashMap::new();
    let mut best_predecessor: HashMap<Uuid, Uuid> = HashMap::new();

    for id in &order {
        let task = by_id[id];
        let own = task.expected_hours();
        let mut best: Option<(f64, Uuid)> = None;
        for dependency in &task.dependencies {
            let Some(&through) = distance.get(&dependency.target_task_id) else {
                continue;
            };
            let better = match best {
                None => true,
                Some((length, tie_id)) => {
                    through > length
                        || (through == length && dependency.target_task_id < tie_id)
                }
            };
            if better {
                best = Some((through, dependency.target_task_id));
            }
        }
        match best {
            Some((length, predecessor)) => {
                distance.insert(*id, own + length);
                best_predecessor.insert(*id, predecessor);
            }
            None => {
                distance.insert(*id, own);
            }
        }
    }

    let Some((&end, _)) = distance
        .iter()
        .max_by(|a, b| {
            a.1.partial_cmp(b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                // Prefer the smaller id on equal length.
                .then_with(|| b.0.cmp(a.0))
        })
    else {
        return Ok(Vec::new());
    };

    let mut path = vec![end];
    let mut cursor = end;
    while let Some(&predecessor) = best_predecessor.get(&cursor) {
        path.push(predecessor);
        cursor = predecessor;
    }
    path.reverse();
    Ok(path)
}

/// Total expected hours along the critical path: the minimum expected
/// duration of the whole graph.
pub fn critical_path_hours(tasks: &[Task]) -> Result<f64> {
    let path = critical_path(tasks)?;
    let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|task| (task.id, task)).collect();
    Ok(path.iter().map(|id| by_id[id].expected_hours()).sum())
}
