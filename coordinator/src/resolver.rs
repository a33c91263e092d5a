//! Dependency resolution: pure functions over task graphs and snapshots
//!
//! The store consults these inside its claim transaction, so eligibility is
//! always re-derived at the moment of the atomic status flip rather than
//! from a possibly-stale earlier query.

use std::collections::{HashMap, HashSet};

use coordinator_sdk::{CoordinationError, TaskSnapshot, TaskSpec, TaskStatus};

/// Validate a decomposition batch before anything is persisted
///
/// Dependencies are zero-based indices into the batch. Rejects out-of-range
/// references, forward/self references, and cycles (checked transitively,
/// although backward-only references already exclude them).
pub fn validate_graph(specs: &[TaskSpec]) -> Result<(), CoordinationError> {
    for (idx, spec) in specs.iter().enumerate() {
        for &dep in &spec.dependencies {
            if dep < 0 || dep as usize >= specs.len() {
                return Err(CoordinationError::InvalidDependency {
                    reason: format!("task {} references unknown task {}", idx, dep),
                });
            }
            if dep as usize >= idx {
                return Err(CoordinationError::InvalidDependency {
                    reason: format!(
                        "task {} references task {} which is not created before it",
                        idx, dep
                    ),
                });
            }
        }
    }

    if let Some(start) = find_cycle(specs) {
        return Err(CoordinationError::InvalidDependency {
            reason: format!("task {} participates in a dependency cycle", start),
        });
    }

    Ok(())
}

/// DFS cycle check over batch indices; returns a task on a cycle, if any
fn find_cycle(specs: &[TaskSpec]) -> Option<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        White,
        Gray,
        Black,
    }

    fn visit(idx: usize, specs: &[TaskSpec], marks: &mut [Mark]) -> bool {
        marks[idx] = Mark::Gray;
        for &dep in &specs[idx].dependencies {
            let dep = dep as usize;
            match marks[dep] {
                Mark::Gray => return true,
                Mark::White => {
                    if visit(dep, specs, marks) {
                        return true;
                    }
                }
                Mark::Black => {}
            }
        }
        marks[idx] = Mark::Black;
        false
    }

    let mut marks = vec![Mark::White; specs.len()];
    for idx in 0..specs.len() {
        if marks[idx] == Mark::White && visit(idx, specs, &mut marks) {
            return Some(idx);
        }
    }
    None
}

/// Tasks that may be claimed right now: pending, with every dependency
/// complete. Returned in creation (id) order so claims are FIFO.
pub fn eligible_tasks(snapshot: &TaskSnapshot) -> Vec<i64> {
    let status_by_id: HashMap<i64, TaskStatus> = snapshot
        .tasks
        .iter()
        .map(|t| (t.task_id, t.status))
        .collect();

    snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.dependencies
                .iter()
                .all(|dep| status_by_id.get(dep) == Some(&TaskStatus::Complete))
        })
        .map(|t| t.task_id)
        .collect()
}

/// Pending tasks doomed by a failed dependency, directly or transitively
///
/// Returns `(task_id, failed_dependency)` pairs in creation order, where
/// the second id is the dependency that doomed the task; for a transitive
/// cascade that is the immediate dependency, so a chain can be walked back
/// to the root failure. Running and terminal tasks are never touched.
pub fn cascade_failures(snapshot: &TaskSnapshot) -> Vec<(i64, i64)> {
    let mut failed: HashSet<i64> = snapshot
        .tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| t.task_id)
        .collect();

    let mut doomed: Vec<(i64, i64)> = Vec::new();
    // Fixpoint over the pending set; tasks are id-ordered and deps point
    // backwards, so one forward pass settles the transitive closure.
    loop {
        let mut changed = false;
        for task in &snapshot.tasks {
            if task.status != TaskStatus::Pending || failed.contains(&task.task_id) {
                continue;
            }
            let culprit = task
                .dependencies
                .iter()
                .copied()
                .find(|dep| failed.contains(dep));
            if let Some(dep) = culprit {
                failed.insert(task.task_id);
                doomed.push((task.task_id, dep));
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    doomed.sort_unstable();
    doomed
}
