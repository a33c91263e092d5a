//! Store-level properties under concurrency: single claim winner,
//! dependency ordering, exactly-once completion after reclaim.

mod common;

use common::{harness, spec};
use coordinator_sdk::TaskStatus;

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    let h = harness();
    h.store.create_tasks(&[spec("only", vec![])]).unwrap();

    let winners = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let store = h.store.clone();
                scope.spawn(move || {
                    store
                        .claim_task(&format!("worker-{}", n))
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|&won| won)
            .count()
    });

    assert_eq!(winners, 1);
}

#[test]
fn claim_never_returns_task_with_incomplete_dependency() {
    let h = harness();
    // Diamond: d depends on b and c, which both depend on a
    let ids = h
        .store
        .create_tasks(&[
            spec("a", vec![]),
            spec("b", vec![0]),
            spec("c", vec![0]),
            spec("d", vec![1, 2]),
        ])
        .unwrap();

    // Walk the graph to completion, checking the invariant at every claim
    let mut completed: Vec<i64> = Vec::new();
    while let Some(task) = h.store.claim_task("w").unwrap() {
        for dep in &task.dependencies {
            assert!(
                completed.contains(dep),
                "task {} claimed before dependency {} completed",
                task.task_id,
                dep
            );
        }
        h.store
            .complete_task(task.task_id, "w", &serde_json::json!({}))
            .unwrap();
        completed.push(task.task_id);
    }

    assert!(h.store.all_done().unwrap());
    assert_eq!(completed.len(), ids.len());
    // FIFO tie-break: a first, then b before c, then d
    assert_eq!(completed, ids);
}

#[test]
fn reclaimed_task_completes_exactly_once() {
    let h = harness();
    h.store.create_tasks(&[spec("t", vec![])]).unwrap();

    let task = h.store.claim_task("crashed").unwrap().unwrap();
    assert!(h.store.reclaim_task(task.task_id).unwrap());

    let task = h.store.claim_task("replacement").unwrap().unwrap();
    h.store
        .complete_task(task.task_id, "replacement", &serde_json::json!({"ok": true}))
        .unwrap();

    // The original owner's late report is rejected, no duplicate completion
    assert!(h
        .store
        .complete_task(task.task_id, "crashed", &serde_json::json!({}))
        .is_err());

    let snapshot = h.store.snapshot().unwrap();
    assert_eq!(snapshot.tasks[0].status, TaskStatus::Complete);
    assert_eq!(snapshot.tasks[0].assigned_to.as_deref(), Some("replacement"));
}

#[test]
fn failed_dependency_cascades_transitively() {
    let h = harness();
    let ids = h
        .store
        .create_tasks(&[
            spec("root", vec![]),
            spec("mid", vec![0]),
            spec("leaf", vec![1]),
            spec("independent", vec![]),
        ])
        .unwrap();

    let root = h.store.claim_task("w").unwrap().unwrap();
    h.store
        .fail_task(root.task_id, "w", &serde_json::json!({"error": "boom"}))
        .unwrap();

    // The independent task is still claimable; the doomed branch is not
    let next = h.store.claim_task("w").unwrap().unwrap();
    assert_eq!(next.task_id, ids[3]);
    h.store
        .complete_task(next.task_id, "w", &serde_json::json!({}))
        .unwrap();

    assert!(h.store.claim_task("w").unwrap().is_none());
    let snapshot = h.store.snapshot().unwrap();
    let mid = snapshot.get(ids[1]).unwrap();
    let leaf = snapshot.get(ids[2]).unwrap();
    assert_eq!(mid.status, TaskStatus::Failed);
    assert_eq!(leaf.status, TaskStatus::Failed);
    // The chain is traceable: leaf blames mid, mid blames root
    assert_eq!(
        mid.result.as_ref().unwrap()["failed_dependency"],
        serde_json::json!(ids[0])
    );
    assert_eq!(
        leaf.result.as_ref().unwrap()["failed_dependency"],
        serde_json::json!(ids[1])
    );
    assert!(snapshot.all_done());
}

#[test]
fn cycle_in_decomposition_is_rejected_before_persisting() {
    let h = harness();
    // Forward reference (0 -> 1) makes this malformed
    let result = h
        .store
        .create_tasks(&[spec("a", vec![1]), spec("b", vec![0])]);
    assert!(result.is_err());
    assert!(h.store.snapshot().unwrap().tasks.is_empty());
}
