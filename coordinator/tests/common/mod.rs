//! Common test utilities for coordinator integration tests

use coordinator_sdk::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coordinator::config::CoordinatorConfig;
use coordinator::locks::LockManager;
use coordinator::mailbox::Mailbox;
use coordinator::store::{SessionDb, TaskStore};
use coordinator_sdk::{CoordinationError, ExecutionInput, Executor, TaskSpec};

/// Shared components over one in-memory session database
pub struct TestHarness {
    pub store: Arc<TaskStore>,
    pub mailbox: Arc<Mailbox>,
    pub locks: Arc<LockManager>,
}

pub fn harness() -> TestHarness {
    let db = Arc::new(SessionDb::in_memory().unwrap());
    TestHarness {
        store: Arc::new(TaskStore::new(db.clone())),
        mailbox: Arc::new(Mailbox::new(db.clone())),
        locks: Arc::new(LockManager::new(db)),
    }
}

/// Config with tight timings so tests finish quickly
pub fn fast_config(workers: usize) -> CoordinatorConfig {
    CoordinatorConfig {
        workers,
        task_timeout_secs: 5,
        stall_timeout_secs: 1,
        run_timeout_secs: 30,
        poll_interval_ms: 10,
        max_poll_interval_ms: 50,
        store_retry_attempts: 3,
        db_path: None,
    }
}

pub fn spec(description: &str, dependencies: Vec<i64>) -> TaskSpec {
    TaskSpec {
        description: description.to_string(),
        dependencies,
    }
}

/// Executor scripted by task description
///
/// - `fail:<reason>` fails with the reason
/// - `sleep:<ms>` sleeps that long, then succeeds
/// - anything else succeeds immediately
///
/// Execution counts per description are recorded so tests can assert a
/// task ran exactly once, or never.
pub struct ScriptedExecutor {
    executions: Mutex<HashMap<String, usize>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            executions: Mutex::new(HashMap::new()),
        }
    }

    pub fn execution_count(&self, description: &str) -> usize {
        *self
            .executions
            .lock()
            .unwrap()
            .get(description)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<serde_json::Value, CoordinationError> {
        *self
            .executions
            .lock()
            .unwrap()
            .entry(input.description.clone())
            .or_insert(0) += 1;

        if let Some(reason) = input.description.strip_prefix("fail:") {
            return Err(CoordinationError::ExecutionFailure {
                task_id: input.task_id,
                error: reason.to_string(),
            });
        }
        if let Some(ms) = input.description.strip_prefix("sleep:") {
            let ms: u64 = ms.parse().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }

        Ok(serde_json::json!({
            "done": input.description,
            "inputs": input.dependency_results,
        }))
    }
}
