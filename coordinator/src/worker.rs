//! Worker loop: claim, execute, report, repeat
//!
//! A worker cycles idle -> claiming -> executing -> reporting until the
//! store reports all work settled (or the supervisor broadcasts terminate).
//! Finding no eligible task is not termination by itself: dependencies may
//! still be running on sibling workers, so the worker backs off and polls
//! again unless `all_done()` holds.
//!
//! The one property everything here protects: a claim is always balanced
//! by exactly one complete/fail report, or the claim is handed back. A
//! worker never exits holding a claimed task.
//!
//! Store and mailbox calls go through `with_store_retries`: transient
//! infrastructure errors are retried a bounded number of times and only
//! then escalate (as `StoreUnavailable`) to the supervisor. Contract
//! errors are never retried.

use anyhow::Result;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use coordinator_sdk::{
    log_task_claimed, log_task_complete, log_task_failed, log_warning, log_worker_finished,
    AgentRole, CoordinationError, ExecutionInput, Executor, MessagePayload, TaskRecord,
};

use crate::config::CoordinatorConfig;
use crate::mailbox::Mailbox;
use crate::store::TaskStore;

/// What a worker did before finishing
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStats {
    pub completed: usize,
    pub failed: usize,
}

/// Bounded retries for store and mailbox operations
///
/// Contract errors (invalid transition, invalid dependency) are returned
/// unchanged on the first attempt: retrying cannot change their outcome.
/// Anything else counts as infrastructure trouble and is retried with a
/// short growing delay; once attempts are exhausted the last error is
/// wrapped as `StoreUnavailable` and escalates to the caller.
pub(crate) async fn with_store_retries<T>(
    attempts: u32,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 0..attempts {
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if error.downcast_ref::<CoordinationError>().is_some() {
                    return Err(error);
                }
                last_error = Some(error);
                if attempt + 1 < attempts {
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
            }
        }
    }
    let detail = last_error.unwrap().to_string();
    Err(CoordinationError::StoreUnavailable { detail }.into())
}

pub struct Worker {
    agent_id: String,
    supervisor_id: String,
    store: Arc<TaskStore>,
    mailbox: Arc<Mailbox>,
    executor: Arc<dyn Executor>,
    config: CoordinatorConfig,
}

impl Worker {
    pub fn new(
        agent_id: String,
        supervisor_id: String,
        store: Arc<TaskStore>,
        mailbox: Arc<Mailbox>,
        executor: Arc<dyn Executor>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            agent_id,
            supervisor_id,
            store,
            mailbox,
            executor,
            config,
        }
    }

    /// Run until no work remains or terminate is received
    pub async fn run(self) -> Result<WorkerStats> {
        let attempts = self.config.store_retry_attempts;
        with_store_retries(attempts, || {
            self.mailbox.register_agent(&self.agent_id, AgentRole::Worker)
        })
        .await?;

        let mut stats = WorkerStats::default();
        let mut backoff_ms = self.config.poll_interval_ms;

        loop {
            with_store_retries(attempts, || self.mailbox.heartbeat(&self.agent_id)).await?;

            // Claiming
            let claimed =
                with_store_retries(attempts, || self.store.claim_task(&self.agent_id)).await?;

            match claimed {
                Some(task) => {
                    backoff_ms = self.config.poll_interval_ms;
                    log_task_claimed!(task.task_id, self.agent_id, task.description);

                    // Cancellation point: between claiming and executing,
                    // never mid-execution. A terminate here hands the
                    // unexecuted claim back rather than abandoning it.
                    if self.drain_mailbox().await? {
                        with_store_retries(attempts, || self.store.reclaim_task(task.task_id))
                            .await?;
                        break;
                    }

                    // Executing + reporting
                    with_store_retries(attempts, || self.mailbox.heartbeat(&self.agent_id))
                        .await?;
                    match self.execute_and_report(&task).await? {
                        true => stats.completed += 1,
                        false => stats.failed += 1,
                    }
                }
                None => {
                    if self.drain_mailbox().await? {
                        break;
                    }
                    if with_store_retries(attempts, || self.store.all_done()).await? {
                        break;
                    }
                    self.sleep_with_jitter(backoff_ms).await;
                    backoff_ms = (backoff_ms * 2).min(self.config.max_poll_interval_ms);
                }
            }
        }

        log_worker_finished!(self.agent_id, stats.completed, stats.failed);
        Ok(stats)
    }

    /// Execute one claimed task and report the outcome; true on completion
    ///
    /// Every path out of here has called `complete_task` or `fail_task`
    /// (or observed that the supervisor reclaimed the task underneath us,
    /// in which case the new owner reports instead).
    async fn execute_and_report(&self, task: &TaskRecord) -> Result<bool> {
        let attempts = self.config.store_retry_attempts;
        let dependency_results =
            with_store_retries(attempts, || self.store.dependency_results(task)).await?;
        let input = ExecutionInput {
            task_id: task.task_id,
            description: task.description.clone(),
            dependency_results,
        };

        // Keep heartbeating while the executor runs so a slow task is not
        // mistaken for a crashed worker.
        let exec = tokio::time::timeout(self.config.task_timeout(), self.executor.execute(input));
        tokio::pin!(exec);
        // Beat well inside the stall window so a busy worker never looks dead
        let beat_every = Duration::from_millis((self.config.stall_timeout_secs * 1000 / 3).max(100));
        let mut beats = tokio::time::interval(beat_every);
        let outcome = loop {
            tokio::select! {
                outcome = &mut exec => break outcome,
                _ = beats.tick() => {
                    with_store_retries(attempts, || self.mailbox.heartbeat(&self.agent_id))
                        .await?;
                }
            }
        };

        let (completed, payload) = match outcome {
            Ok(Ok(result)) => (true, result),
            Ok(Err(error)) => (
                false,
                serde_json::json!({
                    "error_kind": "execution_failure",
                    "error": error.to_string(),
                }),
            ),
            Err(_) => {
                let error = CoordinationError::ExecutionTimeout {
                    task_id: task.task_id,
                    timeout_secs: self.config.task_timeout_secs,
                };
                (
                    false,
                    serde_json::json!({
                        "error_kind": "timeout",
                        "error": error.to_string(),
                        "timeout_secs": self.config.task_timeout_secs,
                    }),
                )
            }
        };

        let report = if completed {
            with_store_retries(attempts, || {
                self.store
                    .complete_task(task.task_id, &self.agent_id, &payload)
            })
            .await
        } else {
            with_store_retries(attempts, || {
                self.store.fail_task(task.task_id, &self.agent_id, &payload)
            })
            .await
        };

        match report {
            Ok(()) => {
                let message = if completed {
                    log_task_complete!(task.task_id, self.agent_id);
                    MessagePayload::TaskComplete {
                        task_id: task.task_id,
                    }
                } else {
                    let error = payload["error"].as_str().unwrap_or("unknown").to_string();
                    log_task_failed!(task.task_id, self.agent_id, error);
                    MessagePayload::TaskFailed {
                        task_id: task.task_id,
                        error: payload["error"].as_str().unwrap_or("unknown").to_string(),
                    }
                };
                with_store_retries(attempts, || {
                    self.mailbox
                        .send(&self.agent_id, &self.supervisor_id, &message)
                })
                .await?;
            }
            Err(error) => {
                // Lost the task to a supervisor reclaim mid-execution; the
                // next claimer owns the report now.
                if let Some(CoordinationError::InvalidTransition { .. }) =
                    error.downcast_ref::<CoordinationError>()
                {
                    log_warning!(
                        "worker {} lost task {} before reporting: {}",
                        self.agent_id,
                        task.task_id,
                        error
                    );
                } else {
                    return Err(error);
                }
            }
        }

        Ok(completed)
    }

    /// Drain this worker's mailbox; true if terminate was received
    async fn drain_mailbox(&self) -> Result<bool> {
        let attempts = self.config.store_retry_attempts;
        let messages =
            with_store_retries(attempts, || self.mailbox.receive(&self.agent_id, true)).await?;

        let mut terminate = false;
        for message in messages {
            match message.payload {
                MessagePayload::Terminate => terminate = true,
                MessagePayload::PeerRequest { request } => {
                    // Minimal peer protocol: acknowledge with an echo
                    let response = MessagePayload::PeerResponse {
                        response: serde_json::json!({ "ack": request }),
                    };
                    with_store_retries(attempts, || {
                        self.mailbox
                            .send(&self.agent_id, &message.from_agent, &response)
                    })
                    .await?;
                }
                _ => {}
            }
        }
        Ok(terminate)
    }

    async fn sleep_with_jitter(&self, base_ms: u64) {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let millis = (base_ms as f64 * jitter) as u64;
        tokio::time::sleep(Duration::from_millis(millis.max(1))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let mut failures_left = 2;
        let result = with_store_retries(3, || {
            if failures_left > 0 {
                failures_left -= 1;
                Err(anyhow!("database is locked"))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_store_unavailable() {
        let mut attempts_observed = 0;
        let result = with_store_retries(3, || -> Result<()> {
            attempts_observed += 1;
            Err(anyhow!("disk I/O error"))
        })
        .await;

        let error = result.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CoordinationError>(),
            Some(CoordinationError::StoreUnavailable { .. })
        ));
        assert_eq!(attempts_observed, 3);
    }

    #[tokio::test]
    async fn test_contract_errors_are_not_retried() {
        let mut attempts_observed = 0;
        let result = with_store_retries(3, || -> Result<()> {
            attempts_observed += 1;
            Err(CoordinationError::InvalidTransition {
                task_id: 1,
                reason: "expected running, found complete".to_string(),
            }
            .into())
        })
        .await;

        let error = result.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<CoordinationError>(),
            Some(CoordinationError::InvalidTransition { .. })
        ));
        assert_eq!(attempts_observed, 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let result = with_store_retries(0, || Ok(1)).await;
        assert_eq!(result.unwrap(), 1);
    }
}
