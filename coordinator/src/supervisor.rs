//! Supervisor: decompose a goal, spawn workers, monitor, synthesize
//!
//! The monitor loop is the crash-recovery authority: it reclaims running
//! tasks whose worker stopped heartbeating and force-releases their locks.
//! A hard wall-clock timeout is the safety net; when it fires the run ends
//! as partial and synthesis covers whatever completed, so a failed branch
//! never erases credit for finished ones.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use coordinator_sdk::{
    log_info, log_run_complete, log_run_start, log_task_reclaimed, log_warning, AgentRole,
    CoordinationError, Decomposer, Executor, MessagePayload, RunId, RunOutcome, Synthesizer,
    TaskStatus, BROADCAST,
};

use crate::config::CoordinatorConfig;
use crate::locks::LockManager;
use crate::mailbox::Mailbox;
use crate::store::TaskStore;
use crate::worker::Worker;

const SUPERVISOR_ID: &str = "supervisor";

/// Final accounting for a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub outcome: RunOutcome,
    /// Synthesizer output over the final snapshot
    pub report: serde_json::Value,
    pub completed: usize,
    pub failed: usize,
    /// Descriptions of tasks that did not complete
    pub unmet_objectives: Vec<String>,
}

pub struct Supervisor {
    store: Arc<TaskStore>,
    mailbox: Arc<Mailbox>,
    locks: Arc<LockManager>,
    decomposer: Arc<dyn Decomposer>,
    executor: Arc<dyn Executor>,
    synthesizer: Arc<dyn Synthesizer>,
    config: CoordinatorConfig,
    run_id: RunId,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<TaskStore>,
        mailbox: Arc<Mailbox>,
        locks: Arc<LockManager>,
        decomposer: Arc<dyn Decomposer>,
        executor: Arc<dyn Executor>,
        synthesizer: Arc<dyn Synthesizer>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            mailbox,
            locks,
            decomposer,
            executor,
            synthesizer,
            config,
            run_id: RunId::new(),
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Drive a goal end to end: decompose, execute, synthesize
    pub async fn run(&self, goal: &str) -> Result<RunReport> {
        self.mailbox
            .register_agent(SUPERVISOR_ID, AgentRole::Supervisor)?;

        let specs = self
            .decomposer
            .decompose(goal)
            .await
            .context("Goal decomposition failed")?;

        // Validation happens before any row is written; a malformed graph
        // leaves the store empty rather than partially populated.
        let task_ids = self
            .store
            .create_tasks(&specs)
            .context("Failed to persist task graph")?;

        log_run_start!(self.run_id, goal, task_ids.len(), self.config.workers);

        let mut handles = Vec::with_capacity(self.config.workers);
        for n in 1..=self.config.workers {
            let worker = Worker::new(
                format!("worker-{}", n),
                SUPERVISOR_ID.to_string(),
                self.store.clone(),
                self.mailbox.clone(),
                self.executor.clone(),
                self.config.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }

        let timed_out = self.monitor().await?;

        // On a normal finish the workers have already observed all_done;
        // on timeout this is what makes them stop claiming.
        self.mailbox
            .send(SUPERVISOR_ID, BROADCAST, &MessagePayload::Terminate)?;

        for handle in futures::future::join_all(handles).await {
            match handle {
                Ok(Ok(_stats)) => {}
                Ok(Err(error)) => log_warning!("worker exited with error: {}", error),
                Err(join_error) => log_warning!("worker panicked: {}", join_error),
            }
        }

        self.store.archive_session(self.run_id)?;

        let snapshot = self.store.snapshot()?;
        let completed = snapshot.count_with_status(TaskStatus::Complete);
        let failed = snapshot.count_with_status(TaskStatus::Failed);
        let unmet_objectives: Vec<String> = snapshot
            .tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Complete)
            .map(|t| t.description.clone())
            .collect();

        let outcome = if timed_out {
            RunOutcome::Partial
        } else if failed > 0 {
            RunOutcome::CompleteWithFailures
        } else {
            RunOutcome::Complete
        };

        let report = self
            .synthesizer
            .synthesize(&snapshot)
            .await
            .context("Synthesis failed")?;

        log_run_complete!(self.run_id, outcome, completed, failed);

        Ok(RunReport {
            run_id: self.run_id,
            outcome,
            report,
            completed,
            failed,
            unmet_objectives,
        })
    }

    /// Monitor until all work settles; true if the wall clock expired first
    async fn monitor(&self) -> Result<bool> {
        let started = Instant::now();
        let run_timeout = self.config.run_timeout();
        let tick = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            self.mailbox.heartbeat(SUPERVISOR_ID)?;
            self.drain_mailbox()?;
            self.reclaim_stalled()?;

            if self.store.all_done()? {
                return Ok(false);
            }
            if started.elapsed() >= run_timeout {
                log_warning!(
                    "run {} exceeded wall-clock timeout of {}s, ending as partial",
                    self.run_id,
                    self.config.run_timeout_secs
                );
                return Ok(true);
            }

            tokio::time::sleep(tick).await;
        }
    }

    /// Reset running tasks owned by stale workers and free their locks
    fn reclaim_stalled(&self) -> Result<()> {
        let stale = self.mailbox.stale_agents(self.config.stall_timeout())?;
        if !stale.is_empty() {
            for (task_id, owner) in self.store.running_tasks()? {
                if stale.iter().any(|agent| agent == &owner) {
                    if self.store.reclaim_task(task_id)? {
                        let cause = CoordinationError::StaleHeartbeat {
                            agent_id: owner.clone(),
                        };
                        log_warning!("{}, reclaiming task {}", cause, task_id);
                        log_task_reclaimed!(task_id, owner);
                    }
                }
            }
        }

        for resource_id in self.locks.stale_locks(self.config.stall_timeout())? {
            self.locks.force_release(&resource_id)?;
            log_warning!("force-released stale lock on {}", resource_id);
        }

        Ok(())
    }

    /// Read progress reports and error mail from the workers
    fn drain_mailbox(&self) -> Result<()> {
        for message in self.mailbox.receive(SUPERVISOR_ID, true)? {
            match message.payload {
                MessagePayload::TaskComplete { task_id } => {
                    log_info!("{} reported task {} complete", message.from_agent, task_id);
                }
                MessagePayload::TaskFailed { task_id, error } => {
                    log_warning!(
                        "{} reported task {} failed: {}",
                        message.from_agent,
                        task_id,
                        error
                    );
                }
                MessagePayload::Error { detail } => {
                    log_warning!("{} reported error: {}", message.from_agent, detail);
                }
                other => {
                    log_info!("unhandled message from {}: {:?}", message.from_agent, other);
                }
            }
        }
        Ok(())
    }
}
