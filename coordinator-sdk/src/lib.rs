//! Shared vocabulary for the task coordinator: task and message types,
//! the coordination error taxonomy, the external trait seams
//! (decomposer / executor / synthesizer), and structured event logging.
//!
//! Agents never hold references to each other; everything they exchange
//! goes through the durable store using the types defined here.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// Re-export async trait for convenience
pub use async_trait::async_trait;

/// Broadcast address: a message sent here fans out to every agent
/// registered at send time.
pub const BROADCAST: &str = "*";

/// Unique identifier for a coordination run (one session database per run)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Task lifecycle status
///
/// Legal transitions: Pending -> Running (claim), Running -> Complete,
/// Running -> Failed, Running -> Pending (supervisor reclaim only),
/// Pending -> Failed (dependency cascade).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    /// Stable string form used for database storage
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Complete => "complete",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "complete" => Some(TaskStatus::Complete),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }

    /// Terminal statuses never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of work as the decomposer hands it to the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    /// Zero-based indices into the decomposition batch; translated to task
    /// ids when the batch is persisted
    #[serde(default)]
    pub dependencies: Vec<i64>,
}

/// A persisted task row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: i64,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_to: Option<String>,
    pub dependencies: Vec<i64>,
    /// Present iff status is Complete (executor output) or Failed (error payload)
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
}

/// Read-only consistent view of the full task graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Tasks in creation (id) order
    pub tasks: Vec<TaskRecord>,
}

impl TaskSnapshot {
    pub fn get(&self, task_id: i64) -> Option<&TaskRecord> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// True iff no task is Pending or Running
    pub fn all_done(&self) -> bool {
        self.tasks.iter().all(|t| t.status.is_terminal())
    }
}

/// Agent role within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Supervisor,
    Worker,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Supervisor => "supervisor",
            AgentRole::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "supervisor" => Some(AgentRole::Supervisor),
            "worker" => Some(AgentRole::Worker),
            _ => None,
        }
    }
}

/// Structured message payload exchanged between agents
///
/// Known kinds form a closed set; anything with an unrecognized tag
/// deserializes into `Unknown` so readers keep working when a newer
/// sender introduces a kind this build does not know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePayload {
    /// Worker -> supervisor: task finished successfully
    TaskComplete { task_id: i64 },
    /// Worker -> supervisor: task failed (error recorded in the store)
    TaskFailed { task_id: i64, error: String },
    /// Any agent reporting a non-task error condition
    Error { detail: String },
    /// Supervisor -> all: stop claiming, exit gracefully
    Terminate,
    /// Free-form announcement to all agents
    Broadcast { text: String },
    /// Peer-to-peer request (body is caller-defined)
    PeerRequest { request: serde_json::Value },
    /// Peer-to-peer reply
    PeerResponse { response: serde_json::Value },
    /// Extension escape hatch: raw structured data with an unknown tag
    #[serde(untagged)]
    Unknown(serde_json::Value),
}

/// A delivered message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from_agent: String,
    pub to_agent: String,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Local>,
    pub read: bool,
}

/// Input handed to an executor for a single claimed task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionInput {
    pub task_id: i64,
    pub description: String,
    /// Results of this task's dependencies, in dependency-list order
    pub dependency_results: Vec<serde_json::Value>,
}

/// Coordination error taxonomy
///
/// Task-level failures (timeout, execution failure) end up as Failed task
/// rows and never crash the run; infrastructure failures escalate to the
/// supervisor after bounded retries.
#[derive(Debug, Error)]
pub enum CoordinationError {
    /// Task creation referenced an unknown task or would form a cycle
    #[error("invalid dependency: {reason}")]
    InvalidDependency { reason: String },

    /// Complete/fail called on a task not Running or not owned by caller
    #[error("invalid transition for task {task_id}: {reason}")]
    InvalidTransition { task_id: i64, reason: String },

    /// Executor exceeded the caller-supplied deadline
    #[error("task {task_id} timed out after {timeout_secs}s")]
    ExecutionTimeout { task_id: i64, timeout_secs: u64 },

    /// Executor reported a domain error
    #[error("task {task_id} execution failed: {error}")]
    ExecutionFailure { task_id: i64, error: String },

    /// The durable store could not be reached after bounded retries
    #[error("store unavailable: {detail}")]
    StoreUnavailable { detail: String },

    /// An agent's heartbeat is older than the staleness window
    #[error("agent {agent_id} heartbeat is stale")]
    StaleHeartbeat { agent_id: String },
}

/// Goal decomposition seam (an LLM planner in practice; anything that
/// yields a valid DAG of task specs)
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, goal: &str) -> Result<Vec<TaskSpec>, CoordinationError>;
}

/// Task execution seam; the coordinator treats this as a black box and
/// enforces the per-task timeout around it
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, input: ExecutionInput) -> Result<serde_json::Value, CoordinationError>;
}

/// Final synthesis seam: combines completed results into a report
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        snapshot: &TaskSnapshot,
    ) -> Result<serde_json::Value, CoordinationError>;
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every task reached Complete
    Complete,
    /// All tasks terminal, at least one Failed
    CompleteWithFailures,
    /// Wall-clock timeout expired with work still outstanding
    Partial,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunOutcome::Complete => "complete",
            RunOutcome::CompleteWithFailures => "complete_with_failures",
            RunOutcome::Partial => "partial",
        };
        f.write_str(s)
    }
}

/// Structured coordination events emitted by workers and the supervisor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordEvent {
    /// Run started after decomposition
    RunStarted {
        run_id: String,
        goal: String,
        total_tasks: usize,
        workers: usize,
    },
    /// A worker won the claim on a task
    TaskClaimed {
        task_id: i64,
        agent_id: String,
        description: String,
    },
    /// Task completed
    TaskCompleted { task_id: i64, agent_id: String },
    /// Task failed
    TaskFailed {
        task_id: i64,
        agent_id: String,
        error: String,
    },
    /// Supervisor reset a stale Running task back to Pending
    TaskReclaimed {
        task_id: i64,
        previous_agent: String,
    },
    /// A worker reached its terminal state
    WorkerFinished {
        agent_id: String,
        completed: usize,
        failed: usize,
    },
    /// Run finished
    RunCompleted {
        run_id: String,
        outcome: RunOutcome,
        complete: usize,
        failed: usize,
    },
    /// Informational note
    Info { message: String },
    /// Something off-nominal but recoverable
    Warning { message: String },
}

impl CoordEvent {
    /// Emit this event to stderr as a sentinel-prefixed JSON line for
    /// log collectors
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            use std::io::Write;
            eprintln!("__COORD_EVENT__:{}", json);
            // Force flush stderr in async/concurrent contexts
            let _ = std::io::stderr().flush();
        }
    }
}

/// Helper macros for coordination logging
#[macro_export]
macro_rules! log_run_start {
    ($run_id:expr, $goal:expr, $total:expr, $workers:expr) => {
        $crate::CoordEvent::RunStarted {
            run_id: $run_id.to_string(),
            goal: $goal.to_string(),
            total_tasks: $total,
            workers: $workers,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_claimed {
    ($task_id:expr, $agent:expr, $desc:expr) => {
        $crate::CoordEvent::TaskClaimed {
            task_id: $task_id,
            agent_id: $agent.to_string(),
            description: $desc.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_complete {
    ($task_id:expr, $agent:expr) => {
        $crate::CoordEvent::TaskCompleted {
            task_id: $task_id,
            agent_id: $agent.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_failed {
    ($task_id:expr, $agent:expr, $error:expr) => {
        $crate::CoordEvent::TaskFailed {
            task_id: $task_id,
            agent_id: $agent.to_string(),
            error: $error.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_task_reclaimed {
    ($task_id:expr, $previous:expr) => {
        $crate::CoordEvent::TaskReclaimed {
            task_id: $task_id,
            previous_agent: $previous.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_worker_finished {
    ($agent:expr, $completed:expr, $failed:expr) => {
        $crate::CoordEvent::WorkerFinished {
            agent_id: $agent.to_string(),
            completed: $completed,
            failed: $failed,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_run_complete {
    ($run_id:expr, $outcome:expr, $complete:expr, $failed:expr) => {
        $crate::CoordEvent::RunCompleted {
            run_id: $run_id.to_string(),
            outcome: $outcome,
            complete: $complete,
            failed: $failed,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_info {
    ($msg:expr) => {
        $crate::CoordEvent::Info {
            message: $msg.to_string(),
        }
        .emit();
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CoordEvent::Info {
            message: format!($fmt, $($arg)*),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_warning {
    ($msg:expr) => {
        $crate::CoordEvent::Warning {
            message: $msg.to_string(),
        }
        .emit();
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::CoordEvent::Warning {
            message: format!($fmt, $($arg)*),
        }
        .emit();
    };
}
