//! Built-in trait implementations for the demo binary and tests
//!
//! The coordinator proper treats decomposition, execution, and synthesis as
//! opaque seams. These implementations exist so the system can run end to
//! end without any external planner or tooling attached.

use coordinator_sdk::async_trait;
use std::time::Duration;

use coordinator_sdk::{
    CoordinationError, Decomposer, ExecutionInput, Executor, Synthesizer, TaskSnapshot, TaskSpec,
    TaskStatus,
};

/// Decomposer over a pre-built task list (tests, programmatic callers)
pub struct ListDecomposer {
    specs: Vec<TaskSpec>,
}

impl ListDecomposer {
    pub fn new(specs: Vec<TaskSpec>) -> Self {
        Self { specs }
    }
}

#[async_trait]
impl Decomposer for ListDecomposer {
    async fn decompose(&self, _goal: &str) -> Result<Vec<TaskSpec>, CoordinationError> {
        Ok(self.specs.clone())
    }
}

/// Splits a goal on `;` into steps
///
/// In pipeline mode each step depends on the previous one; otherwise all
/// steps are independent. Empty steps are skipped.
pub struct SplitDecomposer {
    pipeline: bool,
}

impl SplitDecomposer {
    pub fn new(pipeline: bool) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl Decomposer for SplitDecomposer {
    async fn decompose(&self, goal: &str) -> Result<Vec<TaskSpec>, CoordinationError> {
        let specs: Vec<TaskSpec> = goal
            .split(';')
            .map(str::trim)
            .filter(|step| !step.is_empty())
            .enumerate()
            .map(|(idx, step)| TaskSpec {
                description: step.to_string(),
                dependencies: if self.pipeline && idx > 0 {
                    vec![idx as i64 - 1]
                } else {
                    vec![]
                },
            })
            .collect();

        if specs.is_empty() {
            return Err(CoordinationError::InvalidDependency {
                reason: "goal decomposed into zero tasks".to_string(),
            });
        }
        Ok(specs)
    }
}

/// Echoes the task description back as its result after an optional delay
pub struct EchoExecutor {
    delay: Duration,
}

impl EchoExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    async fn execute(&self, input: ExecutionInput) -> Result<serde_json::Value, CoordinationError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(serde_json::json!({
            "echo": input.description,
            "dependency_count": input.dependency_results.len(),
        }))
    }
}

/// Folds the snapshot into a JSON report: completed results plus the
/// objectives that were not met
pub struct ReportSynthesizer;

#[async_trait]
impl Synthesizer for ReportSynthesizer {
    async fn synthesize(
        &self,
        snapshot: &TaskSnapshot,
    ) -> Result<serde_json::Value, CoordinationError> {
        let completed: Vec<serde_json::Value> = snapshot
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Complete)
            .map(|t| {
                serde_json::json!({
                    "task_id": t.task_id,
                    "description": t.description,
                    "result": t.result,
                })
            })
            .collect();

        let unmet: Vec<serde_json::Value> = snapshot
            .tasks
            .iter()
            .filter(|t| t.status != TaskStatus::Complete)
            .map(|t| {
                serde_json::json!({
                    "task_id": t.task_id,
                    "description": t.description,
                    "status": t.status,
                    "error": t.result,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "completed": completed,
            "unmet_objectives": unmet,
            "total": snapshot.tasks.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_split_decomposer_pipeline_chains_steps() {
        let specs = SplitDecomposer::new(true)
            .decompose("scan; analyze; report")
            .await
            .unwrap();
        assert_eq!(specs.len(), 3);
        assert!(specs[0].dependencies.is_empty());
        assert_eq!(specs[1].dependencies, vec![0]);
        assert_eq!(specs[2].dependencies, vec![1]);
    }

    #[tokio::test]
    async fn test_split_decomposer_parallel_has_no_deps() {
        let specs = SplitDecomposer::new(false)
            .decompose("a; b; c")
            .await
            .unwrap();
        assert!(specs.iter().all(|s| s.dependencies.is_empty()));
    }

    #[tokio::test]
    async fn test_split_decomposer_rejects_empty_goal() {
        assert!(SplitDecomposer::new(true).decompose(" ; ; ").await.is_err());
    }

    #[tokio::test]
    async fn test_echo_executor_reports_dependency_count() {
        let result = EchoExecutor::new(Duration::ZERO)
            .execute(ExecutionInput {
                task_id: 1,
                description: "hello".to_string(),
                dependency_results: vec![serde_json::json!(1), serde_json::json!(2)],
            })
            .await
            .unwrap();
        assert_eq!(result["echo"], "hello");
        assert_eq!(result["dependency_count"], 2);
    }
}
