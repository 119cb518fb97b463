use std::sync::Arc;

use async_trait::async_trait;
use dwsched_core::{PipelineMode, RunOptions};
use serde_json::{json, Value};
use tracing::error;

use crate::{guard::ProgressHandle, types::RunStatus};

/// The pipeline this scheduler drives.
///
/// Implementations run to completion; the scheduler imposes no timeout and
/// never cancels an execution once started.
#[async_trait]
pub trait PipelineExecutor: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run the pipeline once in `mode`. The returned payload is stored with
    /// the run.
    async fn execute(
        &self,
        mode: PipelineMode,
        options: &RunOptions,
        progress: &ProgressHandle,
    ) -> Result<Value, ExecutorError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("failed to launch pipeline: {0}")]
    Launch(String),

    #[error("pipeline exited with status {code:?}: {stderr}")]
    Exit { code: Option<i32>, stderr: String },

    #[error("pipeline failed: {0}")]
    Failed(String),
}

/// Terminal result of one execution, ready to be written to `runs`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error_text: Option<String>,
    pub result: Option<Value>,
}

impl RunOutcome {
    pub fn success(result: Value) -> Self {
        Self {
            status: RunStatus::Success,
            error_text: None,
            result: Some(result),
        }
    }

    pub fn failure(error_text: impl Into<String>, result: Option<Value>) -> Self {
        Self {
            status: RunStatus::Failed,
            error_text: Some(error_text.into()),
            result,
        }
    }

    /// Classify what the executor returned.
    ///
    /// A payload that finished but carries flow errors still counts as a
    /// failed run.
    pub fn from_result(result: Result<Value, ExecutorError>) -> Self {
        match result {
            Ok(payload) => match count_flow_errors(&payload) {
                0 => Self::success(payload),
                n => Self::failure(format!("pipeline finished with {n} error(s)"), Some(payload)),
            },
            Err(e) => {
                let text = e.to_string();
                Self::failure(text.clone(), Some(json!({ "exception": text })))
            }
        }
    }
}

/// Total length of every `errors` / `validation_errors` array found anywhere
/// in `payload`.
pub fn count_flow_errors(payload: &Value) -> usize {
    match payload {
        Value::Object(map) => map
            .iter()
            .map(|(key, value)| match value {
                Value::Array(items) if key == "errors" || key == "validation_errors" => {
                    items.len()
                }
                other => count_flow_errors(other),
            })
            .sum(),
        Value::Array(items) => items.iter().map(count_flow_errors).sum(),
        _ => 0,
    }
}

/// Run the executor on its own task so a panic inside it becomes a failed
/// run instead of tearing down the caller.
pub(crate) async fn run_pipeline(
    executor: Arc<dyn PipelineExecutor>,
    mode: PipelineMode,
    options: RunOptions,
    progress: ProgressHandle,
) -> RunOutcome {
    let name = executor.name().to_string();
    let task =
        tokio::spawn(async move { executor.execute(mode, &options, &progress).await });
    match task.await {
        Ok(result) => RunOutcome::from_result(result),
        Err(e) if e.is_panic() => {
            error!(executor = %name, %mode, "executor panicked");
            RunOutcome::failure("executor panicked", None)
        }
        Err(e) => RunOutcome::failure(format!("executor task aborted: {e}"), None),
    }
}
