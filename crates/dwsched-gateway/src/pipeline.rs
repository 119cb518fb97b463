//! Executor that runs the pipeline as an external command.
//!
//! Invocation: `<program> <args..> --mode <full|incremental> [--rows N]
//! [--continue-on-error] [--skip-validation]`. A JSON document on stdout
//! becomes the run's result payload.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use dwsched_core::{config::PipelineConfig, PipelineMode, RunOptions};
use dwsched_scheduler::{ExecutorError, PipelineExecutor, ProgressHandle};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::debug;

/// Longest stdout/stderr excerpt kept in a result or error.
const MAX_OUTPUT_CHARS: usize = 4000;

pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            workdir: config.workdir.as_ref().map(PathBuf::from),
        }
    }

    fn command_args(&self, mode: PipelineMode, options: &RunOptions) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--mode".into());
        args.push(mode.to_string());
        if let Some(rows) = options.rows_override {
            args.push("--rows".into());
            args.push(rows.to_string());
        }
        if options.continue_on_error {
            args.push("--continue-on-error".into());
        }
        if options.skip_validation {
            args.push("--skip-validation".into());
        }
        args
    }
}

#[async_trait]
impl PipelineExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.program
    }

    async fn execute(
        &self,
        mode: PipelineMode,
        options: &RunOptions,
        progress: &ProgressHandle,
    ) -> Result<Value, ExecutorError> {
        let args = self.command_args(mode, options);
        debug!(program = %self.program, ?args, "launching pipeline");

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A run abandoned at shutdown must not outlive the process that
            // holds its guard slot.
            .kill_on_drop(true);
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let child = cmd
            .spawn()
            .map_err(|e| ExecutorError::Launch(format!("{}: {e}", self.program)))?;
        progress.report(json!({ "stage": "running", "pid": child.id() }));

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecutorError::Launch(format!("{}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExecutorError::Exit {
                code: output.status.code(),
                stderr: tail(stderr.trim(), MAX_OUTPUT_CHARS),
            });
        }
        Ok(parse_stdout(&stdout))
    }
}

fn parse_stdout(stdout: &str) -> Value {
    let trimmed = stdout.trim();
    serde_json::from_str(trimmed)
        .unwrap_or_else(|_| json!({ "stdout": tail(trimmed, MAX_OUTPUT_CHARS) }))
}

/// The last `max_chars` characters of `text`.
fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}
