// src/worker/command.rs

//! Shell-command handler for local runs.
//!
//! Runs `payload.cmd` through the platform shell (`sh -c` / `cmd /C`). The
//! child is spawned with `kill_on_drop`, so when the worker drops the
//! handler future on timeout the process is killed with it.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use crate::task::{Payload, Task};
use crate::worker::handler::{Handler, HandlerError, HandlerFuture, Outcome};

/// Bytes of stdout/stderr kept in the result data.
const OUTPUT_TAIL: usize = 4096;

#[derive(Debug, Clone, Default)]
pub struct CommandHandler;

impl CommandHandler {
    pub fn new() -> Self {
        Self
    }
}

impl Handler for CommandHandler {
    fn handle(&self, task: Task) -> HandlerFuture {
        Box::pin(run_command(task))
    }
}

async fn run_command(task: Task) -> Result<Outcome, HandlerError> {
    let cmd_str = task
        .payload
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| HandlerError::Failed("payload has no 'cmd' string".to_string()))?
        .to_string();

    info!(task = %task.id, cmd = %cmd_str, attempts = task.attempts, "starting task process");

    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(&cmd_str);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(&cmd_str);
        c
    };
    if let Some(cwd) = task.payload.get("cwd").and_then(Value::as_str) {
        cmd.current_dir(cwd);
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd
        .spawn()
        .map_err(|e| HandlerError::Failed(format!("spawning process for task '{}': {e}", task.id)))?;
    let output = child
        .wait_with_output()
        .await
        .map_err(|e| HandlerError::Failed(format!("waiting for task '{}': {e}", task.id)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    for line in stderr.lines() {
        debug!(task = %task.id, "stderr: {}", line);
    }

    let code = output.status.code().unwrap_or(-1);
    info!(
        task = %task.id,
        exit_code = code,
        success = output.status.success(),
        "task process exited"
    );

    if !output.status.success() {
        return Err(HandlerError::Failed(format!(
            "command exited with status {code}: {}",
            tail(stderr.trim())
        )));
    }

    let mut data = Payload::new();
    data.insert("exit_code".into(), code.into());
    data.insert("stdout".into(), tail(&stdout).into());
    data.insert("stderr".into(), tail(&stderr).into());
    Ok(Outcome::Done(data))
}

/// Last `OUTPUT_TAIL` bytes of `s`, cut on a char boundary.
fn tail(s: &str) -> &str {
    if s.len() <= OUTPUT_TAIL {
        return s;
    }
    let mut start = s.len() - OUTPUT_TAIL;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
