//! Child-process agent engine.
//!
//! Spawns one engine process per session and speaks newline-delimited
//! JSON over its stdio: a `configure` message right after spawn, one
//! `turn` request per chat turn answered by progress lines and a
//! terminal `result` / `turn_error` line, and a `stop` request on
//! teardown with a bounded grace period before the process is killed.
//!
//! # Engine stdout lines
//!
//! | `event` field      | Handling                                      |
//! |--------------------|-----------------------------------------------|
//! | `result`           | Turn resolves with the `content` field        |
//! | `turn_error`       | Turn fails with the `message` field           |
//! | any event kind     | Forwarded to the progress sink                |
//! | *(anything else)*  | Skipped; logged at `DEBUG`                    |

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, warn};

use crate::agent::{AgentHandle, AgentRuntime, ProgressSink};
use crate::models::event::EventKind;
use crate::{AppError, Result};

/// Grace period between a `stop` request and a forced kill.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Factory spawning one engine child process per session.
pub struct ProcessRuntime {
    command: String,
    args: Vec<String>,
    workspace_root: PathBuf,
}

impl ProcessRuntime {
    /// Build a runtime launching `command` with `args`, allocating each
    /// session a workspace directory under `workspace_root`.
    #[must_use]
    pub fn new(command: String, args: Vec<String>, workspace_root: PathBuf) -> Self {
        Self {
            command,
            args,
            workspace_root,
        }
    }
}

impl AgentRuntime for ProcessRuntime {
    fn create_handle<'a>(
        &'a self,
        session_id: &'a str,
        config: &'a BTreeMap<String, Value>,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn AgentHandle>>> + Send + 'a>> {
        let session_id = session_id.to_owned();
        let config = config.clone();
        Box::pin(async move {
            let workspace = self.workspace_root.join(format!("session_{session_id}"));
            tokio::fs::create_dir_all(&workspace)
                .await
                .map_err(|err| AppError::Engine(format!("workspace not creatable: {err}")))?;

            let mut cmd = Command::new(&self.command);
            cmd.args(&self.args)
                .env("TABLETALK_SESSION_ID", &session_id)
                .env("TABLETALK_WORKSPACE", &workspace)
                .current_dir(&workspace)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let mut child = cmd
                .spawn()
                .map_err(|err| AppError::Engine(format!("failed to spawn engine: {err}")))?;
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| AppError::Engine("engine stdin unavailable".into()))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| AppError::Engine("engine stdout unavailable".into()))?;

            let mut handle = ProcessHandle {
                session_id,
                child,
                stdin,
                stdout: BufReader::new(stdout),
                workspace,
            };
            handle.send(&json!({ "op": "configure", "config": config })).await?;

            info!(
                session_id = handle.session_id,
                pid = handle.child.id().unwrap_or(0),
                command = self.command,
                "engine process spawned"
            );
            Ok(Box::new(handle) as Box<dyn AgentHandle>)
        })
    }
}

/// One live engine child process bound to one session.
struct ProcessHandle {
    session_id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    workspace: PathBuf,
}

impl ProcessHandle {
    /// Serialise `value` to a compact JSON line and write it to the
    /// engine's stdin.
    async fn send(&mut self, value: &Value) -> Result<()> {
        let mut bytes = serde_json::to_vec(value)
            .map_err(|err| AppError::Engine(format!("request encoding failed: {err}")))?;
        bytes.push(b'\n');
        self.stdin
            .write_all(&bytes)
            .await
            .map_err(|err| AppError::Engine(format!("engine stdin write failed: {err}")))
    }
}

impl AgentHandle for ProcessHandle {
    fn execute_turn<'a>(
        &'a mut self,
        input: &'a str,
        progress: ProgressSink,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>> {
        let input = input.to_owned();
        Box::pin(async move {
            self.send(&json!({ "op": "turn", "input": input })).await?;

            loop {
                let mut line = String::new();
                let n = self
                    .stdout
                    .read_line(&mut line)
                    .await
                    .map_err(|err| AppError::Engine(format!("engine stdout read failed: {err}")))?;
                if n == 0 {
                    return Err(AppError::Engine("engine exited mid-turn".into()));
                }

                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(err) => {
                        debug!(
                            session_id = self.session_id,
                            error = %err,
                            raw = trimmed,
                            "non-JSON engine line, skipping"
                        );
                        continue;
                    }
                };

                match value.get("event").and_then(Value::as_str).unwrap_or("") {
                    "result" => {
                        let content = value
                            .get("content")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_owned();
                        return Ok(content);
                    }
                    "turn_error" => {
                        let message = value
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("engine reported an error");
                        return Err(AppError::Turn(message.to_owned()));
                    }
                    other => {
                        if let Some(kind) = EventKind::from_wire(other) {
                            let payload = value.get("payload").cloned().unwrap_or(Value::Null);
                            progress(kind, payload);
                        } else {
                            debug!(
                                session_id = self.session_id,
                                event = other,
                                "unknown engine event, skipping"
                            );
                        }
                    }
                }
            }
        })
    }

    fn workspace_path(&self) -> Option<PathBuf> {
        Some(self.workspace.clone())
    }

    fn stop(mut self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<()>> + Send>> {
        Box::pin(async move {
            // A dead stdin just means the engine is already gone.
            if let Err(err) = self.send(&json!({ "op": "stop" })).await {
                debug!(session_id = self.session_id, %err, "stop request not delivered");
            }

            let Self {
                session_id,
                mut child,
                stdin,
                ..
            } = *self;
            // Closing stdin doubles as an EOF shutdown signal.
            drop(stdin);

            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(exit)) => {
                    info!(session_id, ?exit, "engine exited gracefully");
                    Ok(())
                }
                Ok(Err(err)) => {
                    warn!(session_id, %err, "error waiting for engine exit");
                    Err(AppError::Engine(format!("wait failed: {err}")))
                }
                Err(_) => {
                    warn!(
                        session_id,
                        "engine did not exit within grace period, forcing kill"
                    );
                    child
                        .kill()
                        .await
                        .map_err(|err| AppError::Engine(format!("force kill failed: {err}")))
                }
            }
        })
    }
}
