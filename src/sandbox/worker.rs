//! Process-isolated sandbox.
//!
//! The parent spawns its own executable with the hidden `sandbox-worker` subcommand, one child per
//! conversation. Parent and child exchange one JSON document per line over the child's
//! stdin/stdout; the child hosts an [`EmbeddedInterpreter`] and nothing else.

use anyhow::{Result, anyhow, bail};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

use super::confine;
use super::interpreter::EmbeddedInterpreter;
use super::{ExecutionResult, ExecutionSandbox, SandboxLimits};
use crate::agent::CodeFragment;
use crate::dataset::Dataset;

pub const WORKER_SUBCOMMAND: &str = "sandbox-worker";

const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum WorkerRequest {
    Bootstrap {
        dataset_name: String,
        csv_text: String,
        limits: SandboxLimits,
    },
    Execute {
        fragment: CodeFragment,
    },
    Shutdown,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WorkerResponse {
    Ready { bindings: Vec<String> },
    Executed { result: ExecutionResult },
    Failed { message: String },
}

/// Serves sandbox requests on stdin/stdout until shutdown or EOF.
pub fn serve() -> Result<()> {
    confine::restrict_syscalls()?;

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    let mut sandbox: Option<EmbeddedInterpreter> = None;

    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<WorkerRequest>(&line) {
            Ok(WorkerRequest::Bootstrap {
                dataset_name,
                csv_text,
                limits,
            }) => match Dataset::from_csv_text(&dataset_name, &csv_text)
                .and_then(|dataset| EmbeddedInterpreter::new(&dataset, limits))
            {
                Ok(interpreter) => {
                    let bindings = interpreter.bindings().to_vec();
                    sandbox = Some(interpreter);
                    WorkerResponse::Ready { bindings }
                }
                Err(err) => WorkerResponse::Failed {
                    message: format!("sandbox bootstrap failed: {err}"),
                },
            },
            Ok(WorkerRequest::Execute { fragment }) => match sandbox.as_mut() {
                Some(interpreter) => WorkerResponse::Executed {
                    result: interpreter.execute(&fragment),
                },
                None => WorkerResponse::Failed {
                    message: "sandbox is not bootstrapped".to_string(),
                },
            },
            Ok(WorkerRequest::Shutdown) => break,
            Err(err) => WorkerResponse::Failed {
                message: format!("invalid worker request: {err}"),
            },
        };

        writeln!(stdout, "{}", serde_json::to_string(&response)?)?;
        stdout.flush()?;
    }

    Ok(())
}

/// Parent-side handle to one worker process.
pub struct ProcessSandbox {
    child: Child,
    stdin: ChildStdin,
    responses: Receiver<io::Result<String>>,
    limits: SandboxLimits,
    bindings: Vec<String>,
    lost: Option<String>,
    // Worker cwd and HOME; removed on drop, after the child is reaped.
    _scratch: TempDir,
}

impl ProcessSandbox {
    pub fn spawn(program: &Path, dataset: &Dataset, limits: SandboxLimits) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("codeact-sandbox-")
            .tempdir()
            .map_err(|err| anyhow!("Failed to create sandbox scratch directory: {err}"))?;

        let mut child = confine::worker_command(program, scratch.path(), std::env::vars_os())
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|err| {
                anyhow!(
                    "Failed to spawn sandbox worker {}: {err}",
                    program.display()
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to spawn sandbox worker: stdin is not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Failed to spawn sandbox worker: stdout is not piped"))?;

        let (tx, responses) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        let mut sandbox = Self {
            child,
            stdin,
            responses,
            limits,
            bindings: Vec::new(),
            lost: None,
            _scratch: scratch,
        };

        sandbox.send(&WorkerRequest::Bootstrap {
            dataset_name: dataset.name().to_string(),
            csv_text: dataset.csv_text().to_string(),
            limits,
        })?;
        match sandbox.receive(STARTUP_TIMEOUT)? {
            WorkerResponse::Ready { bindings } => sandbox.bindings = bindings,
            WorkerResponse::Failed { message } => bail!("Failed to start sandbox worker: {message}"),
            WorkerResponse::Executed { .. } => {
                bail!("Failed to start sandbox worker: unexpected execution response")
            }
        }

        Ok(sandbox)
    }

    fn send(&mut self, request: &WorkerRequest) -> Result<()> {
        let line = serde_json::to_string(request)?;
        writeln!(self.stdin, "{line}")?;
        self.stdin.flush()?;
        Ok(())
    }

    fn receive(&mut self, timeout: Duration) -> Result<WorkerResponse> {
        match self.responses.recv_timeout(timeout) {
            Ok(Ok(line)) => serde_json::from_str(&line)
                .map_err(|err| anyhow!("invalid sandbox worker response: {err}")),
            Ok(Err(err)) => Err(anyhow!("sandbox worker output unreadable: {err}")),
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(WorkerTimedOut)),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("sandbox worker exited")),
        }
    }

    fn mark_lost(&mut self, reason: String) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.lost = Some(reason);
    }
}

#[derive(Debug)]
struct WorkerTimedOut;

impl std::fmt::Display for WorkerTimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sandbox worker did not respond in time")
    }
}

impl std::error::Error for WorkerTimedOut {}

impl ExecutionSandbox for ProcessSandbox {
    fn bindings(&self) -> &[String] {
        &self.bindings
    }

    fn execute(&mut self, fragment: &CodeFragment) -> ExecutionResult {
        if let Some(reason) = &self.lost {
            return ExecutionResult::failure(
                "SandboxLost",
                format!("session state is gone: {reason}"),
            );
        }

        if let Err(err) = self.send(&WorkerRequest::Execute {
            fragment: fragment.clone(),
        }) {
            let message = format!("failed to reach sandbox worker: {err}");
            self.mark_lost(message.clone());
            return ExecutionResult::failure("SandboxError", message);
        }

        let deadline = Duration::from_millis(self.limits.execution_timeout_ms) + KILL_GRACE;
        match self.receive(deadline) {
            Ok(WorkerResponse::Executed { result }) => result,
            Ok(WorkerResponse::Failed { message }) => {
                ExecutionResult::failure("SandboxError", message)
            }
            Ok(WorkerResponse::Ready { .. }) => {
                ExecutionResult::failure("SandboxError", "unexpected worker response")
            }
            Err(err) if err.is::<WorkerTimedOut>() => {
                self.mark_lost("worker was killed after exceeding the execution timeout".into());
                ExecutionResult::failure(
                    "TimeoutError",
                    format!(
                        "execution exceeded {} ms and the sandbox was terminated",
                        self.limits.execution_timeout_ms
                    ),
                )
            }
            Err(err) => {
                let message = err.to_string();
                self.mark_lost(message.clone());
                ExecutionResult::failure("SandboxError", message)
            }
        }
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        if self.lost.is_none() {
            let _ = self.send(&WorkerRequest::Shutdown);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
