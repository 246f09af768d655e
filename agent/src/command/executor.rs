//! Command executors.
//!
//! A channel call is one external process: `<program> [args…] <operation>`
//! with the operation parameters written to stdin as JSON and the result
//! read back from stdout.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tracing::debug;

use crate::errors::DeployError;

/// Maximum stdout or stderr captured per stream (10 MiB)
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// A fully resolved process call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: String,

    /// Arguments after the program, operation name included
    pub args: Vec<String>,

    /// Operation name, or `probe` for connection tests
    pub operation: String,

    /// JSON written to stdin
    pub input: serde_json::Value,
}

/// Captured result of a finished process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executor seam between the coordinator and the processes it runs
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Whether `program` resolves to something that can be spawned
    async fn is_reachable(&self, program: &str) -> bool;

    /// Run the invocation, killing it once `timeout` elapses.
    ///
    /// A non-zero exit is returned as output, not as an error.
    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError>;
}

/// Executor spawning real processes with tokio
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn is_reachable(&self, program: &str) -> bool {
        let program = program.to_string();
        tokio::task::spawn_blocking(move || resolve_program(&program))
            .await
            .unwrap_or(false)
    }

    async fn execute(
        &self,
        invocation: &Invocation,
        timeout: Duration,
    ) -> Result<CommandOutput, DeployError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let start = Instant::now();
        let mut child = cmd.spawn().map_err(|e| DeployError::Connection {
            connection: invocation.program.clone(),
            message: format!("failed to spawn for '{}': {}", invocation.operation, e),
        })?;

        let payload = serde_json::to_vec(&invocation.input)?;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // stdin, the readers and the wait run together so a child that
        // fills stdout before draining stdin cannot stall the exchange
        let exchange = async {
            tokio::join!(
                write_stdin(stdin, &payload),
                read_stream(stdout),
                read_stream(stderr),
                child.wait(),
            )
        };

        let (written, stdout, stderr, status) = match tokio::time::timeout(timeout, exchange).await {
            Ok(joined) => joined,
            Err(_) => {
                let _ = child.start_kill();
                return Err(DeployError::Timeout {
                    operation: invocation.operation.clone(),
                    timeout,
                });
            }
        };

        let status = status?;
        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
        };
        debug!(
            "{} {} exited with {} in {:?}",
            invocation.program, invocation.operation, output.exit_code, output.duration
        );

        // a failed exit already explains an unread request
        if let Err(e) = written {
            if output.success() {
                return Err(DeployError::CommandExecution {
                    operation: invocation.operation.clone(),
                    exit_code: output.exit_code,
                    stderr: format!(
                        "{} exited without reading its {} byte request: {}",
                        invocation.program,
                        payload.len(),
                        e
                    ),
                });
            }
        }
        Ok(output)
    }
}

/// Write the whole request and close stdin
async fn write_stdin<W: AsyncWrite + Unpin>(handle: Option<W>, payload: &[u8]) -> std::io::Result<()> {
    let Some(mut stdin) = handle else {
        return Ok(());
    };
    stdin.write_all(payload).await?;
    stdin.shutdown().await
}

/// Read a whole output stream, capped at [`MAX_OUTPUT_BYTES`]
async fn read_stream<R: AsyncRead + Unpin>(handle: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut h) = handle {
        let _ = (&mut h)
            .take(MAX_OUTPUT_BYTES as u64)
            .read_to_end(&mut buf)
            .await;
    }
    buf
}

/// Resolve a program name against PATH, or check an explicit path
fn resolve_program(program: &str) -> bool {
    let path = Path::new(program);
    if path.components().count() > 1 {
        return is_executable(path);
    }

    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| is_executable(&dir.join(program))))
        .unwrap_or(false)
}

fn is_executable(path: &Path) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        return false;
    };
    if !metadata.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
