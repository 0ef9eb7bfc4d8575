// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Host command execution (`systemctl`, `sc.exe`, `schtasks`, the runtime itself)

use crate::error::{AgentError, Result};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;

pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs external programs and captures their output.
///
/// A non-zero exit is not an error here; callers inspect `Output::status`.
#[expect(async_fn_in_trait)]
pub trait CommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output>;

    /// Run with a custom timeout. The child is killed when it expires.
    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output>;
}

impl<T: CommandRunner> CommandRunner for &T {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        (**self).run(program, args).await
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        (**self).run_with_timeout(program, args, timeout).await
    }
}

#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TokioCommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_CMD_TIMEOUT)
    }
}

impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<Output> {
        self.run_with_timeout(program, args, self.timeout).await
    }

    async fn run_with_timeout(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<Output> {
        tracing::debug!(program, ?args, "Running command");

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Command(format!("failed to spawn {program}: {e}")))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Drain both pipes while waiting so a chatty child cannot block on a full pipe.
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let status = status
                    .map_err(|e| AgentError::Command(format!("waiting for {program}: {e}")))?;
                Ok(Output { status, stdout, stderr })
            } => result,
            () = tokio::time::sleep(timeout) => {
                let _ = child.kill().await;
                Err(AgentError::Command(format!(
                    "{program} timed out after {}s",
                    timeout.as_secs()
                )))
            }
        }
    }
}

/// Stdout and stderr of a finished command, trimmed, for error messages.
pub fn describe_output(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    format!("{} ({detail})", output.status)
}


#[cfg(test)]
mod tests {
    use super::fake::{FakeRunner, output};
    use super::*;

    #[test]
    fn test_describe_output_prefers_stderr() {
        let mut out = output(1, "stdout text\n");
        assert!(describe_output(&out).contains("stdout text"));
        out.stderr = b"  access denied \n".to_vec();
        let described = describe_output(&out);
        assert!(described.contains("access denied"));
        assert!(!described.contains("stdout text"));
    }

    #[tokio::test]
    async fn test_fake_runner_scripting() {
        let runner = FakeRunner::new();
        runner.on("sc query", 0, "STOPPED").once("sc query", 0, "RUNNING");

        let first = runner.run("sc", &["query", "svc"]).await.unwrap();
        let second = runner.run("sc", &["query", "svc"]).await.unwrap();
        let other = runner.run("sc", &["start", "svc"]).await.unwrap();

        assert_eq!(first.stdout, b"RUNNING");
        assert_eq!(second.stdout, b"STOPPED");
        assert!(other.status.success());
        assert_eq!(runner.count("sc query"), 2);
        assert_eq!(runner.calls().last().map(String::as_str), Some("sc start svc"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let runner = TokioCommandRunner::default();
        let out = runner.run("sh", &["-c", "echo hello; exit 3"]).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "hello");
        assert_eq!(out.status.code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_times_out() {
        let runner = TokioCommandRunner::default();
        let result = runner
            .run_with_timeout("sleep", &["5"], Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(AgentError::Command(_))));
    }

    #[tokio::test]
    async fn test_tokio_runner_missing_program() {
        let runner = TokioCommandRunner::default();
        let result = runner.run("hexput-agent-no-such-program", &[]).await;
        assert!(matches!(result, Err(AgentError::Command(_))));
    }
}
