//! External command steps (dependency installs, clones).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Combined output kept per step (tail).
pub const MAX_STEP_OUTPUT: usize = 4 * 1024;

/// One command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl Step {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Shell-like rendering for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a step produced.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub success: bool,
    /// Exit status, or the reason there is none.
    pub status: String,
    /// Tail of stdout followed by stderr.
    pub output: String,
}

/// Runs steps; tests substitute a recording fake.
#[async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, step: &Step, timeout: Duration) -> StepOutput;
}

/// Runs steps as host processes.
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl StepRunner for ProcessRunner {
    async fn run(&self, step: &Step, timeout: Duration) -> StepOutput {
        tracing::info!("Running `{}` in {}", step.display(), step.cwd.display());

        let mut child = match Command::new(&step.program)
            .args(&step.args)
            .current_dir(&step.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return StepOutput {
                    success: false,
                    status: format!("failed to start {}: {}", step.program, e),
                    output: String::new(),
                };
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let result = tokio::time::timeout(timeout, async {
            let stdout_fut = async {
                let mut buf = Vec::new();
                if let Some(mut out) = stdout {
                    let _ = out.read_to_end(&mut buf).await;
                }
                buf
            };
            let stderr_fut = async {
                let mut buf = Vec::new();
                if let Some(mut err) = stderr {
                    let _ = err.read_to_end(&mut buf).await;
                }
                buf
            };
            let (stdout, stderr) = tokio::join!(stdout_fut, stderr_fut);
            let status = child.wait().await;
            (stdout, stderr, status)
        })
        .await;

        match result {
            Ok((stdout, stderr, status)) => {
                let mut output = String::from_utf8_lossy(&stdout).into_owned();
                let err = String::from_utf8_lossy(&stderr);
                if !err.is_empty() {
                    if !output.is_empty() && !output.ends_with('\n') {
                        output.push('\n');
                    }
                    output.push_str(&err);
                }
                let output = crate::safety::truncate_tail(&output, MAX_STEP_OUTPUT).to_string();

                match status {
                    Ok(status) => StepOutput {
                        success: status.success(),
                        status: status.to_string(),
                        output,
                    },
                    Err(e) => StepOutput {
                        success: false,
                        status: format!("failed to wait for {}: {}", step.program, e),
                        output,
                    },
                }
            }
            Err(_) => {
                // Dropping the child on return kills it.
                StepOutput {
                    success: false,
                    status: format!("timed out after {:?}", timeout),
                    output: String::new(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runs_and_captures_output() {
        let dir = tempfile::tempdir().unwrap();
        let step = Step::new("sh", dir.path())
            .arg("-c")
            .arg("echo installing; echo warning >&2");

        let out = ProcessRunner.run(&step, Duration::from_secs(5)).await;
        assert!(out.success);
        assert!(out.output.contains("installing"));
        assert!(out.output.contains("warning"));
    }

    #[tokio::test]
    async fn test_failure_and_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let failed = ProcessRunner
            .run(
                &Step::new("sh", dir.path()).arg("-c").arg("exit 2"),
                Duration::from_secs(5),
            )
            .await;
        assert!(!failed.success);

        let missing = ProcessRunner
            .run(&Step::new("/nonexistent/pip", dir.path()), Duration::from_secs(5))
            .await;
        assert!(!missing.success);
        assert!(missing.status.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let out = ProcessRunner
            .run(
                &Step::new("sleep", dir.path()).arg("30"),
                Duration::from_millis(200),
            )
            .await;
        assert!(!out.success);
        assert!(out.status.contains("timed out"));
    }

    #[test]
    fn test_display() {
        let step = Step::new("npm", "/tmp").arg("install");
        assert_eq!(step.display(), "npm install");
    }
}
