//! The sandbox command-execution capability
//!
//! The only primitive the session manager relies on: run a shell command
//! string with a timeout and get stdout, stderr and an exit code back. It has
//! no notion of sessions. Adapters are provided for the local host and for a
//! Docker container acting as the sandbox.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Callback receiving incremental output chunks
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Exit code reported when a sandbox command hits its timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Options for a single sandbox run
#[derive(Clone, Default)]
pub struct RunOptions {
    pub timeout: Duration,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub on_output: Option<OutputSink>,
}

impl std::fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("cwd", &self.cwd)
            .field("user", &self.user)
            .field("on_output", &self.on_output.is_some())
            .finish()
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn on_output(mut self, sink: OutputSink) -> Self {
        self.on_output = Some(sink);
        self
    }
}

/// Final result of a sandbox run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined for error messages
    pub fn combined(&self) -> String {
        let mut parts = Vec::new();
        if !self.stdout.trim().is_empty() {
            parts.push(self.stdout.trim());
        }
        if !self.stderr.trim().is_empty() {
            parts.push(self.stderr.trim());
        }
        parts.join("\n")
    }
}

/// Run-a-command capability exposed by a sandbox
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run `command` through a POSIX shell inside the sandbox
    async fn run(&self, command: &str, options: RunOptions) -> crate::Result<RunOutput>;

    /// Whether `on_output` receives chunks as they arrive rather than once at the end
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Runs commands with `sh -c` on the local host
#[derive(Debug, Clone)]
pub struct LocalSandbox {
    shell: String,
}

impl LocalSandbox {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalSandbox {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn run(&self, command: &str, options: RunOptions) -> crate::Result<RunOutput> {
        let mut cmd = match options.user.as_deref() {
            Some(user) => {
                let mut cmd = Command::new("sudo");
                cmd.args(["-n", "-u", user, self.shell.as_str(), "-c", command]);
                cmd
            }
            None => {
                let mut cmd = Command::new(&self.shell);
                cmd.args(["-c", command]);
                cmd
            }
        };
        if let Some(cwd) = options.cwd.as_deref() {
            cmd.current_dir(cwd);
        }

        run_process(cmd, &options).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Availability of the local Docker CLI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DockerStatus {
    pub available: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

/// Runs commands inside a named container via `docker exec`
#[derive(Debug, Clone)]
pub struct DockerSandbox {
    container: String,
    docker: String,
}

impl DockerSandbox {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            docker: "docker".to_string(),
        }
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Check that the Docker CLI is installed and answering
    pub async fn check_docker(&self) -> DockerStatus {
        tracing::info!("Checking Docker availability");

        let output = Command::new(&self.docker)
            .arg("--version")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(result) if result.status.success() => {
                let version = String::from_utf8_lossy(&result.stdout).trim().to_string();
                tracing::info!("Docker available: {}", version);
                DockerStatus {
                    available: true,
                    version: Some(version),
                    error: None,
                }
            }
            Ok(result) => {
                let error = String::from_utf8_lossy(&result.stderr).to_string();
                tracing::warn!("Docker check failed: {}", error);
                DockerStatus {
                    available: false,
                    version: None,
                    error: Some(error),
                }
            }
            Err(e) => {
                let error = format!("Failed to run docker command: {}", e);
                tracing::warn!("{}", error);
                DockerStatus {
                    available: false,
                    version: None,
                    error: Some(error),
                }
            }
        }
    }

    /// Whether the sandbox container exists and is running
    pub async fn is_container_running(&self) -> bool {
        Command::new(&self.docker)
            .args(["inspect", "-f", "{{.State.Running}}", &self.container])
            .output()
            .await
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "true")
            .unwrap_or(false)
    }

    fn exec_args(&self, command: &str, options: &RunOptions) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if let Some(user) = options.user.as_deref() {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        if let Some(cwd) = options.cwd.as_deref() {
            args.push("-w".to_string());
            args.push(cwd.to_string());
        }
        args.push(self.container.clone());
        args.extend(["sh".to_string(), "-c".to_string(), command.to_string()]);
        args
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn run(&self, command: &str, options: RunOptions) -> crate::Result<RunOutput> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(self.exec_args(command, &options));
        run_process(cmd, &options).await
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

/// Spawn `cmd`, forward stdout chunks to the sink and enforce the timeout
async fn run_process(mut cmd: Command, options: &RunOptions) -> crate::Result<RunOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| crate::TerminalError::Sandbox(format!("Failed to spawn command: {}", e)))?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| crate::TerminalError::Sandbox("stdout not available".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| crate::TerminalError::Sandbox("stderr not available".to_string()))?;

    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).to_string()
    });

    let mut collected = Vec::new();
    let result = tokio::time::timeout(options.timeout, async {
        let mut chunk = [0u8; 4096];
        loop {
            let n = stdout.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            if let Some(sink) = options.on_output.as_ref() {
                sink(&String::from_utf8_lossy(&chunk[..n]));
            }
            collected.extend_from_slice(&chunk[..n]);
        }
        child.wait().await
    })
    .await;

    let (exit_code, stderr) = match result {
        Ok(Ok(status)) => (
            status.code().unwrap_or(-1),
            stderr_task.await.unwrap_or_default(),
        ),
        Ok(Err(e)) => {
            stderr_task.abort();
            return Err(crate::TerminalError::Sandbox(format!(
                "Failed to wait for command: {}",
                e
            )));
        }
        Err(_) => {
            tracing::warn!("Sandbox command timed out after {:?}", options.timeout);
            let _ = child.kill().await;
            // Grandchildren may still hold the pipe open
            stderr_task.abort();
            (TIMEOUT_EXIT_CODE, String::new())
        }
    };

    Ok(RunOutput {
        stdout: String::from_utf8_lossy(&collected).to_string(),
        stderr,
        exit_code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_run_output_combined() {
        let output = RunOutput {
            stdout: "out\n".to_string(),
            stderr: "  err ".to_string(),
            exit_code: 1,
        };
        assert!(!output.success());
        assert_eq!(output.combined(), "out\nerr");
    }

    #[test]
    fn test_docker_exec_args() {
        let sandbox = DockerSandbox::new("sandbox-1");
        let options = RunOptions::with_timeout(Duration::from_secs(1)).user("root");
        let args = sandbox.exec_args("echo hi", &options);
        assert_eq!(
            args,
            vec!["exec", "-u", "root", "sandbox-1", "sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn test_run_options_debug_hides_sink() {
        let sink: OutputSink = Arc::new(|_| {});
        let options = RunOptions::with_timeout(Duration::from_secs(2)).on_output(sink);
        let rendered = format!("{:?}", options);
        assert!(rendered.contains("on_output: true"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_sandbox_runs_command() {
        let sandbox = LocalSandbox::new();
        let output = sandbox
            .run("echo hello; echo oops >&2; exit 3", RunOptions::with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();

        assert_eq!(output.stdout, "hello\n");
        assert_eq!(output.stderr.trim(), "oops");
        assert_eq!(output.exit_code, 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_sandbox_streams_chunks() {
        let seen = Arc::new(Mutex::new(String::new()));
        let sink_seen = Arc::clone(&seen);
        let sink: OutputSink = Arc::new(move |chunk| sink_seen.lock().unwrap().push_str(chunk));

        let sandbox = LocalSandbox::new();
        let output = sandbox
            .run(
                "echo one; echo two",
                RunOptions::with_timeout(Duration::from_secs(5)).on_output(sink),
            )
            .await
            .unwrap();

        assert_eq!(output.stdout, "one\ntwo\n");
        assert_eq!(seen.lock().unwrap().as_str(), "one\ntwo\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_sandbox_timeout() {
        let sandbox = LocalSandbox::new();
        let output = sandbox
            .run("echo started; sleep 5", RunOptions::with_timeout(Duration::from_millis(300)))
            .await
            .unwrap();

        assert_eq!(output.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(output.stdout, "started\n");
    }
}
