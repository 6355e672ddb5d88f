//! # Child Process Handling
//!
//! The handshake server and client are external programs. This module wraps
//! them in two shapes:
//!
//! - [`ManagedProcess`]: a long-running child whose standard output is read
//!   line by line while it runs, and which is shut down with SIGTERM followed
//!   by SIGKILL once a grace period expires.
//! - [`run_bounded`]: a short-lived child whose whole standard output is
//!   captured, killed if it does not finish within a time limit.
//!
//! Children are always spawned with `kill_on_drop`, so a handle dropped on an
//! error path never leaves a process behind.

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Program, arguments and working directory of a child to launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Prefix the command with `ip netns exec <namespace>`.
    pub fn in_namespace(self, namespace: &str) -> Self {
        let mut args = vec![
            OsString::from("netns"),
            OsString::from("exec"),
            OsString::from(namespace),
            self.program,
        ];
        args.extend(self.args);
        Self {
            program: OsString::from("ip"),
            args,
            cwd: self.cwd,
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(ref cwd) = self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null());
        cmd.stderr(Stdio::inherit());
        cmd.kill_on_drop(true);
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// A running long-lived child with its standard output piped to us.
#[derive(Debug)]
pub struct ManagedProcess {
    label: String,
    child: Child,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
}

impl ManagedProcess {
    /// Spawn `spec` with standard output captured.
    pub fn start(spec: &CommandSpec, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        debug!("Spawning {}: {}", label, spec);
        let mut child = spec
            .command()
            .stdout(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn {} ({})", label, spec))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("could not access stdout of {}", label))?;
        Ok(Self {
            label,
            child,
            stdout: Some(BufReader::new(stdout).lines()),
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Read the next line of standard output. `None` at end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>> {
        match self.stdout.as_mut() {
            Some(lines) => Ok(lines.next_line().await?),
            None => Err(anyhow!("stdout of {} has been taken", self.label)),
        }
    }

    /// Hand the output stream to another task. Can only be called once.
    pub fn take_stdout(&mut self) -> Result<Lines<BufReader<ChildStdout>>> {
        self.stdout
            .take()
            .ok_or_else(|| anyhow!("stdout of {} has already been taken", self.label))
    }

    /// Whether the child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Wait for the child to exit for at most `limit`.
    pub async fn wait(&mut self, limit: Duration) -> Result<Option<ExitStatus>> {
        match timeout(limit, self.child.wait()).await {
            Ok(status) => Ok(Some(status?)),
            Err(_) => Ok(None),
        }
    }

    /// Ask the child to stop with SIGTERM, escalating to SIGKILL after
    /// `grace`. A forced kill is logged, never an error.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!("{} already exited with {}", self.label, status);
            return Ok(());
        }
        if let Some(pid) = self.child.id() {
            if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("SIGTERM to {} failed: {}", self.label, e);
            }
        }
        if self.wait(grace).await?.is_none() {
            warn!(
                "Timeout expired while waiting for {} to terminate, killing it",
                self.label
            );
            self.child
                .kill()
                .await
                .with_context(|| format!("Failed to kill {}", self.label))?;
        }
        Ok(())
    }
}

/// Result of a time-limited child invocation.
#[derive(Debug)]
pub enum BoundedOutcome {
    Completed { status: ExitStatus, stdout: String },
    TimedOut,
}

/// Run `spec` to completion, capturing standard output, killing it if it has
/// not finished within `limit`.
pub async fn run_bounded(spec: &CommandSpec, limit: Duration) -> Result<BoundedOutcome> {
    debug!("Running with {:?} limit: {}", limit, spec);
    let mut child = spec
        .command()
        .stdout(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to spawn {}", spec))?;
    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("could not access stdout of {}", spec))?;

    let finished = timeout(limit, async {
        let mut output = String::new();
        stdout.read_to_string(&mut output).await?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, output))
    })
    .await;

    match finished {
        Ok(result) => {
            let (status, stdout) = result.with_context(|| format!("Failed to collect {}", spec))?;
            Ok(BoundedOutcome::Completed { status, stdout })
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed out {}: {}", spec, e);
            }
            Ok(BoundedOutcome::TimedOut)
        }
    }
}

/// Run `spec` to completion and return its combined output, failing on a
/// non-zero exit.
pub async fn run_checked(spec: &CommandSpec) -> Result<String> {
    debug!("Running: {}", spec);
    let output = spec
        .command()
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("Failed to run {}", spec))?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(crate::error::HarnessError::CommandFailed {
            command: spec.to_string(),
            status: output.status.to_string(),
            output: text.trim().to_string(),
        }
        .into());
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HarnessError;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_namespace_wrapping() {
        let spec = CommandSpec::new("./pqtlsserver")
            .args(["-p", "10000"])
            .current_dir("/tmp")
            .in_namespace("srv_ns");
        assert_eq!(spec.to_string(), "ip netns exec srv_ns ./pqtlsserver -p 10000");
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp")));
    }

    #[tokio::test]
    async fn test_bounded_completion_captures_stdout() {
        let outcome = run_bounded(&sh("echo one; echo two"), Duration::from_secs(5))
            .await
            .unwrap();
        match outcome {
            BoundedOutcome::Completed { status, stdout } => {
                assert!(status.success());
                assert_eq!(stdout, "one\ntwo\n");
            }
            BoundedOutcome::TimedOut => panic!("short command timed out"),
        }
    }

    #[tokio::test]
    async fn test_bounded_timeout() {
        let started = std::time::Instant::now();
        let outcome = run_bounded(&sh("exec sleep 30"), Duration::from_millis(100))
            .await
            .unwrap();
        assert!(matches!(outcome, BoundedOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_checked_failure_is_command_failed() {
        let err = run_checked(&sh("echo nope >&2; exit 3")).await.unwrap_err();
        match err.downcast_ref::<HarnessError>() {
            Some(HarnessError::CommandFailed { output, .. }) => assert_eq!(output, "nope"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_managed_process_terminates_gracefully() {
        let mut process = ManagedProcess::start(&sh("echo ready; exec sleep 30"), "sleeper").unwrap();
        assert_eq!(process.read_line().await.unwrap().as_deref(), Some("ready"));
        assert!(process.is_alive());
        process.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(!process.is_alive());
    }

    #[tokio::test]
    async fn test_managed_process_escalates_to_kill() {
        let mut process = ManagedProcess::start(
            &sh("trap '' TERM; echo ready; while :; do sleep 0.05; done"),
            "stubborn",
        )
        .unwrap();
        assert_eq!(process.read_line().await.unwrap().as_deref(), Some("ready"));
        process.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(!process.is_alive());
    }
}
