//! Local Tool Supervisor
//!
//! Owns the OS lifecycle of tool processes on one host. Every tool runs in its
//! own process group so a stop reaches whatever the tool's shell forked.
//! Stopping is two-step: SIGTERM to the group, a bounded wait, then SIGKILL.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::Termination;
use crate::error::{Result, ToolMeisterError};
use crate::tools::{ToolKind, ToolSpec};

/// Upper bound on reaping a process after SIGKILL
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Final status of a stopped tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub tool: String,
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub truncated: bool,
}

/// Result of a one-off command run to completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capture {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stderr: String,
}

impl Capture {
    /// Why the command did not succeed, if it did not
    pub fn failure(&self) -> Option<String> {
        if self.timed_out {
            return Some("timed out and was killed".to_string());
        }
        match self.exit_code {
            Some(0) => None,
            code => {
                let mut reason = format!("exited with {}", code.unwrap_or(-1));
                if !self.stderr.is_empty() {
                    reason.push_str(": ");
                    reason.push_str(&self.stderr);
                }
                Some(reason)
            }
        }
    }
}

/// A started tool
pub struct ToolHandle {
    pub tool: String,
    pub kind: ToolKind,
    pub output_dir: PathBuf,
    pub pid: Option<u32>,
    inner: HandleInner,
}

enum HandleInner {
    Process(Child),
    Periodic {
        /// Carries the grace period once a stop is requested
        cancel: watch::Sender<Option<Duration>>,
        task: JoinHandle<PeriodicExit>,
    },
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("tool", &self.tool)
            .field("kind", &self.kind)
            .field("pid", &self.pid)
            .finish()
    }
}

#[derive(Debug, Default)]
struct PeriodicExit {
    rounds: u64,
    /// The round in progress ignored SIGTERM and was killed
    forced: bool,
    last_exit: Option<i32>,
}

/// Launches one round of a tool command with output appended to its files
#[derive(Debug, Clone)]
struct RoundLauncher {
    shell: String,
    spec: ToolSpec,
    tool_dir: PathBuf,
    header: bool,
}

impl RoundLauncher {
    fn stdout_path(&self) -> PathBuf {
        self.tool_dir.join(format!("{}-stdout.txt", self.spec.name))
    }

    fn stderr_path(&self) -> PathBuf {
        self.tool_dir.join(format!("{}-stderr.txt", self.spec.name))
    }

    fn launch(&self) -> std::io::Result<Child> {
        let mut stdout = OpenOptions::new().create(true).append(true).open(self.stdout_path())?;
        let stderr = OpenOptions::new().create(true).append(true).open(self.stderr_path())?;
        if self.header {
            writeln!(stdout, "--- {}", chrono::Utc::now().to_rfc3339())?;
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.spec.command)
            .current_dir(&self.tool_dir)
            .envs(self.spec.env(&self.tool_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .process_group(0)
            .kill_on_drop(true);
        cmd.spawn()
    }
}

/// SIGTERM the child's group, wait up to `grace`, then SIGKILL
///
/// Returns the exit code and whether the kill was needed.
async fn terminate_child(tool: &str, child: &mut Child, grace: Duration) -> (Option<i32>, bool) {
    let pid = child.id();
    signal_group(pid, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => return (exit_code(status), false),
        Ok(Err(e)) => log::warn!("{}: wait failed after SIGTERM: {}", tool, e),
        Err(_) => log::warn!("{}: still running {:?} after SIGTERM, killing", tool, grace),
    }

    signal_group(pid, Signal::SIGKILL);
    if let Err(e) = child.start_kill() {
        log::debug!("{}: start_kill: {}", tool, e);
    }
    let code = match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(Ok(status)) => exit_code(status),
        Ok(Err(e)) => {
            log::warn!("{}: wait failed after SIGKILL: {}", tool, e);
            None
        }
        Err(_) => {
            log::error!("{}: pid {:?} not reaped after SIGKILL", tool, pid);
            None
        }
    };
    (code, true)
}

/// Exit code, or 128 + signal for signal deaths
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|s| 128 + s))
}

fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        log::debug!("killpg({}, {:?}): {}", pid, signal, e);
    }
}

pub struct LocalToolSupervisor {
    shell: String,
    install_check_timeout: Duration,
}

impl Default for LocalToolSupervisor {
    fn default() -> Self {
        Self::new("/bin/sh", Duration::from_secs(10))
    }
}

impl LocalToolSupervisor {
    pub fn new(shell: impl Into<String>, install_check_timeout: Duration) -> Self {
        Self {
            shell: shell.into(),
            install_check_timeout,
        }
    }

    /// Run the tool's install predicate
    pub async fn check_installed(&self, spec: &ToolSpec) -> Result<()> {
        let Some(check) = &spec.install_check else {
            return Ok(());
        };

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(check)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.install_check_timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolMeisterError::SpawnError {
                    tool: spec.name.clone(),
                    detail: format!("install check could not run: {}", e),
                });
            }
            Err(_) => {
                return Err(ToolMeisterError::ToolNotInstalled {
                    tool: spec.name.clone(),
                    detail: format!("install check timed out after {:?}", self.install_check_timeout),
                });
            }
        };

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        Err(ToolMeisterError::ToolNotInstalled {
            tool: spec.name.clone(),
            detail: format!(
                "install check `{}` exited with {}{}",
                check,
                exit_code(output.status).unwrap_or(-1),
                if stderr.is_empty() { String::new() } else { format!(": {}", stderr) }
            ),
        })
    }

    /// Run `command` to completion with its stdout written to `out`
    ///
    /// The command's process group is killed once `timeout` passes.
    pub async fn capture(&self, name: &str, command: &str, out: &Path, timeout: Duration) -> Result<Capture> {
        let spawn_err = |e: std::io::Error| ToolMeisterError::SpawnError {
            tool: name.to_string(),
            detail: e.to_string(),
        };
        let stdout = File::create(out).map_err(spawn_err)?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let child = cmd.spawn().map_err(spawn_err)?;
        let pid = child.id();

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(Capture {
                exit_code: exit_code(output.status),
                timed_out: false,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
            Ok(Err(e)) => Err(spawn_err(e)),
            Err(_) => {
                log::warn!("{}: still running after {:?}, killing", name, timeout);
                signal_group(pid, Signal::SIGKILL);
                Ok(Capture {
                    exit_code: None,
                    timed_out: true,
                    stderr: String::new(),
                })
            }
        }
    }

    /// Launch a tool for a sample, writing under `<sample_dir>/<tool>/`
    ///
    /// Returns as soon as the process (or the first round of a periodic
    /// sampler) is running.
    pub async fn start(&self, spec: &ToolSpec, sample_dir: &Path) -> Result<ToolHandle> {
        self.check_installed(spec).await?;

        let spawn_err = |e: std::io::Error| ToolMeisterError::SpawnError {
            tool: spec.name.clone(),
            detail: e.to_string(),
        };

        let tool_dir = sample_dir.join(&spec.name);
        fs::create_dir_all(&tool_dir).map_err(spawn_err)?;

        let launcher = RoundLauncher {
            shell: self.shell.clone(),
            spec: spec.clone(),
            tool_dir: tool_dir.clone(),
            header: spec.kind == ToolKind::PeriodicSample,
        };
        // Truncate output left by an earlier attempt at the same sample.
        File::create(launcher.stdout_path()).map_err(spawn_err)?;
        File::create(launcher.stderr_path()).map_err(spawn_err)?;

        let child = launcher.launch().map_err(spawn_err)?;
        let pid = child.id();

        let inner = match spec.kind {
            ToolKind::PersistentDatalog | ToolKind::SingleShot => HandleInner::Process(child),
            ToolKind::PeriodicSample => {
                let (cancel, cancel_rx) = watch::channel(None);
                let interval = Duration::from_secs(spec.interval.max(1));
                let task = tokio::spawn(run_periodic(launcher, child, interval, cancel_rx));
                HandleInner::Periodic { cancel, task }
            }
        };

        log::info!("started {} ({}) pid {:?} in {}", spec.name, spec.kind.as_str(), pid, tool_dir.display());
        Ok(ToolHandle {
            tool: spec.name.clone(),
            kind: spec.kind,
            output_dir: tool_dir,
            pid,
            inner,
        })
    }

    /// Stop a tool, escalating to SIGKILL after `grace`
    ///
    /// Never waits longer than `grace` plus a fixed reap bound.
    pub async fn stop(&self, handle: ToolHandle, grace: Duration) -> StopReport {
        let tool = handle.tool;
        match handle.inner {
            HandleInner::Process(child) => stop_process(tool, child, grace).await,
            HandleInner::Periodic { cancel, task } => stop_periodic(tool, cancel, task, grace).await,
        }
    }
}

async fn stop_process(tool: String, mut child: Child, grace: Duration) -> StopReport {
    let report = |termination, exit_code, truncated| StopReport {
        tool: tool.clone(),
        termination,
        exit_code,
        truncated,
    };

    match child.try_wait() {
        Ok(Some(status)) => return report(Termination::AlreadyExited, exit_code(status), false),
        Ok(None) => {}
        Err(e) => log::warn!("{}: try_wait failed: {}", tool, e),
    }

    match terminate_child(&tool, &mut child, grace).await {
        (code, false) => report(Termination::Graceful, code, false),
        (code, true) => report(Termination::Forced, code, true),
    }
}

async fn stop_periodic(
    tool: String,
    cancel: watch::Sender<Option<Duration>>,
    mut task: JoinHandle<PeriodicExit>,
    grace: Duration,
) -> StopReport {
    if task.is_finished() {
        let exit = task.await.unwrap_or_default();
        return StopReport {
            tool,
            termination: Termination::AlreadyExited,
            exit_code: exit.last_exit,
            truncated: false,
        };
    }

    cancel.send_replace(Some(grace));
    // The task itself applies the grace period and the reap bound.
    match tokio::time::timeout(grace + REAP_TIMEOUT * 2, &mut task).await {
        Ok(Ok(exit)) => {
            log::debug!("{}: periodic sampler stopped after {} rounds", tool, exit.rounds);
            StopReport {
                tool,
                termination: if exit.forced { Termination::Forced } else { Termination::Graceful },
                exit_code: exit.last_exit,
                truncated: exit.forced,
            }
        }
        Ok(Err(e)) => {
            log::warn!("{}: periodic sampler task failed: {}", tool, e);
            StopReport {
                tool,
                termination: Termination::Forced,
                exit_code: None,
                truncated: true,
            }
        }
        Err(_) => {
            log::error!("{}: periodic sampler did not wind down, aborting", tool);
            task.abort();
            StopReport {
                tool,
                termination: Termination::Forced,
                exit_code: None,
                truncated: true,
            }
        }
    }
}

async fn run_periodic(
    launcher: RoundLauncher,
    mut child: Child,
    interval: Duration,
    mut cancel: watch::Receiver<Option<Duration>>,
) -> PeriodicExit {
    let mut exit = PeriodicExit::default();
    loop {
        exit.rounds += 1;
        tokio::select! {
            status = child.wait() => {
                exit.last_exit = status.ok().and_then(exit_code);
            }
            _ = cancel.changed() => {
                // The round in progress gets the same two-step stop as any tool.
                let grace = (*cancel.borrow()).unwrap_or_default();
                let (code, forced) = terminate_child(&launcher.spec.name, &mut child, grace).await;
                exit.last_exit = code;
                exit.forced = forced;
                return exit;
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => return exit,
        }

        child = match launcher.launch() {
            Ok(child) => child,
            Err(e) => {
                log::warn!("{}: periodic round failed to launch: {}", launcher.spec.name, e);
                return exit;
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolDefinition;
    use std::collections::BTreeMap;
    use std::time::Instant;
    use tempfile::TempDir;

    fn spec(name: &str, kind: ToolKind, command: &str) -> ToolSpec {
        ToolDefinition::new(name, kind, command).with_interval(1).resolve(&BTreeMap::new())
    }

    fn supervisor() -> LocalToolSupervisor {
        LocalToolSupervisor::new("/bin/sh", Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_persistent_graceful_stop() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let handle = sup
            .start(&spec("sar", ToolKind::PersistentDatalog, "echo hello; exec sleep 30"), dir.path())
            .await
            .unwrap();
        assert!(handle.pid.is_some());
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = sup.stop(handle, Duration::from_secs(2)).await;
        assert_eq!(report.termination, Termination::Graceful);
        assert_eq!(report.exit_code, Some(128 + 15));
        assert!(!report.truncated);

        let out = fs::read_to_string(dir.path().join("sar").join("sar-stdout.txt")).unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn test_trap_exit_zero() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let cmd = "trap 'exit 0' TERM; while true; do echo sample; sleep 0.1; done";
        let handle = sup.start(&spec("sar", ToolKind::PersistentDatalog, cmd), dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.stop(handle, Duration::from_secs(2)).await;
        assert_eq!(report.termination, Termination::Graceful);
        assert_eq!(report.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_ignored_sigterm_escalates() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let handle = sup
            .start(&spec("stubborn", ToolKind::PersistentDatalog, "trap '' TERM; echo up; sleep 60"), dir.path())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let began = Instant::now();
        let report = sup.stop(handle, Duration::from_millis(300)).await;
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(report.termination, Termination::Forced);
        assert_eq!(report.exit_code, Some(128 + 9));
        assert!(report.truncated);

        let out = fs::read_to_string(dir.path().join("stubborn").join("stubborn-stdout.txt")).unwrap();
        assert_eq!(out, "up\n");
    }

    #[tokio::test]
    async fn test_single_shot_already_exited() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let handle = sup.start(&spec("lscpu", ToolKind::SingleShot, "echo once"), dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.stop(handle, Duration::from_secs(1)).await;
        assert_eq!(report.termination, Termination::AlreadyExited);
        assert_eq!(report.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_periodic_rounds_have_headers() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let handle = sup
            .start(&spec("proc-tick", ToolKind::PeriodicSample, "echo tick"), dir.path())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        let report = sup.stop(handle, Duration::from_secs(2)).await;
        assert_eq!(report.termination, Termination::Graceful);
        assert!(!report.truncated);

        let out = fs::read_to_string(dir.path().join("proc-tick").join("proc-tick-stdout.txt")).unwrap();
        let headers = out.lines().filter(|l| l.starts_with("--- ")).count();
        let ticks = out.lines().filter(|l| *l == "tick").count();
        assert!(headers >= 2, "{}", out);
        assert!(ticks >= 1);
    }

    #[tokio::test]
    async fn test_periodic_round_gets_sigterm_first() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let cmd = "trap 'echo flushed; exit 0' TERM; sleep 5 & wait";
        let handle = sup.start(&spec("proc-flush", ToolKind::PeriodicSample, cmd), dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = sup.stop(handle, Duration::from_secs(2)).await;
        assert_eq!(report.termination, Termination::Graceful);
        assert_eq!(report.exit_code, Some(0));
        assert!(!report.truncated);

        let out = fs::read_to_string(dir.path().join("proc-flush").join("proc-flush-stdout.txt")).unwrap();
        assert!(out.contains("flushed"), "{}", out);
    }

    #[tokio::test]
    async fn test_periodic_round_ignoring_sigterm_is_forced() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let handle = sup
            .start(&spec("proc-stuck", ToolKind::PeriodicSample, "trap '' TERM; sleep 30"), dir.path())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let began = Instant::now();
        let report = sup.stop(handle, Duration::from_millis(300)).await;
        assert!(began.elapsed() >= Duration::from_millis(300));
        assert!(began.elapsed() < Duration::from_secs(5));
        assert_eq!(report.termination, Termination::Forced);
        assert_eq!(report.exit_code, Some(128 + 9));
        assert!(report.truncated);
    }

    #[tokio::test]
    async fn test_install_check_failure() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let mut iostat = spec("iostat", ToolKind::PersistentDatalog, "exec sleep 30");
        iostat.install_check = Some("exit 3".to_string());

        let err = sup.start(&iostat, dir.path()).await.unwrap_err();
        match err {
            ToolMeisterError::ToolNotInstalled { tool, detail } => {
                assert_eq!(tool, "iostat");
                assert!(detail.contains("exited with 3"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!dir.path().join("iostat").exists());
    }

    #[tokio::test]
    async fn test_install_check_timeout() {
        let sup = LocalToolSupervisor::new("/bin/sh", Duration::from_millis(200));
        let mut slow = spec("slow", ToolKind::PersistentDatalog, "true");
        slow.install_check = Some("sleep 5".to_string());
        let err = sup.check_installed(&slow).await.unwrap_err();
        assert!(matches!(err, ToolMeisterError::ToolNotInstalled { .. }));
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let dir = TempDir::new().unwrap();
        let sup = LocalToolSupervisor::new("/nonexistent/shell", Duration::from_secs(1));
        let err = sup
            .start(&spec("sar", ToolKind::PersistentDatalog, "true"), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ToolMeisterError::SpawnError { .. }));
    }

    #[tokio::test]
    async fn test_capture_writes_stdout() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let out = dir.path().join("kernel.txt");
        let capture = sup
            .capture("kernel", "echo Linux; echo oops >&2", &out, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(capture.failure(), None);
        assert_eq!(capture.stderr, "oops");
        assert_eq!(fs::read_to_string(&out).unwrap(), "Linux\n");

        let failed = sup
            .capture("block", "echo nope >&2; exit 4", &dir.path().join("block.txt"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(failed.failure().unwrap(), "exited with 4: nope");
    }

    #[tokio::test]
    async fn test_capture_timeout_kills() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let began = Instant::now();
        let capture = sup
            .capture("sos", "sleep 30", &dir.path().join("sos.txt"), Duration::from_millis(200))
            .await
            .unwrap();
        assert!(began.elapsed() < Duration::from_secs(5));
        assert!(capture.timed_out);
        assert!(capture.failure().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_tool_sees_environment() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor();
        let def = ToolDefinition::new("envtool", ToolKind::SingleShot, r#"echo "$TOOL_INTERVAL $TOOL_PARAM_DEVICE""#);
        let mut params = BTreeMap::new();
        params.insert("interval".to_string(), "4".to_string());
        params.insert("device".to_string(), "sda".to_string());
        let handle = sup.start(&def.resolve(&params), dir.path()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.stop(handle, Duration::from_secs(1)).await;

        let out = fs::read_to_string(dir.path().join("envtool").join("envtool-stdout.txt")).unwrap();
        assert_eq!(out.trim(), "4 sda");
    }
}
