use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Default shell used to interpret command lines
pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Status reported when the real exit status of a process cannot be observed
pub const UNKNOWN_STATUS: i32 = -1;

/// Opaque reference to a spawned process.
///
/// Processes are started as leaders of their own process group, so the pid
/// doubles as the group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessHandle {
    pid: u32,
}

impl ProcessHandle {
    /// Wrap a pid obtained elsewhere, e.g. from a reconciliation record
    pub fn from_pid(pid: u32) -> Self {
        Self { pid }
    }

    /// The process id
    pub fn pid(&self) -> u32 {
        self.pid
    }
}

/// Single-fire notification carrying the exit status of a process.
///
/// The status is the exit code, or the negated signal number when the
/// process was terminated by a signal.
#[derive(Debug)]
pub struct ExitSignal {
    rx: oneshot::Receiver<i32>,
}

impl ExitSignal {
    /// Create a connected sender/signal pair
    pub fn channel() -> (oneshot::Sender<i32>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// Wait for the status. `None` if the sending side went away without firing.
    pub async fn wait(self) -> Option<i32> {
        self.rx.await.ok()
    }
}

/// Spawns shell command lines as detached child processes.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    shell: PathBuf,
    log_dir: Option<PathBuf>,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl CommandRunner {
    /// Create a runner that interprets commands with `<shell> -c`
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            log_dir: None,
        }
    }

    /// Append the output of each process to `<dir>/<log name>.log`
    pub fn with_log_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.log_dir = dir;
        self
    }

    /// The shell used to interpret commands
    pub fn shell(&self) -> &Path {
        &self.shell
    }

    /// Start a command line without waiting for it.
    ///
    /// The process inherits the environment plus `env`, runs in a new process
    /// group and has stdin closed. Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        cmd: &str,
        env: &[(String, String)],
        log_name: Option<&str>,
    ) -> Result<(ProcessHandle, ExitSignal)> {
        if cmd.trim().is_empty() {
            return Err(Error::Spawn("empty command".to_string()));
        }

        debug!("Starting command: {}", cmd);

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(cmd)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .process_group(0);

        match (&self.log_dir, log_name) {
            (Some(dir), Some(name)) => {
                let (stdout, stderr) = open_log(dir, name)?;
                command.stdout(stdout).stderr(stderr);
            }
            _ => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::Spawn(format!("{}: {e}", self.shell.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| Error::Spawn("process exited before its pid was read".to_string()))?;
        info!("Process spawned with PID: {}", pid);

        let (tx, signal) = ExitSignal::channel();
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => status_code(status),
                Err(e) => {
                    warn!("Failed to wait for process {}: {}", pid, e);
                    UNKNOWN_STATUS
                }
            };
            debug!("Process {} exited with status {}", pid, status);
            let _ = tx.send(status);
        });

        Ok((ProcessHandle { pid }, signal))
    }

    /// Send SIGTERM to the process group.
    ///
    /// Returns `Ok(false)` when the group no longer exists, which is not an error.
    pub fn kill(&self, handle: ProcessHandle) -> Result<bool> {
        self.signal(handle, libc::SIGTERM)
    }

    /// Liveness of the handle's process, by pid existence
    pub fn is_alive(&self, handle: ProcessHandle) -> bool {
        is_alive(handle.pid)
    }

    /// SIGTERM the group, then SIGKILL it if it is still around after `grace`.
    ///
    /// Only the SIGTERM is awaited; escalation happens in the background.
    pub fn terminate(&self, handle: ProcessHandle, grace: Duration) -> Result<bool> {
        let delivered = self.kill(handle)?;
        if delivered {
            let runner = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if group_alive(handle) {
                    warn!("Process group {} ignored SIGTERM, sending SIGKILL", handle.pid);
                    let _ = runner.signal(handle, libc::SIGKILL);
                }
            });
        }
        Ok(delivered)
    }

    fn signal(&self, handle: ProcessHandle, signal: libc::c_int) -> Result<bool> {
        let pgid = pid_t(handle.pid)?;
        // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
        let rc = unsafe { libc::kill(-pgid, signal) };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            debug!("Process group {} is already gone", handle.pid);
            Ok(false)
        } else {
            Err(Error::Kill(format!("process group {}: {err}", handle.pid)))
        }
    }
}

/// Probe whether a process exists (signal 0). A permission error still means it exists.
pub fn is_alive(pid: u32) -> bool {
    match pid_t(pid) {
        Ok(pid) => probe(pid),
        Err(_) => false,
    }
}

/// Probe whether any member of the handle's process group exists
pub fn group_alive(handle: ProcessHandle) -> bool {
    match pid_t(handle.pid) {
        Ok(pgid) => probe(-pgid),
        Err(_) => false,
    }
}

fn probe(target: libc::pid_t) -> bool {
    // SAFETY: signal 0 performs only the existence and permission checks.
    let rc = unsafe { libc::kill(target, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

fn pid_t(pid: u32) -> Result<libc::pid_t> {
    match libc::pid_t::try_from(pid) {
        Ok(pid) if pid > 0 => Ok(pid),
        _ => Err(Error::Kill(format!("invalid pid {pid}"))),
    }
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(UNKNOWN_STATUS, |sig| -sig))
}

fn open_log(dir: &Path, name: &str) -> Result<(Stdio, Stdio)> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{name}.log")))?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exit_code_is_delivered() {
        let runner = CommandRunner::default();
        let (handle, signal) = runner.start("exit 3", &[], None).unwrap();
        assert!(handle.pid() > 0);
        assert_eq!(signal.wait().await, Some(3));
    }

    #[tokio::test]
    async fn test_empty_command_is_rejected() {
        let runner = CommandRunner::default();
        assert!(matches!(runner.start("   ", &[], None), Err(Error::Spawn(_))));
    }

    #[tokio::test]
    async fn test_missing_shell_is_spawn_failure() {
        let runner = CommandRunner::new("/nonexistent/shell");
        assert!(matches!(runner.start("true", &[], None), Err(Error::Spawn(_))));
    }

    #[tokio::test]
    async fn test_kill_reports_signal_status() {
        let runner = CommandRunner::default();
        let (handle, signal) = runner.start("sleep 30", &[], None).unwrap();
        assert!(group_alive(handle));

        assert!(runner.kill(handle).unwrap());
        assert_eq!(signal.wait().await, Some(-libc::SIGTERM));

        // The group has been reaped, so a second kill finds nothing
        assert!(!runner.kill(handle).unwrap());
        assert!(!group_alive(handle));
    }

    #[tokio::test]
    async fn test_env_and_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CommandRunner::default().with_log_dir(Some(dir.path().to_path_buf()));
        let env = vec![("SHORTCUT_ID".to_string(), "s1".to_string())];
        let (_, signal) = runner
            .start("echo \"id=$SHORTCUT_ID\"; echo oops >&2", &env, Some("s1"))
            .unwrap();
        assert_eq!(signal.wait().await, Some(0));

        let log = std::fs::read_to_string(dir.path().join("s1.log")).unwrap();
        assert!(log.contains("id=s1"));
        assert!(log.contains("oops"));
    }

    #[test]
    fn test_is_alive() {
        assert!(is_alive(std::process::id()));
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));
    }
}
