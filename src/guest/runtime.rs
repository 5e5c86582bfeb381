//! Seam to the OCI low-level runtime.
//!
//! The guest does not implement container execution itself; it drives an
//! external OCI runtime (crun, runc, youki) through [`ContainerRuntime`].
//! The default implementation, [`CommandRuntime`], invokes the runtime
//! binary in foreground mode: the runtime process's standard streams are
//! the container process's streams, which is exactly what the stdio
//! manager wants to own.
//!
//! Exit observation is per-process: every create/exec hands back a oneshot
//! that resolves with the exit status when the foreground runtime process
//! finishes. Orphans re-parented to PID 1 are reaped separately by the
//! vminit binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::stdio::{OutputSource, StdinSink};
use crate::error::{Error, Result};

/// Requested stdio wiring for a new process.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoRequest {
    /// Attach a stdin pipe.
    pub stdin: bool,
    /// The process wants a terminal; output arrives merged on stdout.
    pub terminal: bool,
}

/// A process created through the runtime: its pid, its stdio handles, and
/// a oneshot resolving with the exit status.
pub struct RuntimeProcess {
    /// Pid of the container process inside the guest.
    pub pid: i32,
    /// Stdin sink, present when requested.
    pub stdin: Option<StdinSink>,
    /// Stdout source (also carries tty output in terminal mode).
    pub stdout: Option<OutputSource>,
    /// Stderr source; absent in terminal mode.
    pub stderr: Option<OutputSource>,
    /// Resolves with the exit status; an error on the channel means the
    /// waiter task itself died, which callers may treat as status 255.
    pub exit: oneshot::Receiver<i32>,
}

/// Operations the guest needs from the OCI runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates the container init process from a bundle. The process is
    /// created but not yet running its entrypoint.
    async fn create(&self, id: &str, bundle: &Path, io: IoRequest) -> Result<RuntimeProcess>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Spawns an exec process inside a running container from an OCI
    /// process document.
    async fn exec(
        &self,
        id: &str,
        exec_id: &str,
        process: &serde_json::Value,
        io: IoRequest,
    ) -> Result<RuntimeProcess>;

    /// Delivers a signal to the init process or, with `all`, to every
    /// process in the container.
    async fn kill(&self, id: &str, signal: u32, all: bool) -> Result<()>;

    /// Deletes the container's runtime state.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;

    /// Resizes the process terminal.
    async fn resize_pty(&self, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()>;
}

// =============================================================================
// CommandRuntime
// =============================================================================

/// How long to wait for the runtime to write the pid file after create.
const PID_FILE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval for the pid file.
const PID_FILE_POLL: Duration = Duration::from_millis(20);

/// Drives an OCI runtime binary (`crun` by default) through its CLI.
pub struct CommandRuntime {
    binary: PathBuf,
    /// Runtime state root (`--root`), kept under /run inside the guest.
    root: PathBuf,
    /// Scratch directory for pid files and exec process documents.
    work_dir: PathBuf,
}

impl CommandRuntime {
    /// Creates a runtime adapter around the given binary.
    #[must_use]
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            root: root.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Locates an OCI runtime binary on the guest: `crun`, then `runc`,
    /// then `youki`.
    pub fn discover(root: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        for name in ["crun", "runc", "youki"] {
            if let Ok(path_env) = std::env::var("PATH") {
                for dir in std::env::split_paths(&path_env) {
                    let candidate = dir.join(name);
                    if candidate.is_file() {
                        return Ok(Self::new(candidate, root, work_dir));
                    }
                }
            }
        }
        Err(Error::RuntimeFailed {
            operation: "discover".into(),
            id: String::new(),
            reason: "no OCI runtime (crun, runc, youki) found in PATH".into(),
        })
    }

    fn base_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("--root").arg(&self.root);
        cmd
    }

    fn pid_file(&self, id: &str, exec_id: &str) -> PathBuf {
        if exec_id.is_empty() {
            self.work_dir.join(format!("{id}.pid"))
        } else {
            self.work_dir.join(format!("{id}-{exec_id}.pid"))
        }
    }

    /// Spawns a foreground runtime command with the requested stdio wiring
    /// and packages the result as a [`RuntimeProcess`].
    async fn spawn_foreground(
        &self,
        mut cmd: tokio::process::Command,
        id: &str,
        exec_id: &str,
        io: IoRequest,
        operation: &'static str,
    ) -> Result<RuntimeProcess> {
        cmd.stdin(if io.stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        cmd.stdout(Stdio::piped());
        cmd.stderr(if io.terminal {
            // Terminal mode merges everything onto the pty, surfaced as
            // the stdout stream.
            Stdio::null()
        } else {
            Stdio::piped()
        });
        cmd.kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| Error::RuntimeFailed {
            operation: operation.into(),
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let stdin = child
            .stdin
            .take()
            .map(|s| Box::new(s) as StdinSink);
        let stdout = child
            .stdout
            .take()
            .map(|s| Box::new(s) as OutputSource);
        let stderr = child
            .stderr
            .take()
            .map(|s| Box::new(s) as OutputSource);

        let pid = self.await_pid_file(id, exec_id).await?;

        let (exit_tx, exit_rx) = oneshot::channel();
        let waited_id = id.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    let _ = exit_tx.send(exit_status_code(status));
                }
                Err(err) => {
                    // The PID-1 reaper beat us to the status; it reports
                    // the exit through the task service instead.
                    warn!(container = %waited_id, error = %err, "runtime wait lost to reaper");
                    drop(exit_tx);
                }
            }
        });

        Ok(RuntimeProcess {
            pid,
            stdin,
            stdout,
            stderr,
            exit: exit_rx,
        })
    }

    /// Polls for the pid file the runtime writes once the process exists.
    async fn await_pid_file(&self, id: &str, exec_id: &str) -> Result<i32> {
        let path = self.pid_file(id, exec_id);
        let deadline = tokio::time::Instant::now() + PID_FILE_TIMEOUT;
        loop {
            match tokio::fs::read_to_string(&path).await {
                Ok(contents) => {
                    let pid = contents.trim().parse::<i32>().map_err(|e| {
                        Error::RuntimeFailed {
                            operation: "read pid file".into(),
                            id: id.to_string(),
                            reason: format!("malformed pid file {path:?}: {e}"),
                        }
                    })?;
                    return Ok(pid);
                }
                Err(_) if tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(PID_FILE_POLL).await;
                }
                Err(err) => {
                    return Err(Error::RuntimeFailed {
                        operation: "read pid file".into(),
                        id: id.to_string(),
                        reason: format!("pid file {path:?} not written: {err}"),
                    });
                }
            }
        }
    }

    async fn run_unary(&self, mut cmd: tokio::process::Command, operation: &'static str, id: &str) -> Result<()> {
        let output = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::RuntimeFailed {
                operation: operation.into(),
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(Error::RuntimeFailed {
                operation: operation.into(),
                id: id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

/// Maps an exit status to the conventional code, 128+signal for deaths by
/// signal.
fn exit_status_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(1),
    }
}

#[async_trait]
impl ContainerRuntime for CommandRuntime {
    async fn create(&self, id: &str, bundle: &Path, io: IoRequest) -> Result<RuntimeProcess> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let pid_file = self.pid_file(id, "");
        let _ = tokio::fs::remove_file(&pid_file).await;

        let mut cmd = self.base_command();
        cmd.arg("create")
            .arg("--bundle")
            .arg(bundle)
            .arg("--pid-file")
            .arg(&pid_file)
            .arg(id);

        debug!(container = %id, bundle = %bundle.display(), "runtime create");
        self.spawn_foreground(cmd, id, "", io, "create").await
    }

    async fn start(&self, id: &str) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("start").arg(id);
        debug!(container = %id, "runtime start");
        self.run_unary(cmd, "start", id).await
    }

    async fn exec(
        &self,
        id: &str,
        exec_id: &str,
        process: &serde_json::Value,
        io: IoRequest,
    ) -> Result<RuntimeProcess> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        let process_file = self.work_dir.join(format!("{id}-{exec_id}-process.json"));
        let mut f = tokio::fs::File::create(&process_file).await?;
        f.write_all(&serde_json::to_vec(process)?).await?;
        f.flush().await?;

        let pid_file = self.pid_file(id, exec_id);
        let _ = tokio::fs::remove_file(&pid_file).await;

        let mut cmd = self.base_command();
        cmd.arg("exec")
            .arg("--process")
            .arg(&process_file)
            .arg("--pid-file")
            .arg(&pid_file)
            .arg(id);

        debug!(container = %id, exec = %exec_id, "runtime exec");
        self.spawn_foreground(cmd, id, exec_id, io, "exec").await
    }

    async fn kill(&self, id: &str, signal: u32, all: bool) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("kill");
        if all {
            cmd.arg("--all");
        }
        cmd.arg(id).arg(signal.to_string());
        debug!(container = %id, signal, all, "runtime kill");
        self.run_unary(cmd, "kill", id).await
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut cmd = self.base_command();
        cmd.arg("delete");
        if force {
            cmd.arg("--force");
        }
        cmd.arg(id);
        debug!(container = %id, force, "runtime delete");
        self.run_unary(cmd, "delete", id).await
    }

    async fn resize_pty(&self, id: &str, exec_id: &str, width: u32, height: u32) -> Result<()> {
        // Foreground mode leaves the pty with the runtime process; the
        // window size follows the runtime's own terminal. Recorded for
        // observability rather than silently swallowed.
        debug!(
            container = %id,
            exec = %exec_id,
            width,
            height,
            "resize_pty delegated to foreground runtime"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_codes() {
        use std::os::unix::process::ExitStatusExt;
        let normal = std::process::ExitStatus::from_raw(0x0100); // exit(1)
        assert_eq!(exit_status_code(normal), 1);
        let signalled = std::process::ExitStatus::from_raw(0x0009); // SIGKILL
        assert_eq!(exit_status_code(signalled), 137);
    }

    #[test]
    fn pid_file_paths_distinguish_execs() {
        let rt = CommandRuntime::new("/usr/bin/crun", "/run/kvmbox", "/run/kvmbox/work");
        assert_ne!(rt.pid_file("c1", ""), rt.pid_file("c1", "e1"));
        assert!(rt.pid_file("c1", "e1").to_string_lossy().contains("c1-e1"));
    }
}
