//! Process supervisor for instance backing processes.
//!
//! Backing processes are started detached: the agent keeps only the pid and
//! never waits on the child. Dropping the tokio `Child` hands reaping to the
//! runtime, so exited children do not linger as zombies while the agent runs.
//!
//! Before exec, every inherited descriptor above the standard streams is
//! marked close-on-exec, so the agent's sockets and log files never leak into
//! a long-running daemon.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Poll interval while waiting for a signalled process to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Upper bound on the descriptor sweep when `close_range` is unavailable.
const MAX_SWEEP_FD: i32 = 65536;

/// `CLOSE_RANGE_CLOEXEC` from `<linux/close_range.h>` (Linux 5.11+).
#[cfg(target_os = "linux")]
const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Everything needed to (re)start an instance's backing process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{0} exited before its pid could be read")]
    NoPid(String),

    #[error("failed to prepare working directory {}: {source}", path.display())]
    Workdir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to signal pid {pid}: {source}")]
    Signal { pid: u32, source: Errno },

    #[error("invalid pid {0}")]
    InvalidPid(u32),
}

/// A process started by the supervisor that nobody waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetachedProcess {
    pid: u32,
}

impl DetachedProcess {
    /// Wrap a pid recorded earlier, e.g. from the instance store.
    pub fn from_pid(pid: u32) -> Self {
        Self { pid }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// OS-level existence probe. Says nothing about whether the process is
    /// responsive.
    pub fn is_alive(&self) -> bool {
        let Ok(pid) = self.nix_pid() else {
            return false;
        };
        match kill(pid, None::<Signal>) {
            Ok(()) => !is_zombie(self.pid),
            // Exists but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// Send SIGTERM, wait up to `grace` for the process to go away, then
    /// SIGKILL. Returns `false` if the process was already gone.
    pub async fn stop(&self, grace: Duration) -> Result<bool, ProcessError> {
        if !self.is_alive() {
            return Ok(false);
        }
        let pid = self.nix_pid()?;

        match kill(pid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(source) => {
                return Err(ProcessError::Signal {
                    pid: self.pid,
                    source,
                })
            }
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_alive() {
                debug!(pid = self.pid, "Process exited after SIGTERM");
                return Ok(true);
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        if self.is_alive() {
            warn!(pid = self.pid, grace_ms = grace.as_millis() as u64, "Process ignored SIGTERM, killing");
            match kill(pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(source) => {
                    return Err(ProcessError::Signal {
                        pid: self.pid,
                        source,
                    })
                }
            }
        }
        Ok(true)
    }

    /// SIGKILL without waiting.
    pub fn kill(&self) -> Result<(), ProcessError> {
        match kill(self.nix_pid()?, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(ProcessError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }

    fn nix_pid(&self) -> Result<Pid, ProcessError> {
        match i32::try_from(self.pid) {
            Ok(raw) if raw > 0 => Ok(Pid::from_raw(raw)),
            _ => Err(ProcessError::InvalidPid(self.pid)),
        }
    }
}

/// Starts, probes and stops backing processes.
#[derive(Debug, Clone)]
pub struct ProcessSupervisor {
    stop_grace: Duration,
}

impl ProcessSupervisor {
    /// Create a new supervisor.
    pub fn new(stop_grace: Duration) -> Self {
        Self { stop_grace }
    }

    /// Spawn a detached process. Must run inside a Tokio runtime.
    pub fn start(&self, spec: &LaunchSpec) -> Result<DetachedProcess, ProcessError> {
        if let Some(dir) = &spec.workdir {
            std::fs::create_dir_all(dir).map_err(|source| ProcessError::Workdir {
                path: dir.clone(),
                source,
            })?;
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Keep terminal signals aimed at the agent away from instances.
            .process_group(0);
        if let Some(dir) = &spec.workdir {
            cmd.current_dir(dir);
        }

        unsafe {
            cmd.pre_exec(|| {
                mark_inherited_fds_cloexec();
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::NoPid(spec.program.clone()))?;
        // Detach: the runtime reaps the child once it exits.
        drop(child);

        info!(pid, program = %spec.program, args = ?spec.args, "Started backing process");
        Ok(DetachedProcess::from_pid(pid))
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        DetachedProcess::from_pid(pid).is_alive()
    }

    /// Stop a process (if alive) and remove its working directory (if any).
    pub async fn stop(&self, pid: Option<u32>, workdir: Option<&Path>) -> Result<(), ProcessError> {
        if let Some(pid) = pid {
            let was_alive = DetachedProcess::from_pid(pid).stop(self.stop_grace).await?;
            if was_alive {
                info!(pid, "Stopped backing process");
            } else {
                debug!(pid, "Backing process already gone");
            }
        }

        if let Some(dir) = workdir {
            remove_workdir(dir);
        }
        Ok(())
    }
}

/// Remove an instance working directory, best effort.
pub fn remove_workdir(dir: &Path) {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => debug!(path = %dir.display(), "Removed working directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove working directory"),
    }
}

/// Mark every descriptor above the standard streams close-on-exec.
///
/// Runs in the forked child, so it sees exactly the descriptors exec would
/// inherit. Only async-signal-safe calls are allowed here.
fn mark_inherited_fds_cloexec() {
    #[cfg(target_os = "linux")]
    {
        // SAFETY: close_range only changes descriptor flags.
        let rc = unsafe {
            libc::syscall(libc::SYS_close_range, 3u32, u32::MAX, CLOSE_RANGE_CLOEXEC)
        };
        if rc == 0 {
            return;
        }
    }

    for fd in 3..descriptor_ceiling() {
        // EBADF for closed slots is expected.
        unsafe {
            libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
        }
    }
}

/// Soft `RLIMIT_NOFILE`, capped at [`MAX_SWEEP_FD`]. No descriptor can be
/// numbered at or above the soft limit.
fn descriptor_ceiling() -> i32 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0
        || limit.rlim_cur == libc::RLIM_INFINITY
    {
        return MAX_SWEEP_FD;
    }
    limit.rlim_cur.min(MAX_SWEEP_FD as libc::rlim_t) as i32
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Format: "pid (comm) state ..."; comm may contain spaces or parens.
    stat.rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next())
        .map(|state| state == 'Z' || state == 'X')
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}
