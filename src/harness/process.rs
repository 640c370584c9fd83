use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use anyhow::{ensure, Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};

/// Launches and signals the worker process of a single instance.
pub struct ProcessRunner {
    binary: PathBuf,
    /// The pid of the running process, or 0 when no process is running.
    pid: AtomicI32,
}

impl ProcessRunner {
    /// Create a new instance.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            pid: AtomicI32::new(0),
        }
    }

    /// Spawn the worker process with the given arguments and environment.
    ///
    /// The returned child is killed if dropped before it exits.
    pub fn start<I, S, E, K, V>(&self, args: I, envs: E) -> Result<Child>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
        E: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        ensure!(!self.is_running(), "process {} is already running", self.binary.display());
        let child = Command::new(&self.binary)
            .args(args)
            .envs(envs)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("error spawning process {}", self.binary.display()))?;
        let pid = child.id().context("spawned process exited before its pid was observed")?;
        self.pid.store(pid as i32, Ordering::SeqCst);
        Ok(child)
    }

    /// Check if the process is running.
    pub fn is_running(&self) -> bool {
        self.pid.load(Ordering::SeqCst) != 0
    }

    /// Deliver the given signal to the running process.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        ensure!(pid != 0, "process {} is not running", self.binary.display());
        kill(Pid::from_raw(pid), signal).with_context(|| format!("error sending {:?} to process {}", signal, pid))
    }

    /// Record that the process has exited.
    pub fn exited(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }
}
