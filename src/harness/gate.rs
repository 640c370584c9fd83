use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use tokio::sync::oneshot;

/// A single-use notification which releases an instance into its next lifecycle phase.
///
/// The lifecycle loop of the instance is the only consumer. It arms the gate once per phase and
/// awaits the returned receiver; each armed phase can be released exactly once, and releasing
/// a gate which is not armed is an error instead of a queued signal.
#[derive(Default)]
pub struct PhaseGate {
    armed: Mutex<Option<oneshot::Sender<()>>>,
}

impl PhaseGate {
    /// Arm the gate for the next phase, replacing any previously armed phase.
    pub fn arm(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.lock() = Some(tx);
        rx
    }

    /// Release the armed phase.
    pub fn proceed(&self) -> Result<()> {
        let tx = self.lock().take().context("instance is not waiting to proceed")?;
        tx.send(()).map_err(|_| anyhow!("instance stopped waiting to proceed"))
    }

    fn lock(&self) -> MutexGuard<'_, Option<oneshot::Sender<()>>> {
        self.armed.lock().unwrap_or_else(|err| err.into_inner())
    }
}
