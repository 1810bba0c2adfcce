//! Restart-with-backoff supervision of long-running sync tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Result, SyncError};

/// Exponential delay in whole seconds: 1, 2, 4, ... up to a ceiling.
#[derive(Debug, Clone)]
pub struct SyncBackoff {
    cur_wait_secs: u64,
    max_wait_secs: u64,
}

impl SyncBackoff {
    /// Creates a backoff capped at `max`.
    pub fn new(max: Duration) -> Self {
        Self {
            cur_wait_secs: 0,
            max_wait_secs: max.as_secs().max(1),
        }
    }

    /// Drops the delay back to zero.
    pub fn reset(&mut self) {
        self.cur_wait_secs = 0;
    }

    /// Delay before the next attempt. A reset round waits nothing.
    pub fn next_delay(&mut self, reset: bool) -> Duration {
        if reset {
            self.reset();
            return Duration::ZERO;
        }
        self.cur_wait_secs = if self.cur_wait_secs == 0 {
            1
        } else {
            (self.cur_wait_secs * 2).min(self.max_wait_secs)
        };
        Duration::from_secs(self.cur_wait_secs)
    }

    /// Current delay without advancing.
    pub fn current(&self) -> Duration {
        Duration::from_secs(self.cur_wait_secs)
    }
}

/// Progress signal a supervised task raises to reset the backoff.
#[derive(Debug, Clone, Default)]
pub struct BackoffReset(Arc<AtomicBool>);

impl BackoffReset {
    /// Creates an unsignaled flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks that progress was made this round.
    pub fn signal(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Reads and clears the flag.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// A task the [`BackoffSupervisor`] restarts.
#[async_trait]
pub trait Supervised: Send {
    /// Name used in logs.
    fn name(&self) -> String;

    /// One full run of the task, starting from persisted state.
    async fn run_once(&mut self, reset: &BackoffReset) -> Result<()>;

    /// Runs after the backoff delay and before the next `run_once`.
    async fn finish_round(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Runs a [`Supervised`] task until it fails fatally or is cancelled.
pub struct BackoffSupervisor {
    backoff: SyncBackoff,
    reset: BackoffReset,
    cancel: CancellationToken,
}

impl BackoffSupervisor {
    /// Creates a supervisor with the given backoff ceiling.
    pub fn new(max_backoff: Duration, cancel: CancellationToken) -> Self {
        Self {
            backoff: SyncBackoff::new(max_backoff),
            reset: BackoffReset::new(),
            cancel,
        }
    }

    /// The reset flag handed to the task.
    pub fn reset_handle(&self) -> BackoffReset {
        self.reset.clone()
    }

    /// Restarts `task` until cancellation or a non-recoverable error.
    ///
    /// Success and recoverable errors restart the task after the backoff
    /// delay. Cancellation ends the loop with `Ok`.
    pub async fn run<S: Supervised + ?Sized>(&mut self, task: &mut S) -> Result<()> {
        let name = task.name();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }

            let result = task.run_once(&self.reset).await;
            self.check(&name, result)?;

            let delay = self.backoff.next_delay(self.reset.take());
            debug!(task = %name, delay_secs = delay.as_secs(), "backing off");
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }

            let result = task.finish_round().await;
            self.check(&name, result)?;
        }
    }

    fn check(&self, name: &str, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(SyncError::Shutdown) if self.cancel.is_cancelled() => Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(task = %name, error = %e, "task failed, will retry");
                Ok(())
            }
            Err(e) => {
                error!(task = %name, error = %e, "task failed permanently");
                Err(e)
            }
        }
    }
}
