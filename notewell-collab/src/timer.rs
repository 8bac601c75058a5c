//! Cancellable one-shot timers.
//!
//! Debounce and expiry behavior in the session is expressed through
//! [`ResettableTimer`]: arming replaces (and aborts) whatever was previously
//! scheduled, and dropping the timer cancels it. The session owns its timers
//! and disposes of them together with the rest of its state, so no timer can
//! outlive the session that armed it.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};

/// A one-shot timer whose pending task is replaced on re-arm and aborted on
/// cancel/drop.
#[derive(Debug, Default)]
pub struct ResettableTimer {
    handle: Option<JoinHandle<()>>,
}

impl ResettableTimer {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Run `task` after `delay`, cancelling any previously armed task.
    pub fn arm<F>(&mut self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            sleep(delay).await;
            task.await;
        }));
    }

    /// Run `task` at `deadline`, cancelling any previously armed task.
    pub fn arm_at<F>(&mut self, deadline: Instant, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.handle = Some(tokio::spawn(async move {
            sleep_until(deadline).await;
            task.await;
        }));
    }

    /// Abort the pending task, if any. Safe to call repeatedly.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ResettableTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
