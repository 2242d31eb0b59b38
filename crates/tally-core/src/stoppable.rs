//! Cooperative cancellation for long-running workers.
//!
//! A [`StoppableTask`] moves Running → StopRequested once [`StoppableTask::stop`]
//! is called, and is Stopped once its owner observes the request and returns.
//! Every blocking wait in the pipeline goes through
//! [`StoppableTask::interruptible_sleep`], so a stop request is noticed within
//! one sleep increment.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default slice for interruptible sleeps.
pub const DEFAULT_SLEEP_INCREMENT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default)]
pub struct StoppableTask {
    token: CancellationToken,
}

impl StoppableTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// A task that is stopped whenever `self` is, but can also stop on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    /// Request a stop. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Completes once a stop has been requested.
    pub async fn wait_stopped(&self) {
        self.token.cancelled().await;
    }

    /// Sleep for `duration` in `increment`-sized slices, bailing out as soon as
    /// a stop is observed.
    ///
    /// Returns `true` if the whole duration elapsed, `false` if interrupted.
    pub async fn interruptible_sleep(&self, duration: Duration, increment: Duration) -> bool {
        if self.stopped() {
            return false;
        }
        if duration.is_zero() {
            return true;
        }

        let increment = if increment.is_zero() {
            DEFAULT_SLEEP_INCREMENT
        } else {
            increment
        };
        let deadline = Instant::now() + duration;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            let snooze = increment.min(deadline - now);

            tokio::select! {
                () = tokio::time::sleep(snooze) => {}
                () = self.token.cancelled() => return false,
            }

            if self.stopped() {
                return false;
            }
        }
    }
}
