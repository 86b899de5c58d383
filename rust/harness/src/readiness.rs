//! Bounded polling for artifacts written by processes we don't control.
//!
//! The scheduler announces itself by writing a file; there is no other
//! channel to learn that it accepts connections. [`PollPolicy`] turns that
//! into a bounded wait that reports how long it took.

use std::{path::Path, time::Duration};

use tokio::time::Instant;

/// How often to check a condition and for how long to keep trying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

/// Outcome of a bounded wait. Timing out is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready { elapsed: Duration },
    TimedOut { elapsed: Duration },
}

impl Readiness {
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    #[must_use]
    pub fn elapsed(self) -> Duration {
        match self {
            Self::Ready { elapsed } | Self::TimedOut { elapsed } => elapsed,
        }
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            timeout: Duration::from_secs(160),
        }
    }
}

impl PollPolicy {
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Check `ready` until it returns true or the timeout is spent.
    ///
    /// The condition is checked once up front and once after every sleep.
    /// The last sleep is shortened so the final check lands on the deadline;
    /// nothing is checked after that.
    pub async fn poll_until<F>(&self, label: &str, mut ready: F) -> Readiness
    where
        F: FnMut() -> bool,
    {
        let start = Instant::now();

        loop {
            if ready() {
                return Readiness::Ready {
                    elapsed: start.elapsed(),
                };
            }

            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Readiness::TimedOut { elapsed };
            }

            tracing::debug!("Still waiting for {label} ({:.0?} elapsed)", elapsed);
            tokio::time::sleep(self.interval.min(self.timeout - elapsed)).await;
        }
    }

    /// Wait for `path` to exist.
    pub async fn await_path(&self, path: &Path) -> Readiness {
        tracing::info!(
            "Waiting up to {}s for {}",
            self.timeout.as_secs(),
            path.display()
        );

        let label = path.display().to_string();
        let outcome = self.poll_until(&label, || path.exists()).await;

        match outcome {
            Readiness::Ready { elapsed } => {
                tracing::info!("Found {} after {:.1}s", path.display(), elapsed.as_secs_f64());
            }
            Readiness::TimedOut { elapsed } => {
                tracing::warn!(
                    "{} not found after {:.1}s",
                    path.display(),
                    elapsed.as_secs_f64()
                );
            }
        }

        outcome
    }
}

/// Returns true if `artifact` shows up within `timeout`, checking every
/// `poll_interval`.
pub async fn await_ready(artifact: &Path, timeout: Duration, poll_interval: Duration) -> bool {
    PollPolicy::new(poll_interval, timeout)
        .await_path(artifact)
        .await
        .is_ready()
}
