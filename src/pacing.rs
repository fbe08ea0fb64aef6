// ABOUTME: Fixed-interval request gate used by the pagination driver
// ABOUTME: Delays callers so consecutive requests are at least one interval apart

use std::time::Duration;

use tokio::time::{sleep_until, Instant};

/// Default minimum spacing between two API requests.
pub const DEFAULT_REQUEST_INTERVAL: Duration = Duration::from_secs(2);

/// Admits at most one request per interval.
///
/// The gate never drops a request: `wait` suspends until the caller may proceed.
/// It runs on the tokio clock, so a paused runtime advances it virtually.
#[derive(Debug)]
pub struct Pacer {
    interval: Duration,
    last_request: Option<Instant>,
}

impl Pacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_request: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Suspend until the next request slot, then claim it.
    ///
    /// Returns how long the caller was held back.
    pub async fn wait(&mut self) -> Duration {
        let now = Instant::now();
        let delayed = match self.last_request {
            Some(last) => {
                let ready_at = last + self.interval;
                if ready_at > now {
                    sleep_until(ready_at).await;
                    ready_at - now
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        };
        self.last_request = Some(Instant::now());
        delayed
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_INTERVAL)
    }
}
