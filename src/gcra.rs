//! Single-TAT rate pacing for one engine's upstream dispatches.
//!
//! Each batch counts as one dispatch regardless of how many client
//! requests it merges — the entire reason batching exists is to keep the
//! TAT advancing at the configured interval instead of per client request.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub request_qty: u32,
    pub request_duration: Duration,
}

impl RateLimit {
    pub fn unlimited() -> Self {
        Self {
            request_qty: 0,
            request_duration: Duration::ZERO,
        }
    }

    fn interval(&self) -> Duration {
        self.request_duration / self.request_qty.max(1)
    }
}

/// Theoretical-arrival-time state for one engine.
pub struct Gcra {
    tat: Instant,
    limit: RateLimit,
}

impl Gcra {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            tat: Instant::now(),
            limit,
        }
    }

    /// Sleeps until the next dispatch is permitted, then advances the TAT.
    /// A `request_qty` of zero disables pacing entirely.
    pub async fn pace(&mut self) {
        if self.limit.request_qty == 0 {
            return;
        }
        let now = Instant::now();
        if self.tat > now {
            tokio::time::sleep(self.tat - now).await;
        }
        let now = Instant::now();
        self.tat = self.tat.max(now) + self.limit.interval();
    }
}
