use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use shared::domain::Jid;
use tokio::time::Instant;

pub const DEFAULT_MIN_SEND_INTERVAL: Duration = Duration::from_millis(50);

/// Minimum spacing between two successful sends to the same recipient.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_sent: Mutex<HashMap<Jid, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn wait_time(&self, recipient: &Jid, now: Instant) -> Duration {
        let last_sent = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        match last_sent.get(recipient) {
            Some(last) => self
                .min_interval
                .saturating_sub(now.saturating_duration_since(*last)),
            None => Duration::ZERO,
        }
    }

    pub fn record(&self, recipient: &Jid, at: Instant) {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(recipient.clone(), at);
    }

    pub fn last_sent(&self, recipient: &Jid) -> Option<Instant> {
        self.last_sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(recipient)
            .copied()
    }

    pub async fn wait_turn(&self, recipient: &Jid) {
        let wait = self.wait_time(recipient, Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/rate_limiter_tests.rs"]
mod tests;
