//! Per-bucket request budgets against the shared upstream rate limit.
//!
//! Each logical rate class (basic bars, chip distribution, dividends, ...)
//! gets one named bucket. A bucket tracks the grant timestamps of the last
//! minute; `acquire` blocks until issuing `n` more grants keeps the sliding
//! one-minute total within the configured budget. Waiters are served FIFO:
//! the bucket's async mutex is held for the whole wait, so later callers
//! queue behind earlier ones and none can starve.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    rate_per_min: u32,
    /// FIFO waiter queue; held across the wait.
    turn: AsyncMutex<()>,
    grants: parking_lot::Mutex<VecDeque<Instant>>,
}

impl Bucket {
    fn new(rate_per_min: u32) -> Self {
        Self {
            rate_per_min,
            turn: AsyncMutex::new(()),
            grants: parking_lot::Mutex::new(VecDeque::new()),
        }
    }

    /// If the window has room for `n` more grants, record them and return
    /// None; otherwise return the instant at which room opens up.
    fn try_grant(&self, n: u32) -> Option<Instant> {
        let mut grants = self.grants.lock();
        let now = Instant::now();
        while let Some(front) = grants.front() {
            if now.duration_since(*front) >= WINDOW {
                grants.pop_front();
            } else {
                break;
            }
        }
        if grants.len() as u32 + n <= self.rate_per_min {
            for _ in 0..n {
                grants.push_back(now);
            }
            return None;
        }
        // Room opens when the blocking grant ages out of the window.
        let blocking = (grants.len() as u32 + n - self.rate_per_min - 1) as usize;
        Some(grants[blocking] + WINDOW)
    }

    async fn acquire(&self, n: u32) {
        let _turn = self.turn.lock().await;
        loop {
            match self.try_grant(n) {
                None => return,
                Some(ready_at) => tokio::time::sleep_until(ready_at).await,
            }
        }
    }

    fn try_acquire(&self, n: u32) -> bool {
        // Respect the FIFO queue: never jump ahead of a blocked waiter.
        let Ok(_turn) = self.turn.try_lock() else {
            return false;
        };
        self.try_grant(n).is_none()
    }
}

/// The set of named token buckets, shared by every fetcher in the process.
pub struct RateBuckets {
    buckets: HashMap<String, Arc<Bucket>>,
}

impl RateBuckets {
    /// Build from `(bucket name, tokens/minute)` pairs. Requests for a
    /// bucket that was never declared pass through unthrottled.
    pub fn new(rates: impl IntoIterator<Item = (String, u32)>) -> Self {
        let buckets = rates
            .into_iter()
            .map(|(name, rate)| (name, Arc::new(Bucket::new(rate.max(1)))))
            .collect();
        Self { buckets }
    }

    /// Block until `n` tokens are available in `bucket`.
    pub async fn acquire(&self, bucket: &str, n: u32) {
        if let Some(b) = self.buckets.get(bucket) {
            b.acquire(n).await;
        }
    }

    /// Non-blocking variant; true when the tokens were granted.
    pub fn try_acquire(&self, bucket: &str, n: u32) -> bool {
        match self.buckets.get(bucket) {
            Some(b) => b.try_acquire(n),
            None => true,
        }
    }

    pub fn rate_of(&self, bucket: &str) -> Option<u32> {
        self.buckets.get(bucket).map(|b| b.rate_per_min)
    }
}
