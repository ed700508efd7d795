use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub retry_after_secs: u64,
}

impl RateDecision {
    fn allow() -> Self {
        Self { allowed: true, retry_after_secs: 0 }
    }

    fn deny(retry_after_secs: u64) -> Self {
        Self { allowed: false, retry_after_secs }
    }
}

/// Per-key sliding-window limiter. Keeps only the timestamps inside the
/// window, so memory stays proportional to the allowed request count.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    buckets: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests: max_requests.max(1) as usize,
            window: Duration::from_secs(window_secs.max(1)),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut buckets = match self.buckets.lock() {
            Ok(buckets) => buckets,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets.entry(key.to_string()).or_default();

        while let Some(front) = bucket.front() {
            if now.duration_since(*front) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.max_requests {
            let oldest = *bucket.front().expect("bucket at capacity has a front");
            let retry_after = self.window.saturating_sub(now.duration_since(oldest));
            return RateDecision::deny(retry_after.as_secs().max(1));
        }

        bucket.push_back(now);
        RateDecision::allow()
    }
}
