use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use agora_types::UserId;

use crate::error::{HubError, HubResult};

/// Per-user sliding window: at most `limit` accepted sends in any `window`.
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    buckets: Mutex<HashMap<UserId, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn check(&self, user_id: UserId) -> HubResult<Instant> {
        self.check_at(user_id, Instant::now()).await
    }

    /// Record an attempt at `now` and return its stamp for [`refund`].
    /// Rejected attempts do not count.
    ///
    /// [`refund`]: RateLimiter::refund
    pub async fn check_at(&self, user_id: UserId, now: Instant) -> HubResult<Instant> {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(user_id).or_default();

        while let Some(&oldest) = bucket.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }

        if bucket.len() >= self.limit {
            let retry_after = bucket
                .front()
                .map(|&oldest| self.window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(self.window);
            return Err(HubError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        bucket.push_back(now);
        Ok(now)
    }

    /// Give back an accepted attempt that was later refused for another
    /// reason. Returns false if the stamp already left the window.
    pub async fn refund(&self, user_id: UserId, stamp: Instant) -> bool {
        let mut buckets = self.buckets.lock().await;
        let Some(bucket) = buckets.get_mut(&user_id) else {
            return false;
        };
        match bucket.iter().rposition(|&at| at == stamp) {
            Some(index) => {
                bucket.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop buckets with no attempt inside the window. Returns how many went.
    pub async fn prune(&self, now: Instant) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < self.window)
        });
        before - buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_slides() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let t0 = Instant::now();

        for i in 0..3 {
            limiter.check_at(1, t0 + Duration::from_secs(i)).await.unwrap();
        }
        let err = limiter.check_at(1, t0 + Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, HubError::RateLimited { retry_after_ms: 5000 }));

        // Other users have their own budget.
        limiter.check_at(2, t0 + Duration::from_secs(5)).await.unwrap();

        // The first attempt leaves the window at t0 + 10s.
        limiter.check_at(1, t0 + Duration::from_secs(10)).await.unwrap();
        assert!(limiter.check_at(1, t0 + Duration::from_secs(10)).await.is_err());
    }

    #[tokio::test]
    async fn refund_frees_the_slot() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        let t0 = Instant::now();

        let stamp = limiter.check_at(1, t0).await.unwrap();
        assert!(limiter.check_at(1, t0 + Duration::from_secs(1)).await.is_err());
        assert!(limiter.refund(1, stamp).await);
        assert!(!limiter.refund(1, stamp).await);
        limiter.check_at(1, t0 + Duration::from_secs(2)).await.unwrap();
        assert!(!limiter.refund(2, stamp).await);
    }

    #[tokio::test]
    async fn prune_forgets_quiet_users() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let t0 = Instant::now();
        limiter.check_at(1, t0).await.unwrap();
        limiter.check_at(2, t0 + Duration::from_millis(900)).await.unwrap();

        assert_eq!(limiter.prune(t0 + Duration::from_millis(1500)).await, 1);
        assert_eq!(limiter.prune(t0 + Duration::from_secs(5)).await, 1);
    }
}
