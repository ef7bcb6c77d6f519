//! Per-owner sliding-window limits on upload count and volume.

use crate::errors::{UploadError, UploadResult};
use dashmap::DashMap;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
    pub max_bytes: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3600),
            max_requests: 50,
            max_bytes: 10_000_000_000,
        }
    }
}

/// Checks between sweeps of idle owners.
const SWEEP_EVERY: u64 = 256;

/// In-memory limiter shared by every request.
///
/// Each owner's window is checked and updated while holding that owner's
/// map entry, so concurrent requests for one owner never see a torn count.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, VecDeque<(Instant, u64)>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    /// Admit an upload of `bytes` for `owner`, or say how long to wait.
    pub fn check_and_record(&self, owner: &str, bytes: u64) -> UploadResult<()> {
        self.check_and_record_at(owner, bytes, Instant::now())
    }

    pub(crate) fn check_and_record_at(&self, owner: &str, bytes: u64, now: Instant) -> UploadResult<()> {
        let window = self.config.window;
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep_at(now);
        }
        let mut entries = self.windows.entry(owner.to_string()).or_default();
        prune(&mut entries, window, now);

        let used_requests = entries.len() as u64;
        let used_bytes: u64 = entries.iter().map(|(_, b)| *b).sum();
        if used_requests + 1 > u64::from(self.config.max_requests)
            || used_bytes.saturating_add(bytes) > self.config.max_bytes
        {
            let retry_after = entries
                .front()
                .map(|(at, _)| window.saturating_sub(now.duration_since(*at)))
                .unwrap_or(window);
            warn!(
                "rate limit hit for {}: {} uploads / {} bytes in window",
                owner, used_requests, used_bytes
            );
            let idle = entries.is_empty();
            drop(entries);
            if idle {
                self.windows.remove_if(owner, |_, q| q.is_empty());
            }
            return Err(UploadError::RateLimited { retry_after });
        }

        entries.push_back((now, bytes));
        Ok(())
    }

    /// Drop owners with nothing left inside the window.
    pub(crate) fn sweep_at(&self, now: Instant) {
        let window = self.config.window;
        self.windows.retain(|_, entries| {
            prune(entries, window, now);
            !entries.is_empty()
        });
    }

    #[cfg(test)]
    pub(crate) fn tracked_owners(&self) -> usize {
        self.windows.len()
    }
}

fn prune(entries: &mut VecDeque<(Instant, u64)>, window: Duration, now: Instant) {
    while let Some(&(at, _)) = entries.front() {
        if now.duration_since(at) >= window {
            entries.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, max_bytes: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests,
            max_bytes,
        })
    }

    #[test]
    fn request_count_is_limited_per_owner() {
        let limiter = limiter(2, u64::MAX);
        let now = Instant::now();
        assert!(limiter.check_and_record_at("a", 1, now).is_ok());
        assert!(limiter.check_and_record_at("a", 1, now).is_ok());
        assert!(matches!(
            limiter.check_and_record_at("a", 1, now),
            Err(UploadError::RateLimited { .. })
        ));
        assert!(limiter.check_and_record_at("b", 1, now).is_ok());
    }

    #[test]
    fn window_slides() {
        let limiter = limiter(1, u64::MAX);
        let start = Instant::now();
        limiter.check_and_record_at("a", 1, start).unwrap();

        let err = limiter
            .check_and_record_at("a", 1, start + Duration::from_secs(20))
            .unwrap_err();
        match err {
            UploadError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(40))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        assert!(limiter
            .check_and_record_at("a", 1, start + Duration::from_secs(61))
            .is_ok());
    }

    #[test]
    fn byte_volume_is_limited() {
        let limiter = limiter(100, 1_000);
        let now = Instant::now();
        limiter.check_and_record_at("a", 600, now).unwrap();
        assert!(limiter.check_and_record_at("a", 500, now).is_err());
        assert!(limiter.check_and_record_at("a", 400, now).is_ok());
    }

    #[test]
    fn idle_owners_are_forgotten() {
        let limiter = limiter(10, 1_000);
        let start = Instant::now();
        limiter.check_and_record_at("a", 1, start).unwrap();
        limiter.check_and_record_at("b", 1, start + Duration::from_secs(30)).unwrap();
        assert_eq!(limiter.tracked_owners(), 2);

        limiter.sweep_at(start + Duration::from_secs(61));
        assert_eq!(limiter.tracked_owners(), 1);

        // a request that can never fit leaves no entry behind
        assert!(limiter.check_and_record_at("c", 5_000, start).is_err());
        assert_eq!(limiter.tracked_owners(), 1);
    }

    #[test]
    fn owners_are_swept_during_regular_checks() {
        let limiter = limiter(1_000, u64::MAX);
        let start = Instant::now();
        limiter.check_and_record_at("stale", 1, start).unwrap();

        let later = start + Duration::from_secs(120);
        for _ in 1..SWEEP_EVERY {
            limiter.check_and_record_at("busy", 1, later).unwrap();
        }
        assert_eq!(limiter.tracked_owners(), 1);
    }
}
