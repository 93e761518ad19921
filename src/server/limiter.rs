//! Inbound connection accounting and the adaptive keepalive timeout.
//!
//! Every accepted socket holds an [`InboundGuard`] for its lifetime, so
//! the counter tracks open inbound connections exactly. The idle
//! keepalive timeout handed to read jobs shrinks as the counter climbs
//! from the soft toward the hard limit, reclaiming idle connections
//! before the hard limit starts rejecting accepts.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

const DEFAULT_SOFT_LIMIT: usize = 10_000;
const DEFAULT_HARD_LIMIT: usize = 15_000;

const DEFAULT_MAX_KEEPALIVE_SECS: u32 = 120;
const DEFAULT_MIN_KEEPALIVE_SECS: u32 = 10;

#[derive(Debug)]
pub(crate) struct InboundLimiter {
    counter: AtomicUsize,
    soft: AtomicUsize,
    hard: AtomicUsize,
    max_keepalive_secs: AtomicU32,
    min_keepalive_secs: AtomicU32,
}

impl InboundLimiter {
    fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
            soft: AtomicUsize::new(DEFAULT_SOFT_LIMIT),
            hard: AtomicUsize::new(DEFAULT_HARD_LIMIT),
            max_keepalive_secs: AtomicU32::new(DEFAULT_MAX_KEEPALIVE_SECS),
            min_keepalive_secs: AtomicU32::new(DEFAULT_MIN_KEEPALIVE_SECS),
        }
    }

    pub(crate) fn set_fd_limits(&self, soft: usize, hard: usize) {
        self.soft.store(soft, Ordering::Relaxed);
        self.hard.store(hard, Ordering::Relaxed);
    }

    pub(crate) fn set_keepalive_timeouts(&self, min_secs: u32, max_secs: u32) {
        self.min_keepalive_secs.store(min_secs, Ordering::Relaxed);
        self.max_keepalive_secs.store(max_secs, Ordering::Relaxed);
    }

    pub(crate) fn active(&self) -> usize {
        self.counter.load(Ordering::Relaxed)
    }

    pub(crate) fn exceed_hard(&self) -> usize {
        self.active()
            .saturating_sub(self.hard.load(Ordering::Relaxed))
    }

    /// Idle timeout for accepted connections waiting on their next
    /// request.
    ///
    /// Below the soft limit this is the maximum keepalive. Past it the
    /// timeout decays linearly with the remaining headroom toward the
    /// hard limit, floored at the minimum keepalive.
    pub(crate) fn unused_keepalive_timeout(&self) -> Duration {
        let max = self.max_keepalive_secs.load(Ordering::Relaxed);
        let exceeded = self
            .active()
            .saturating_sub(self.soft.load(Ordering::Relaxed));

        if exceeded == 0 {
            return Duration::from_secs(u64::from(max));
        }

        let delta = self
            .hard
            .load(Ordering::Relaxed)
            .saturating_sub(self.soft.load(Ordering::Relaxed));
        let remaining = delta.saturating_sub(exceeded);
        let scaled = (max as usize * remaining / (delta + 1)) as u32;
        let min = self.min_keepalive_secs.load(Ordering::Relaxed);

        Duration::from_secs(u64::from(scaled.max(min)))
    }
}

/// Holds one slot of the inbound counter; created per accepted socket,
/// decremented exactly once on drop.
#[derive(Debug)]
pub(crate) struct InboundGuard {
    limiter: Arc<InboundLimiter>,
}

impl InboundGuard {
    pub(crate) fn new(limiter: Arc<InboundLimiter>) -> Self {
        limiter.counter.fetch_add(1, Ordering::Relaxed);
        Self { limiter }
    }
}

impl Drop for InboundGuard {
    fn drop(&mut self) {
        self.limiter.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// The process-wide inbound limiter.
pub(crate) fn inbound() -> &'static Arc<InboundLimiter> {
    static LIMITER: OnceLock<Arc<InboundLimiter>> = OnceLock::new();
    LIMITER.get_or_init(|| Arc::new(InboundLimiter::new()))
}

#[cfg(test)]
mod test {
    use super::*;

    fn limiter_with(active: usize, soft: usize, hard: usize, min: u32, max: u32) -> InboundLimiter {
        let limiter = InboundLimiter::new();
        limiter.set_fd_limits(soft, hard);
        limiter.set_keepalive_timeouts(min, max);
        limiter.counter.store(active, Ordering::Relaxed);
        limiter
    }

    #[test]
    fn keepalive_is_max_below_soft_limit() {
        let limiter = limiter_with(9, 10, 20, 1, 30);
        assert_eq!(limiter.unused_keepalive_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn keepalive_shrinks_with_pressure() {
        // soft=10, hard=20, min=1s, max=30s, 15 active:
        // exceed=5, delta=10, remaining=5 -> 30*5/11 = 13s
        let limiter = limiter_with(15, 10, 20, 1, 30);
        assert_eq!(limiter.unused_keepalive_timeout(), Duration::from_secs(13));
    }

    #[test]
    fn keepalive_is_monotone_non_increasing() {
        let limiter = limiter_with(0, 10, 20, 1, 30);
        let mut last = limiter.unused_keepalive_timeout();
        for active in 0..=25 {
            limiter.counter.store(active, Ordering::Relaxed);
            let timeout = limiter.unused_keepalive_timeout();
            assert!(timeout <= last, "timeout grew at active={active}");
            assert!(timeout >= Duration::from_secs(1));
            last = timeout;
        }
    }

    #[test]
    fn keepalive_floors_at_min() {
        let limiter = limiter_with(20, 10, 20, 7, 30);
        assert_eq!(limiter.unused_keepalive_timeout(), Duration::from_secs(7));
        // Even past the hard limit.
        let limiter = limiter_with(50, 10, 20, 7, 30);
        assert_eq!(limiter.unused_keepalive_timeout(), Duration::from_secs(7));
    }

    #[test]
    fn guard_counts_exactly_once() {
        let limiter = Arc::new(InboundLimiter::new());
        assert_eq!(limiter.active(), 0);
        let first = InboundGuard::new(limiter.clone());
        let second = InboundGuard::new(limiter.clone());
        assert_eq!(limiter.active(), 2);
        drop(first);
        assert_eq!(limiter.active(), 1);
        drop(second);
        assert_eq!(limiter.active(), 0);
    }

    #[test]
    fn exceed_hard_counts_overflow() {
        let limiter = limiter_with(22, 10, 20, 1, 30);
        assert_eq!(limiter.exceed_hard(), 2);
        let limiter = limiter_with(5, 10, 20, 1, 30);
        assert_eq!(limiter.exceed_hard(), 0);
    }
}
