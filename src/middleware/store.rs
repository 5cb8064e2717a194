//! In-memory fixed-window rate-limit counters.
//!
//! # Algorithm
//!
//! Fixed window: a key's counter is valid for the window duration measured
//! from its first hit; once the window elapses, the next hit starts a fresh
//! window with count 1. Bursts aligned at a window boundary can admit up to
//! twice the configured maximum in the worst case - a known approximation of
//! this algorithm, not a bug. Sliding windows and token buckets are
//! deliberately out of scope.
//!
//! # Concurrency
//!
//! Counter entries live in a sharded concurrent map. The read-compare-
//! increment-or-reset sequence in [`RateLimitStore::hit`] executes while
//! holding the entry's shard guard, so concurrent requests for the same key
//! cannot interleave and under-count.
//!
//! # Scope
//!
//! Single process only. Counters are not shared across server instances;
//! horizontal scaling needs an external shared store, which this crate does
//! not provide.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One counter window for one key. Never leaves the store; callers only see
/// derived [`RateLimitInfo`] snapshots.
#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window_start: Instant,
    count: u32,
}

/// Derived, caller-facing view of a key's current window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    /// Configured maximum for the window.
    pub limit: u32,
    /// Requests left in the current window (0 when exhausted).
    pub remaining: u32,
    /// Time until the current window resets.
    pub reset_after: Duration,
    /// Hits observed in the current window, including rejected ones.
    pub total_hits: u32,
}

/// Outcome of recording one hit against a key.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub info: RateLimitInfo,
}

/// Shared fixed-window counter store, keyed by caller-derived strings.
#[derive(Debug, Default)]
pub struct RateLimitStore {
    entries: DashMap<String, WindowEntry>,
}

impl RateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit for `key` and decide whether it is admitted.
    ///
    /// The update is atomic per key: the entry guard is held across the
    /// whole compare/reset/increment sequence.
    pub fn hit(&self, key: &str, window: Duration, max_requests: u32) -> RateLimitDecision {
        let now = Instant::now();

        let (window_start, total_hits) = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert(WindowEntry {
                    window_start: now,
                    count: 0,
                });

            if now.duration_since(entry.window_start) >= window {
                entry.window_start = now;
                entry.count = 0;
            }
            entry.count += 1;

            (entry.window_start, entry.count)
        };

        let reset_after = window.saturating_sub(now.duration_since(window_start));

        RateLimitDecision {
            allowed: total_hits <= max_requests,
            info: RateLimitInfo {
                limit: max_requests,
                remaining: max_requests.saturating_sub(total_hits),
                reset_after,
                total_hits,
            },
        }
    }

    /// Snapshot a key's current window without recording a hit.
    pub fn peek(&self, key: &str, window: Duration, max_requests: u32) -> Option<RateLimitInfo> {
        let entry = self.entries.get(key)?;
        let now = Instant::now();
        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= window {
            return None;
        }

        Some(RateLimitInfo {
            limit: max_requests,
            remaining: max_requests.saturating_sub(entry.count),
            reset_after: window.saturating_sub(elapsed),
            total_hits: entry.count,
        })
    }

    /// Drop entries whose window has fully elapsed. Returns the number of
    /// entries removed. Expired entries are also reset lazily on their next
    /// hit, so purging is an optimization, not a correctness requirement.
    pub fn purge_expired(&self, window: Duration) -> usize {
        let before = self.entries.len();
        let now = Instant::now();
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < window);
        before.saturating_sub(self.entries.len())
    }

    /// Number of live keys (for observability).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
