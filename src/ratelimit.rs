//! Dual sliding-window rate limiter keyed by client identity.
//!
//! Each client owns a request-count window and a token-cost window, both 60
//! seconds wide. A check prunes stale entries, evaluates both ceilings and
//! records the attempt under one lock acquisition, so concurrent callers for
//! the same client cannot slip past the limit.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Width of both sliding windows.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Entries older than this are discarded by [`RateLimiter::sweep`].
const RETENTION: Duration = Duration::from_secs(3600);

/// Which ceiling a denied request hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Too many requests in the window.
    Requests,
    /// Too much token cost in the window.
    Tokens,
}

impl LimitKind {
    /// Stable lowercase label for logs and audit records.
    pub fn label(self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Tokens => "tokens",
        }
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// The attempt was recorded and may proceed.
    Allowed,
    /// The attempt was rejected and not recorded.
    Denied {
        /// Ceiling that was hit.
        kind: LimitKind,
        /// Human-readable detail.
        reason: String,
        /// How long until enough of the window drains for a retry.
        retry_after: Duration,
    },
}

impl RateDecision {
    /// Whether the attempt was allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Default)]
struct RateLimitBucket {
    requests: VecDeque<Instant>,
    tokens: VecDeque<(Instant, u64)>,
    token_total: u64,
}

impl RateLimitBucket {
    fn prune(&mut self, cutoff: Instant) {
        while self.requests.front().is_some_and(|t| *t <= cutoff) {
            self.requests.pop_front();
        }
        while let Some(&(t, cost)) = self.tokens.front() {
            if t > cutoff {
                break;
            }
            self.tokens.pop_front();
            self.token_total = self.token_total.saturating_sub(cost);
        }
    }

    fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.tokens.is_empty()
    }

    /// Time until the token window has room for `cost` more.
    fn token_retry_after(&self, cost: u64, limit: u64, now: Instant) -> Duration {
        let mut remaining = self.token_total;
        for &(t, entry_cost) in &self.tokens {
            remaining = remaining.saturating_sub(entry_cost);
            if remaining.saturating_add(cost) <= limit {
                return WINDOW.saturating_sub(now.saturating_duration_since(t));
            }
        }
        WINDOW
    }
}

/// Per-client dual sliding-window rate limiter.
///
/// Uses a sync [`Mutex`] since the critical section is short and never awaits.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, RateLimitBucket>>,
    max_requests: u32,
    max_tokens: u64,
}

impl RateLimiter {
    /// Create a limiter with the given per-minute ceilings.
    pub fn new(max_requests: u32, max_tokens: u64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_requests,
            max_tokens,
        }
    }

    /// Create a limiter from config.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.requests_per_minute, config.tokens_per_minute)
    }

    /// Check and, when allowed, record one request costing `token_cost`.
    pub fn check(&self, client: &str, token_cost: u64) -> RateDecision {
        self.check_at(client, token_cost, Instant::now())
    }

    fn check_at(&self, client: &str, token_cost: u64, now: Instant) -> RateDecision {
        let mut buckets = match self.buckets.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        let bucket = buckets.entry(client.to_owned()).or_default();
        if let Some(cutoff) = now.checked_sub(WINDOW) {
            bucket.prune(cutoff);
        }

        let count = u32::try_from(bucket.requests.len()).unwrap_or(u32::MAX);
        if count >= self.max_requests {
            let retry_after = bucket
                .requests
                .front()
                .map(|t| WINDOW.saturating_sub(now.saturating_duration_since(*t)))
                .unwrap_or(WINDOW);
            return RateDecision::Denied {
                kind: LimitKind::Requests,
                reason: format!(
                    "{count} requests in the last {}s (limit: {})",
                    WINDOW.as_secs(),
                    self.max_requests
                ),
                retry_after,
            };
        }

        let projected = bucket.token_total.saturating_add(token_cost);
        if projected > self.max_tokens {
            let retry_after = if token_cost > self.max_tokens {
                WINDOW
            } else {
                bucket.token_retry_after(token_cost, self.max_tokens, now)
            };
            return RateDecision::Denied {
                kind: LimitKind::Tokens,
                reason: format!(
                    "{} tokens in the last {}s plus {token_cost} requested (limit: {})",
                    bucket.token_total,
                    WINDOW.as_secs(),
                    self.max_tokens
                ),
                retry_after,
            };
        }

        bucket.requests.push_back(now);
        if token_cost > 0 {
            bucket.tokens.push_back((now, token_cost));
            bucket.token_total = projected;
        }
        RateDecision::Allowed
    }

    /// Discard entries older than one hour and drop empty buckets.
    ///
    /// Returns the number of buckets removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let Some(cutoff) = now.checked_sub(RETENTION) else {
            return 0;
        };
        let mut buckets = match self.buckets.lock() {
            Ok(b) => b,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            bucket.prune(cutoff);
            !bucket.is_empty()
        });
        let removed = before.saturating_sub(buckets.len());
        if removed > 0 {
            debug!(removed, "rate limiter buckets swept");
        }
        removed
    }

    /// Number of clients currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.buckets.lock().map(|b| b.len()).unwrap_or(0)
    }
}
