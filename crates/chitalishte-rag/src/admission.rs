//! Request admission: rate limiting and abuse detection.
//!
//! Every request passes here before any pipeline work. Rate limiting
//! tracks three fixed windows per identity (IP and session) and rejects
//! when any of the six counters is over its ceiling. Abuse detection runs
//! orthogonally: oversized queries are rejected outright, and rapid-fire
//! request patterns earn the IP a temporary block that overrides
//! everything else until it expires.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::{AbuseConfig, RateLimitConfig};
use crate::error::EngineError;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Counter state older than this is dropped by the cleanup pass.
const STALE_AFTER: Duration = Duration::from_secs(7 * 86_400);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum IdentityKey {
    Ip(String),
    Session(String),
}

#[derive(Debug)]
struct Window {
    count: u32,
    started: Instant,
}

impl Window {
    fn new(now: Instant) -> Self {
        Self { count: 0, started: now }
    }

    /// Count this request against the window, resetting it first if the
    /// span has elapsed. Returns the remaining time when over the limit.
    fn hit(&mut self, now: Instant, span: Duration, limit: u32) -> Option<Duration> {
        let elapsed = now.duration_since(self.started);
        if elapsed >= span {
            self.started = now;
            self.count = 1;
            return None;
        }
        self.count += 1;
        if self.count > limit {
            Some(span - elapsed)
        } else {
            None
        }
    }
}

struct RateWindows {
    minute: Window,
    hour: Window,
    day: Window,
    last_seen: Instant,
}

impl RateWindows {
    fn new(now: Instant) -> Self {
        Self {
            minute: Window::new(now),
            hour: Window::new(now),
            day: Window::new(now),
            last_seen: now,
        }
    }
}

#[derive(Default)]
struct AbuseState {
    blocked_until: Option<Instant>,
    /// Recent request instants inside the rolling burst window.
    recent: VecDeque<Instant>,
}

pub struct AdmissionControl {
    rate: RateLimitConfig,
    abuse: AbuseConfig,
    windows: DashMap<IdentityKey, RateWindows>,
    abuse_state: DashMap<String, AbuseState>,
}

impl AdmissionControl {
    pub fn new(rate: RateLimitConfig, abuse: AbuseConfig) -> Self {
        Self {
            rate,
            abuse,
            windows: DashMap::new(),
            abuse_state: DashMap::new(),
        }
    }

    /// Gate one request. `Ok(())` admits it; every rejection carries the
    /// reason and, for rate limits, a retry hint.
    pub fn admit(
        &self,
        ip: &str,
        session: Option<&str>,
        query_len: usize,
    ) -> Result<(), EngineError> {
        let now = Instant::now();

        if self.abuse.enabled {
            self.check_abuse(ip, query_len, now)?;
        }

        if self.rate.enabled {
            self.check_windows(IdentityKey::Ip(ip.to_string()), now)?;
            if let Some(session) = session {
                self.check_windows(IdentityKey::Session(session.to_string()), now)?;
            }
        }

        Ok(())
    }

    fn check_abuse(&self, ip: &str, query_len: usize, now: Instant) -> Result<(), EngineError> {
        let mut state = self.abuse_state.entry(ip.to_string()).or_default();

        if let Some(until) = state.blocked_until {
            if until > now {
                return Err(EngineError::Blocked {
                    remaining: until.duration_since(now),
                });
            }
            state.blocked_until = None;
        }

        // Length check is independent of rate state and does not count
        // toward the burst window.
        if query_len > self.abuse.max_query_length {
            tracing::warn!(ip, query_len, "rejected oversized query");
            return Err(EngineError::QueryTooLong {
                length: query_len,
                max: self.abuse.max_query_length,
            });
        }

        let window = Duration::from_secs(self.abuse.rapid_window_secs);
        while let Some(front) = state.recent.front() {
            if now.duration_since(*front) > window {
                state.recent.pop_front();
            } else {
                break;
            }
        }

        let min_interval = Duration::from_millis(self.abuse.min_request_interval_ms);
        let too_fast = state
            .recent
            .back()
            .is_some_and(|last| now.duration_since(*last) < min_interval);
        state.recent.push_back(now);

        if too_fast || state.recent.len() > self.abuse.max_rapid_requests {
            let duration = Duration::from_secs(self.abuse.block_duration_secs);
            state.blocked_until = Some(now + duration);
            state.recent.clear();
            tracing::warn!(ip, too_fast, "temporary IP block imposed");
            return Err(EngineError::Blocked {
                remaining: duration,
            });
        }

        Ok(())
    }

    fn check_windows(&self, key: IdentityKey, now: Instant) -> Result<(), EngineError> {
        let mut state = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| RateWindows::new(now));
        state.last_seen = now;

        // Smallest window first, so retry_after reports the shortest wait.
        if let Some(retry_after) = state.minute.hit(now, MINUTE, self.rate.per_minute) {
            tracing::warn!(identity = ?key, "per-minute rate limit exceeded");
            return Err(EngineError::RateLimited {
                scope: "minute",
                retry_after,
            });
        }
        if let Some(retry_after) = state.hour.hit(now, HOUR, self.rate.per_hour) {
            tracing::warn!(identity = ?key, "per-hour rate limit exceeded");
            return Err(EngineError::RateLimited {
                scope: "hour",
                retry_after,
            });
        }
        if let Some(retry_after) = state.day.hit(now, DAY, self.rate.per_day) {
            tracing::warn!(identity = ?key, "per-day rate limit exceeded");
            return Err(EngineError::RateLimited {
                scope: "day",
                retry_after,
            });
        }

        Ok(())
    }

    /// Drop stale counter state and expired blocks. Runs off the request
    /// path, on the schedule set up by `spawn_cleanup`.
    pub fn prune(&self) {
        let now = Instant::now();
        let before_windows = self.windows.len();
        self.windows
            .retain(|_, state| now.duration_since(state.last_seen) < STALE_AFTER);
        let before_blocks = self.abuse_state.len();
        let window = Duration::from_secs(self.abuse.rapid_window_secs);
        self.abuse_state.retain(|_, state| {
            while let Some(front) = state.recent.front() {
                if now.duration_since(*front) > window {
                    state.recent.pop_front();
                } else {
                    break;
                }
            }
            state.blocked_until.is_some_and(|until| until > now) || !state.recent.is_empty()
        });
        tracing::debug!(
            windows_removed = before_windows - self.windows.len(),
            abuse_removed = before_blocks - self.abuse_state.len(),
            "admission state pruned"
        );
    }

    pub fn spawn_cleanup(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let control = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                control.prune();
            }
        })
    }
}
