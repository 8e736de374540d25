//! `RateLimiter` (§4.7): a per-user connection cap and a sliding-window
//! message limiter. Each sub-limiter owns exactly one mutex; the sweeper
//! for the message limiter shares that same mutex rather than taking a
//! second lock, per the no-nested-locks rule in §5.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Result of [`RateLimiter::allow_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDecision {
    Allow,
    Deny { retry_after_ms: u64 },
}

struct ConnectionState {
    counts: HashMap<String, usize>,
}

struct MessageState {
    /// Per-user event timestamps, oldest first. Capped at
    /// `max_events_per_user` (§4.7).
    events: HashMap<String, Vec<Instant>>,
}

/// Connection-cap + sliding-window message limiter (§4.7).
pub struct RateLimiter {
    max_users_tracked: usize,
    events_per_window: usize,
    window: Duration,
    max_events_per_user: usize,
    connections: Mutex<ConnectionState>,
    messages: Mutex<MessageState>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            max_users_tracked: config.max_users_tracked,
            events_per_window: config.events_per_window as usize,
            window: Duration::from_secs(config.window_secs),
            max_events_per_user: config.max_events_per_user,
            connections: Mutex::new(ConnectionState { counts: HashMap::new() }),
            messages: Mutex::new(MessageState { events: HashMap::new() }),
        }
    }

    /// `AllowConnection(userID)` (§4.7): denies a brand-new user once
    /// `max_users_tracked` distinct users are already being tracked.
    /// Returns `true` if the connection is allowed and counted.
    pub fn allow_connection(&self, user_id: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let mut state = self.connections.lock().unwrap();
        if !state.counts.contains_key(user_id) && state.counts.len() >= self.max_users_tracked {
            return false;
        }
        *state.counts.entry(user_id.to_string()).or_insert(0) += 1;
        true
    }

    /// `Release(userID)` (§4.7): releases one connection slot, dropping
    /// the user entirely once its count reaches zero.
    pub fn release_connection(&self, user_id: &str) {
        #[allow(clippy::unwrap_used)]
        let mut state = self.connections.lock().unwrap();
        if let Some(count) = state.counts.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.counts.remove(user_id);
            }
        }
    }

    /// `AllowMessage(userID)` (§4.7): sliding-window check. Drops events
    /// older than `now - window`, then allows if the remaining count is
    /// below the limit.
    pub fn allow_message(&self, user_id: &str) -> MessageDecision {
        let now = Instant::now();
        #[allow(clippy::unwrap_used)]
        let mut state = self.messages.lock().unwrap();
        let events = state.events.entry(user_id.to_string()).or_default();
        events.retain(|t| now.duration_since(*t) < self.window);

        if events.len() < self.events_per_window {
            events.push(now);
            if events.len() > self.max_events_per_user {
                let overflow = events.len() - self.max_events_per_user;
                events.drain(0..overflow);
            }
            MessageDecision::Allow
        } else {
            let oldest = events.first().copied().unwrap_or(now);
            let elapsed = now.duration_since(oldest);
            let remaining = self.window.saturating_sub(elapsed);
            let retry_after_ms = remaining.as_millis().max(1) as u64;
            MessageDecision::Deny { retry_after_ms }
        }
    }

    /// Background sweeper (§4.7): reaps users whose entire window has
    /// expired, so idle users don't pin memory forever.
    pub fn sweep(&self) {
        let now = Instant::now();
        #[allow(clippy::unwrap_used)]
        let mut state = self.messages.lock().unwrap();
        state.events.retain(|_, events| {
            events.retain(|t| now.duration_since(*t) < self.window);
            !events.is_empty()
        });
    }

    #[cfg(test)]
    fn tracked_user_count(&self) -> usize {
        #[allow(clippy::unwrap_used)]
        self.connections.lock().unwrap().counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(events_per_window: u32, window_secs: u64) -> RateLimitConfig {
        RateLimitConfig { events_per_window, window_secs, max_users_tracked: 10, max_events_per_user: 1000 }
    }

    #[test]
    fn connection_cap_denies_new_user_beyond_limit() {
        let limiter = RateLimiter::new(&RateLimitConfig { max_users_tracked: 1, ..config(100, 60) });
        assert!(limiter.allow_connection("u1"));
        assert!(!limiter.allow_connection("u2"));
        limiter.release_connection("u1");
        assert!(limiter.allow_connection("u2"));
    }

    #[test]
    fn connection_count_tracks_multiple_connections_per_user() {
        let limiter = RateLimiter::new(&config(100, 60));
        assert!(limiter.allow_connection("u1"));
        assert!(limiter.allow_connection("u1"));
        limiter.release_connection("u1");
        assert_eq!(limiter.tracked_user_count(), 1);
        limiter.release_connection("u1");
        assert_eq!(limiter.tracked_user_count(), 0);
    }

    #[test]
    fn message_window_denies_third_of_two_per_window() {
        let limiter = RateLimiter::new(&config(2, 1));
        assert_eq!(limiter.allow_message("u1"), MessageDecision::Allow);
        assert_eq!(limiter.allow_message("u1"), MessageDecision::Allow);
        match limiter.allow_message("u1") {
            MessageDecision::Deny { retry_after_ms } => assert!(retry_after_ms > 0 && retry_after_ms <= 1000),
            MessageDecision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn sweep_reaps_fully_expired_users() {
        let limiter = RateLimiter::new(&config(100, 0));
        assert_eq!(limiter.allow_message("u1"), MessageDecision::Allow);
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        #[allow(clippy::unwrap_used)]
        let state = limiter.messages.lock().unwrap();
        assert!(!state.events.contains_key("u1"));
    }
}
