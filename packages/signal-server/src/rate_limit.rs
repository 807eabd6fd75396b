//! Per-remote-address rate limiting.
//!
//! Connection-count and per-minute/per-hour action limits are tracked here
//! with fixed windows, behind a mutex independent of the session registry's
//! own lock. This lives outside Tower's middleware stack because the
//! per-action windows (session creation per hour, joins per hour, messages
//! per minute) apply to messages flowing through an already-upgraded
//! WebSocket connection, not to discrete HTTP requests a Tower layer could
//! see.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::Mutex;

use crate::config::Config;

/// The action an inbound message performs, for rate-limit accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    CreateSession,
    JoinSession,
    Message,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    window_start_ms: i64,
}

impl Window {
    const fn new(now: i64) -> Self {
        Self { count: 0, window_start_ms: now }
    }

    /// Returns `Ok(())` and records the hit, or `Err(retry_after_secs)` if
    /// the window's limit is already exhausted.
    fn check_and_record(&mut self, now: i64, period_ms: i64, limit: u32) -> Result<(), u64> {
        if now - self.window_start_ms >= period_ms {
            self.window_start_ms = now;
            self.count = 0;
        }
        if self.count >= limit {
            let remaining_ms = (self.window_start_ms + period_ms - now).max(0);
            return Err((remaining_ms / 1000).max(1) as u64);
        }
        self.count += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PerAddressState {
    create: Window,
    join: Window,
    message: Window,
    live_connections: u32,
}

impl PerAddressState {
    fn new(now: i64) -> Self {
        Self {
            create: Window::new(now),
            join: Window::new(now),
            message: Window::new(now),
            live_connections: 0,
        }
    }
}

const HOUR_MS: i64 = 3_600_000;
const MINUTE_MS: i64 = 60_000;

/// Thread-safe per-address rate limiter, holding its own lock.
pub struct RateLimiter {
    create_per_hour: u32,
    join_per_hour: u32,
    messages_per_minute: u32,
    connections_per_address: u32,
    state: Mutex<HashMap<IpAddr, PerAddressState>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            create_per_hour: config.rate_limit_create_per_hour,
            join_per_hour: config.rate_limit_join_per_hour,
            messages_per_minute: config.rate_limit_messages_per_minute,
            connections_per_address: config.rate_limit_connections,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Checks and records one action against `addr`'s window.
    ///
    /// # Errors
    ///
    /// Returns the number of seconds the caller should wait before retrying
    /// if the relevant window is exhausted.
    pub fn check_action(&self, addr: IpAddr, action: Action, now: i64) -> Result<(), u64> {
        let mut state = self.state.lock();
        let entry = state.entry(addr).or_insert_with(|| PerAddressState::new(now));
        match action {
            Action::CreateSession => entry.create.check_and_record(now, HOUR_MS, self.create_per_hour),
            Action::JoinSession => entry.join.check_and_record(now, HOUR_MS, self.join_per_hour),
            Action::Message => entry.message.check_and_record(now, MINUTE_MS, self.messages_per_minute),
        }
    }

    /// Reserves a connection slot for `addr` at accept time.
    ///
    /// Returns `false` if `addr` is already at its concurrent-connection cap;
    /// the caller must reject the connection without incrementing further.
    #[must_use]
    pub fn try_acquire_connection(&self, addr: IpAddr) -> bool {
        let mut state = self.state.lock();
        let entry = state.entry(addr).or_insert_with(|| PerAddressState::new(0));
        if entry.live_connections >= self.connections_per_address {
            return false;
        }
        entry.live_connections += 1;
        true
    }

    /// Releases a connection slot reserved by [`Self::try_acquire_connection`].
    pub fn release_connection(&self, addr: IpAddr) {
        let mut state = self.state.lock();
        if let Some(entry) = state.get_mut(&addr) {
            entry.live_connections = entry.live_connections.saturating_sub(1);
            if entry.live_connections == 0 && entry.create.count == 0 && entry.join.count == 0 && entry.message.count == 0
            {
                state.remove(&addr);
            }
        }
    }

    #[must_use]
    pub fn tracked_address_count(&self) -> usize {
        self.state.lock().len()
    }
}
