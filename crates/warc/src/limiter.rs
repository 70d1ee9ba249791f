//! Token bucket whose refill rate is itself adjusted by success and error
//! feedback. The upstream archive answers sustained bursts with 403 blocks
//! that last hours, so the bucket backs off hard on throttle statuses and
//! recovers slowly after long streaks of clean responses.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Statuses that signal throttling or an IP block; only these shrink the
/// rate.
const BACKOFF_STATUSES: [u16; 3] = [403, 429, 503];

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    pub initial_rps: f64,
    pub min_rps: f64,
    pub max_rps: f64,
    pub backoff_factor: f64,
    pub recovery_factor: f64,
    pub success_streak_threshold: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            initial_rps: 5.0,
            min_rps: 0.5,
            max_rps: 20.0,
            backoff_factor: 0.8,
            recovery_factor: 1.05,
            success_streak_threshold: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterStats {
    pub current_rps: f64,
    pub success_count: u64,
    pub error_count: u64,
    /// Number of times the rate was reduced.
    pub backoff_count: u64,
}

/// Shared by every worker of one crawl. `acquire` is the only suspension
/// point; the feedback methods are short critical sections.
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    state: Mutex<State>,
}

struct State {
    rate: f64,
    tokens: f64,
    last_refill: Instant,
    streak: u64,
    success_count: u64,
    error_count: u64,
    backoff_count: u64,
}

impl State {
    /// Refill lazily from the wall clock; burst capacity is one second at
    /// the current rate.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.rate);
        self.last_refill = now;
    }

    fn set_rate(&mut self, rate: f64) {
        self.rate = rate;
        self.tokens = self.tokens.min(rate);
    }
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        let state = State {
            rate: cfg.initial_rps,
            tokens: cfg.initial_rps,
            last_refill: Instant::now(),
            streak: 0,
            success_count: 0,
            error_count: 0,
            backoff_count: 0,
        };
        Self {
            cfg,
            state: Mutex::new(state),
        }
    }

    /// Suspend until one token is available, then consume it. A caller
    /// cancelled while waiting has consumed nothing.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap();
                state.refill(Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64(((1.0 - state.tokens) / state.rate).max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }

    pub fn report_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.success_count += 1;
        state.streak += 1;
        if state.streak >= self.cfg.success_streak_threshold {
            state.refill(Instant::now());
            let raised = (state.rate * self.cfg.recovery_factor).min(self.cfg.max_rps);
            state.set_rate(raised);
            state.streak = 0;
            tracing::debug!(rps = raised, "rate limiter recovered");
        }
    }

    /// Errors outside the backoff set (404s, network failures) only reset
    /// the streak.
    pub fn report_error(&self, status: u16) {
        let mut state = self.state.lock().unwrap();
        state.error_count += 1;
        state.streak = 0;
        if BACKOFF_STATUSES.contains(&status) {
            state.refill(Instant::now());
            let lowered = (state.rate * self.cfg.backoff_factor).max(self.cfg.min_rps);
            state.set_rate(lowered);
            state.backoff_count += 1;
            tracing::warn!(status, rps = lowered, "rate limiter backed off");
        }
    }

    pub fn current_rps(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    pub fn stats(&self) -> RateLimiterStats {
        let state = self.state.lock().unwrap();
        RateLimiterStats {
            current_rps: state.rate,
            success_count: state.success_count,
            error_count: state.error_count,
            backoff_count: state.backoff_count,
        }
    }
}
