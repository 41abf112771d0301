use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::time::{Duration, Instant};

/// Trailing-window budget over outbound classification calls and the tokens
/// they consume. Samples live in memory only; a restart starts a fresh
/// window, which is correct for a single process lifetime.
#[derive(Clone)]
pub struct RateLimiters {
    max_calls_per_min: usize,
    max_tokens_per_min: usize,
    window: Duration,
    poll_interval: Duration,
    samples: Arc<Mutex<WindowSamples>>,
}

#[derive(Default)]
struct WindowSamples {
    call_timestamps: VecDeque<Instant>,
    token_usage: VecDeque<(Instant, usize)>,
}

impl WindowSamples {
    fn purge_older_than(&mut self, horizon: Instant) {
        while self
            .call_timestamps
            .front()
            .is_some_and(|ts| *ts <= horizon)
        {
            self.call_timestamps.pop_front();
        }
        while self.token_usage.front().is_some_and(|(ts, _)| *ts <= horizon) {
            self.token_usage.pop_front();
        }
    }

    fn tokens_in_window(&self) -> usize {
        self.token_usage.iter().map(|(_, tokens)| tokens).sum()
    }
}

const RATE_WINDOW: Duration = Duration::from_secs(60);
const CAPACITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

impl RateLimiters {
    pub fn new(calls_per_minute: usize, tokens_per_minute: usize) -> Self {
        Self {
            max_calls_per_min: calls_per_minute,
            max_tokens_per_min: tokens_per_minute,
            window: RATE_WINDOW,
            poll_interval: CAPACITY_POLL_INTERVAL,
            samples: Arc::new(Mutex::new(WindowSamples::default())),
        }
    }

    /// Check whether a call can go out without exceeding either budget.
    pub fn can_proceed(&self, estimated_tokens: usize) -> bool {
        let mut samples = self.samples.lock().unwrap();
        if let Some(horizon) = Instant::now().checked_sub(self.window) {
            samples.purge_older_than(horizon);
        }

        samples.call_timestamps.len() < self.max_calls_per_min
            && samples.tokens_in_window() + estimated_tokens < self.max_tokens_per_min
    }

    /// Record a successful API call. Failed calls are never recorded since
    /// the service did not bill any capacity for them.
    pub fn record_call(&self, tokens_used: usize) {
        let now = Instant::now();
        let mut samples = self.samples.lock().unwrap();
        samples.call_timestamps.push_back(now);
        samples.token_usage.push_back((now, tokens_used));
    }

    /// Suspend until both budgets admit a call of the estimated size.
    pub async fn wait_for_capacity(&self, estimated_tokens: usize) {
        while !self.can_proceed(estimated_tokens) {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub fn get_status(&self) -> String {
        let samples = self.samples.lock().unwrap();
        format!(
            "calls: {}/{} tokens: {}/{}",
            samples.call_timestamps.len(),
            self.max_calls_per_min,
            samples.tokens_in_window(),
            self.max_tokens_per_min
        )
    }
}
