use std::cmp::{max, min};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;
use crate::config::ArqConfig;
use crate::unconfirmed::AckStats;

/// Derives the resend interval from observed acknowledgement delays: a smoothed delay (new
///  samples weighted 1/8) times a safety factor, clamped to the configured range.
pub struct ResendControl {
    smoothed_delay: Option<Duration>,
    interval: Duration,

    config_min_interval: Duration,
    config_max_interval: Duration,
    config_factor_eighths: u32,
}

impl ResendControl {
    pub fn new(config: &ArqConfig) -> ResendControl {
        ResendControl {
            smoothed_delay: None,
            interval: config.initial_resend_interval,
            config_min_interval: config.min_resend_interval,
            config_max_interval: config.max_resend_interval,
            config_factor_eighths: 12,
        }
    }

    #[cfg(test)]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// sections last sent at or before the returned instant are due for resending
    pub fn resend_threshold(&self, now: Instant) -> Instant {
        now.checked_sub(self.interval).unwrap_or(now)
    }

    pub fn update_delay(&mut self, stats: AckStats) {
        if stats.count == 0 {
            return;
        }
        let sample = stats.total_delay / stats.count as u32;
        let smoothed = match self.smoothed_delay {
            None => sample,
            Some(prev) => (prev * 7 + sample) / 8,
        };
        self.smoothed_delay = Some(smoothed);

        let raw_interval = smoothed * self.config_factor_eighths / 8;
        self.interval = min(max(raw_interval, self.config_min_interval), self.config_max_interval);
        trace!("ack delay sample {:?}, smoothed {:?} -> resend interval {:?}", sample, smoothed, self.interval);
    }
}

/// Optional cap on the number of datagrams per second, as a token bucket holding up to one
///  second's worth of datagrams
pub struct SendingAdjustor {
    max_per_second: u32,
    tokens: f64,
    last_refill: Instant,
}

impl SendingAdjustor {
    pub fn new(config: &ArqConfig, now: Instant) -> SendingAdjustor {
        SendingAdjustor {
            max_per_second: config.max_datagrams_per_second,
            tokens: config.max_datagrams_per_second as f64,
            last_refill: now,
        }
    }

    fn is_unlimited(&self) -> bool {
        self.max_per_second == 0
    }

    /// takes a token if sending is allowed now
    pub fn sending_check(&mut self, now: Instant) -> bool {
        if self.is_unlimited() {
            return true;
        }

        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let capacity = self.max_per_second as f64;
        self.tokens = (self.tokens + elapsed.as_secs_f64() * capacity).min(capacity);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        }
        else {
            trace!("datagram rate limit reached");
            false
        }
    }

    /// returns a token taken by `sending_check` that was not used after all
    pub fn revoke(&mut self) {
        if !self.is_unlimited() {
            self.tokens = (self.tokens + 1.0).min(self.max_per_second as f64);
        }
    }
}
