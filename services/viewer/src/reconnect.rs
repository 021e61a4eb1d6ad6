//! Reconnect delay policies.
//!
//! The default is a fixed 3 s delay retried forever. The exponential policy
//! uses the same `backoff` schedule as the ingest service's RTSP client and
//! is reset whenever a connection opens.

use backoff::{backoff::Backoff, ExponentialBackoff};
use std::time::Duration;

/// Delay used by the fixed policy unless configured otherwise.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(3000);

/// How long a session waits in `Reconnecting` before trying again.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt.
    Fixed { delay: Duration },

    /// Exponential backoff with jitter, capped at `max_delay`.
    Exponential {
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: f64,
    },
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::Fixed {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

enum Strategy {
    Fixed(Duration),
    Backoff(ExponentialBackoff),
}

/// Stateful delay generator for one session.
pub struct ReconnectSchedule {
    strategy: Strategy,
    max_delay: Duration,
    attempts: u32,
}

impl ReconnectSchedule {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        match policy {
            ReconnectPolicy::Fixed { delay } => Self {
                strategy: Strategy::Fixed(*delay),
                max_delay: *delay,
                attempts: 0,
            },
            ReconnectPolicy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
                jitter,
            } => {
                let mut backoff = ExponentialBackoff {
                    initial_interval: *initial_delay,
                    max_interval: *max_delay,
                    multiplier: *multiplier,
                    randomization_factor: *jitter,
                    max_elapsed_time: None,
                    ..Default::default()
                };
                backoff.reset();

                Self {
                    strategy: Strategy::Backoff(backoff),
                    max_delay: *max_delay,
                    attempts: 0,
                }
            }
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        match &mut self.strategy {
            Strategy::Fixed(delay) => *delay,
            Strategy::Backoff(backoff) => backoff
                .next_backoff()
                .unwrap_or(self.max_delay)
                .min(self.max_delay),
        }
    }

    /// Called after a successful open.
    pub fn reset(&mut self) {
        self.attempts = 0;
        if let Strategy::Backoff(backoff) = &mut self.strategy {
            backoff.reset();
        }
    }

    /// Delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl std::fmt::Debug for ReconnectSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.strategy {
            Strategy::Fixed(_) => "fixed",
            Strategy::Backoff(_) => "exponential",
        };
        f.debug_struct("ReconnectSchedule")
            .field("strategy", &kind)
            .field("attempts", &self.attempts)
            .finish()
    }
}
