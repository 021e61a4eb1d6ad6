//! Inter-frame timing.
//!
//! The viewer has no clock shared with the producer, so "latency" here is the
//! time between successive frame arrivals on one session. It tracks stalls and
//! frame pacing, not round-trip time.

use std::time::{Duration, Instant};

/// Tracks the arrival time of the previous frame.
#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    last_arrival: Option<Instant>,
    latency: Option<Duration>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a frame arrival and return the gap since the previous one.
    ///
    /// Returns `None` for the first frame of a session.
    pub fn record(&mut self, now: Instant) -> Option<Duration> {
        self.latency = self
            .last_arrival
            .map(|prev| now.saturating_duration_since(prev));
        self.last_arrival = Some(now);
        self.latency
    }

    /// Gap between the two most recent frames.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// [`latency`](Self::latency) in milliseconds; 0 before the second frame.
    pub fn latency_ms(&self) -> u64 {
        self.latency.map(|d| d.as_millis() as u64).unwrap_or(0)
    }

    pub fn last_arrival(&self) -> Option<Instant> {
        self.last_arrival
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
