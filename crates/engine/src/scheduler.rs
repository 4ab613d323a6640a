//! Emission cadence for one campaign run.
//!
//! Slots sit on an absolute timeline (`slot[n + 1] = slot[n] + interval`), so
//! time spent inside a slot (the append) does not lower the long-run rate as
//! long as it ends before the following slot. Jitter only stretches or
//! shrinks individual intervals.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use traffic_core::{TrafficError, TrafficResult};

pub type Sleep<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Time source for the worker loop. Production uses [`TokioClock`]; tests run
/// it under a paused tokio runtime for deterministic timing.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep_until(&self, deadline: Instant) -> Sleep<'_>;

    fn sleep(&self, duration: Duration) -> Sleep<'_> {
        let deadline = self.now() + duration;
        self.sleep_until(deadline)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep_until(&self, deadline: Instant) -> Sleep<'_> {
        Box::pin(tokio::time::sleep_until(deadline))
    }
}

#[derive(Debug, Clone)]
pub struct RateScheduler {
    interval: Duration,
    jitter: f64,
    started: Instant,
    duration: Option<Duration>,
    next_slot: Instant,
}

impl RateScheduler {
    /// `jitter` is the half-width of the uniform interval factor; `None`
    /// gives perfectly periodic slots.
    pub fn new(
        requests_per_minute: u32,
        duration_minutes: Option<u32>,
        jitter: Option<f64>,
        start: Instant,
    ) -> TrafficResult<Self> {
        if requests_per_minute == 0 {
            return Err(TrafficError::Configuration(
                "Requests per minute must be greater than 0".to_string(),
            ));
        }
        if duration_minutes == Some(0) {
            return Err(TrafficError::Configuration(
                "Duration must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            interval: Duration::from_secs_f64(60.0 / f64::from(requests_per_minute)),
            jitter: jitter.unwrap_or(0.0).clamp(0.0, 0.95),
            started: start,
            duration: duration_minutes.map(|m| Duration::from_secs(u64::from(m) * 60)),
            next_slot: start,
        })
    }

    pub fn base_interval(&self) -> Duration {
        self.interval
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// `None` for unbounded runs.
    pub fn deadline(&self) -> Option<Instant> {
        self.duration.map(|d| self.started + d)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().map_or(false, |deadline| now >= deadline)
    }

    /// Elapsed share of the run in percent; always 0 for unbounded runs.
    pub fn progress(&self, now: Instant) -> f64 {
        match self.duration {
            Some(d) if !d.is_zero() => {
                let elapsed = now.saturating_duration_since(self.started);
                (elapsed.as_secs_f64() / d.as_secs_f64() * 100.0).min(100.0)
            }
            _ => 0.0,
        }
    }

    pub fn jittered_interval<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.jitter <= 0.0 {
            return self.interval;
        }
        let factor = rng.gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        self.interval.mul_f64(factor)
    }

    /// Time left until the slot after the one last reserved. Work done inside
    /// a slot must fit in this budget to keep the cadence.
    pub fn slot_budget(&self, now: Instant) -> Duration {
        self.next_slot.saturating_duration_since(now)
    }

    /// Reserve the next emission slot, or `None` once the slot would land at
    /// or after the deadline. A backlog longer than one interval is dropped
    /// instead of being emitted as a burst.
    pub fn next_slot<R: Rng + ?Sized>(&mut self, now: Instant, rng: &mut R) -> Option<Instant> {
        if now > self.next_slot + self.interval {
            self.next_slot = now;
        }
        let slot = self.next_slot;
        if let Some(deadline) = self.deadline() {
            if slot >= deadline {
                return None;
            }
        }
        self.next_slot = slot + self.jittered_interval(rng);
        Some(slot)
    }
}
