//! The per-campaign generation loop.
//!
//! Each iteration waits for the next slot, simulates one request, and appends
//! it together with a status refresh under the campaign lock. The run token
//! is checked before sleeping and again under the lock, so a stopped run
//! never writes after Stop returns.

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};
use traffic_core::types::{CampaignConfig, RunStatus, StatusPatch, TrafficRecord};
use traffic_core::{TrafficError, TrafficResult};
use traffic_storage::{CampaignLog, LogLevel, StatusTracker, TrafficLedger};

use crate::registry::{CampaignRegistry, RunToken};
use crate::scheduler::{Clock, RateScheduler};
use crate::simulator::RequestSimulator;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The configured duration elapsed.
    Completed { records: u64 },
    /// The run was stopped (or superseded) before its deadline.
    Cancelled { records: u64 },
    /// A storage failure ended the run; status is `error`.
    Failed { records: u64, error: String },
}

impl RunOutcome {
    pub fn records(&self) -> u64 {
        match self {
            Self::Completed { records }
            | Self::Cancelled { records }
            | Self::Failed { records, .. } => *records,
        }
    }
}

/// Shared services a worker writes through.
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<CampaignRegistry>,
    pub ledger: Arc<TrafficLedger>,
    pub tracker: Arc<StatusTracker>,
    pub log: CampaignLog,
    pub simulator: Arc<RequestSimulator>,
    pub clock: Arc<dyn Clock>,
    pub status_every: u64,
}

enum Persisted {
    Written,
    Superseded,
}

pub struct CampaignWorker {
    config: CampaignConfig,
    token: RunToken,
    scheduler: RateScheduler,
    rng: StdRng,
    ctx: WorkerContext,
    emitted: u64,
}

impl CampaignWorker {
    pub fn new(
        config: CampaignConfig,
        token: RunToken,
        scheduler: RateScheduler,
        ctx: WorkerContext,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            token,
            scheduler,
            rng,
            ctx,
            emitted: 0,
        }
    }

    fn campaign_id(&self) -> &str {
        &self.config.campaign_id
    }

    fn is_current(&self) -> bool {
        self.ctx.registry.is_current(self.campaign_id(), self.token)
    }

    pub async fn run(mut self) -> RunOutcome {
        let clock = self.ctx.clock.clone();
        metrics::counter!("traffic.workers_started").increment(1);
        info!(
            campaign_id = %self.campaign_id(),
            run = %self.token,
            rpm = self.config.requests_per_minute,
            duration_minutes = ?self.config.duration_minutes,
            "Worker started"
        );
        self.log(
            LogLevel::Info,
            &format!(
                "Traffic generation started: {} requests/minute, duration {}",
                self.config.requests_per_minute,
                self.config
                    .duration_minutes
                    .map_or_else(|| "unbounded".to_string(), |m| format!("{m} minutes"))
            ),
        );

        loop {
            if !self.is_current() {
                return self.cancelled();
            }

            let now = clock.now();
            let slot = match self.scheduler.next_slot(now, &mut self.rng) {
                Some(slot) => slot,
                None => return self.complete(),
            };
            clock.sleep_until(slot).await;

            if !self.is_current() {
                return self.cancelled();
            }

            let record = self.ctx.simulator.simulate(&self.config, &mut self.rng);
            metrics::histogram!("traffic.simulated_latency_ms").record(record.response_time as f64);
            if self.ctx.simulator.settings().simulate_latency {
                // Latency past the next slot would push every later slot back.
                let latency = Duration::from_millis(record.response_time)
                    .min(self.scheduler.slot_budget(clock.now()));
                clock.sleep(latency).await;
            }

            match self.persist(&record) {
                Ok(Persisted::Written) => {}
                Ok(Persisted::Superseded) => return self.cancelled(),
                Err(e) if e.is_fatal_for_run() => return self.fail(e),
                Err(e) => {
                    // Appends only fail fatally, so this is the status refresh.
                    warn!(campaign_id = %self.campaign_id(), error = %e, "Status refresh failed");
                    self.log(LogLevel::Warn, &format!("Status refresh failed: {e}"));
                }
            }
        }
    }

    /// Append `record` and refresh the status, both under the campaign lock.
    /// Skips the write if the run was stopped while the request was in flight.
    fn persist(&mut self, record: &TrafficRecord) -> TrafficResult<Persisted> {
        let guard = self.ctx.ledger.locks().acquire(&self.config.campaign_id);
        if !self.ctx.registry.is_current(guard.campaign_id(), self.token) {
            return Ok(Persisted::Superseded);
        }

        self.ctx.ledger.append_locked(&guard, record)?;
        self.emitted += 1;
        let outcome = if record.success { "success" } else { "failure" };
        metrics::counter!("traffic.requests_generated", "outcome" => outcome).increment(1);

        if self.emitted % self.ctx.status_every.max(1) == 0 {
            let progress = self.scheduler.progress(self.ctx.clock.now());
            self.ctx
                .tracker
                .update_locked(&guard, RunStatus::Running, StatusPatch::progress(progress))?;
        }

        debug!(
            campaign_id = %guard.campaign_id(),
            id = %record.id,
            success = record.success,
            status_code = record.status_code,
            "Request simulated"
        );
        Ok(Persisted::Written)
    }

    fn complete(&self) -> RunOutcome {
        let guard = self.ctx.ledger.locks().acquire(&self.config.campaign_id);
        if !self.ctx.registry.release(&guard, self.token) {
            drop(guard);
            return self.cancelled();
        }

        let patch = StatusPatch {
            progress_percentage: Some(100.0),
            ..StatusPatch::finished()
        };
        let status = self
            .ctx
            .tracker
            .update_locked(&guard, RunStatus::Completed, patch);
        drop(guard);

        match status {
            Ok(status) => {
                metrics::counter!("traffic.workers_completed").increment(1);
                info!(
                    campaign_id = %self.campaign_id(),
                    total = status.total_requests,
                    successful = status.successful_requests,
                    "Campaign completed"
                );
                self.log(
                    LogLevel::Info,
                    &format!(
                        "Traffic generation completed: {} requests ({} successful)",
                        status.total_requests, status.successful_requests
                    ),
                );
            }
            Err(e) => {
                error!(campaign_id = %self.campaign_id(), error = %e, "Failed to record completion");
            }
        }
        RunOutcome::Completed {
            records: self.emitted,
        }
    }

    fn fail(&self, e: TrafficError) -> RunOutcome {
        let message = e.to_string();
        metrics::counter!("traffic.workers_failed").increment(1);
        error!(campaign_id = %self.campaign_id(), error = %message, "Worker failed");

        let guard = self.ctx.ledger.locks().acquire(&self.config.campaign_id);
        if self.ctx.registry.release(&guard, self.token) {
            let patch = StatusPatch::finished().with_error(message.clone());
            if let Err(status_err) = self
                .ctx
                .tracker
                .update_locked(&guard, RunStatus::Error, patch)
            {
                error!(
                    campaign_id = %self.campaign_id(),
                    error = %status_err,
                    "Failed to record error status"
                );
            }
        }
        drop(guard);

        self.log(LogLevel::Error, &format!("Traffic generation failed: {message}"));
        RunOutcome::Failed {
            records: self.emitted,
            error: message,
        }
    }

    fn cancelled(&self) -> RunOutcome {
        // Stop already wrote the terminal status; only the counts may lag.
        let guard = self.ctx.ledger.locks().acquire(&self.config.campaign_id);
        if let Err(e) = self.ctx.tracker.refresh_counts(&guard) {
            warn!(campaign_id = %self.campaign_id(), error = %e, "Count refresh failed");
        }
        drop(guard);

        metrics::counter!("traffic.workers_cancelled").increment(1);
        info!(
            campaign_id = %self.campaign_id(),
            run = %self.token,
            records = self.emitted,
            "Worker exiting, run no longer current"
        );
        RunOutcome::Cancelled {
            records: self.emitted,
        }
    }

    /// Campaign log lines are best effort and never end a run.
    fn log(&self, level: LogLevel, message: &str) {
        if !self.config.config.enable_logging {
            return;
        }
        if let Err(e) = self.ctx.log.append(self.campaign_id(), level, message) {
            warn!(campaign_id = %self.campaign_id(), error = %e, "Campaign log write failed");
        }
    }
}
