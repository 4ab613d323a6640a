//! In-process entry points: Start, Stop, Append, Read, GetStatus, Wait.

use std::sync::Arc;

use tracing::{info, warn};
use traffic_core::config::{AppConfig, SchedulerConfig};
use traffic_core::types::{
    validate_campaign_id, CampaignConfig, CampaignStatus, RunStatus, StatusPatch, TrafficRecord,
};
use traffic_core::TrafficResult;
use traffic_storage::{
    AppendOutcome, CampaignLocks, CampaignLog, LedgerSnapshot, LogLevel, StatusTracker,
    TrafficLedger,
};

use crate::registry::CampaignRegistry;
use crate::scheduler::{Clock, RateScheduler, TokioClock};
use crate::simulator::RequestSimulator;
use crate::worker::{CampaignWorker, RunOutcome, WorkerContext};

pub struct TrafficEngine {
    locks: CampaignLocks,
    registry: Arc<CampaignRegistry>,
    ledger: Arc<TrafficLedger>,
    tracker: Arc<StatusTracker>,
    log: CampaignLog,
    simulator: Arc<RequestSimulator>,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerConfig,
}

impl TrafficEngine {
    pub fn new(config: &AppConfig) -> TrafficResult<Self> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    pub fn with_clock(config: &AppConfig, clock: Arc<dyn Clock>) -> TrafficResult<Self> {
        let locks = CampaignLocks::new();
        let ledger = Arc::new(TrafficLedger::new(&config.storage, locks.clone()));
        let tracker = Arc::new(StatusTracker::new(ledger.clone()));

        Ok(Self {
            locks,
            registry: Arc::new(CampaignRegistry::new()),
            ledger,
            tracker,
            log: CampaignLog::new(config.storage.data_dir.clone()),
            simulator: Arc::new(RequestSimulator::new(config.simulation.clone())?),
            clock,
            scheduler: config.scheduler.clone(),
        })
    }

    pub fn ledger(&self) -> &Arc<TrafficLedger> {
        &self.ledger
    }

    pub fn tracker(&self) -> &Arc<StatusTracker> {
        &self.tracker
    }

    fn worker_context(&self) -> WorkerContext {
        WorkerContext {
            registry: self.registry.clone(),
            ledger: self.ledger.clone(),
            tracker: self.tracker.clone(),
            log: self.log.clone(),
            simulator: self.simulator.clone(),
            clock: self.clock.clone(),
            status_every: self.scheduler.status_every,
        }
    }

    /// Validate `config`, register a new run and spawn its worker. Must be
    /// called from within a tokio runtime.
    pub fn start(&self, config: CampaignConfig) -> TrafficResult<CampaignStatus> {
        let config = config.validated()?;
        let jitter = config
            .config
            .randomize_timing
            .then_some(self.scheduler.jitter);
        let scheduler = RateScheduler::new(
            config.requests_per_minute,
            config.duration_minutes,
            jitter,
            self.clock.now(),
        )?;
        let campaign_id = config.campaign_id.clone();

        let (token, status) = {
            let guard = self.locks.acquire(&campaign_id);
            let token = self
                .registry
                .register(&guard, config.config.enable_logging)?;
            match self.tracker.begin_run(&guard, &config) {
                Ok(status) => (token, status),
                Err(e) => {
                    self.registry.release(&guard, token);
                    return Err(e);
                }
            }
        };

        let worker = CampaignWorker::new(config, token, scheduler, self.worker_context());
        let task = tokio::spawn(worker.run());
        if self.registry.attach(&campaign_id, token, task).is_some() {
            // The run already ended; its task has nothing left to report.
            warn!(campaign_id = %campaign_id, "Run ended before its task was attached");
        }

        info!(campaign_id = %campaign_id, run = %token, "Campaign started");
        Ok(status)
    }

    /// Unregister the current run and mark it stopped. The worker notices at
    /// its next iteration and exits without writing.
    pub fn stop(&self, campaign_id: &str) -> TrafficResult<CampaignStatus> {
        validate_campaign_id(campaign_id)?;
        let (status, enable_logging) = {
            let guard = self.locks.acquire(campaign_id);
            let handle = self.registry.remove(&guard)?;
            info!(campaign_id = %campaign_id, run = %handle.token, "Campaign stop requested");
            let status = self
                .tracker
                .update_locked(&guard, RunStatus::Stopped, StatusPatch::finished())?;
            (status, handle.enable_logging)
        };

        metrics::counter!("traffic.campaigns_stopped").increment(1);
        if enable_logging {
            self.log_event(
                campaign_id,
                LogLevel::Info,
                &format!(
                    "Campaign stopped after {} requests ({} successful)",
                    status.total_requests, status.successful_requests
                ),
            );
        }
        Ok(status)
    }

    /// Stop every running campaign, returning the statuses that were written.
    pub fn stop_all(&self) -> Vec<CampaignStatus> {
        self.registry
            .active_campaigns()
            .into_iter()
            .filter_map(|campaign_id| match self.stop(&campaign_id) {
                Ok(status) => Some(status),
                Err(e) => {
                    warn!(campaign_id = %campaign_id, error = %e, "Stop failed");
                    None
                }
            })
            .collect()
    }

    /// Append an externally produced record.
    pub fn append(&self, campaign_id: &str, record: &TrafficRecord) -> TrafficResult<AppendOutcome> {
        self.ledger.append(campaign_id, record)
    }

    /// Current ledger contents; empty for a campaign that never ran.
    pub fn read(&self, campaign_id: &str) -> TrafficResult<LedgerSnapshot> {
        self.ledger.read(campaign_id)
    }

    pub fn status(&self, campaign_id: &str) -> TrafficResult<CampaignStatus> {
        self.tracker.get(campaign_id)
    }

    pub fn is_running(&self, campaign_id: &str) -> bool {
        self.registry.is_running(campaign_id)
    }

    pub fn active_campaigns(&self) -> Vec<String> {
        self.registry.active_campaigns()
    }

    /// Every campaign with persisted data, running or not.
    pub fn campaign_ids(&self) -> TrafficResult<Vec<String>> {
        self.ledger.campaign_ids()
    }

    pub fn campaign_log(&self, campaign_id: &str) -> TrafficResult<Vec<String>> {
        self.log.read(campaign_id)
    }

    /// Wait for the current run to finish. `None` if no run is registered or
    /// another caller is already waiting on it.
    pub async fn wait(&self, campaign_id: &str) -> Option<RunOutcome> {
        let task = self.registry.take_task(campaign_id)?;
        match task.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Worker task did not finish cleanly");
                None
            }
        }
    }

    fn log_event(&self, campaign_id: &str, level: LogLevel, message: &str) {
        if let Err(e) = self.log.append(campaign_id, level, message) {
            warn!(campaign_id = %campaign_id, error = %e, "Campaign log write failed");
        }
    }
}
