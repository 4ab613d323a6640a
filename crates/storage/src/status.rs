//! Campaign status snapshots. Counters are never incremented in place: every
//! update rescans the ledger so the summary cannot drift from the records.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use traffic_core::types::{
    validate_campaign_id, CampaignConfig, CampaignStatus, RunStatus, StatusPatch,
};
use traffic_core::{TrafficError, TrafficResult};

use crate::fs::{read_optional, write_atomic};
use crate::ledger::{TrafficLedger, STATUS_FILE};
use crate::locks::CampaignGuard;

pub struct StatusTracker {
    ledger: Arc<TrafficLedger>,
    snapshots: DashMap<String, CampaignStatus>,
}

impl StatusTracker {
    pub fn new(ledger: Arc<TrafficLedger>) -> Self {
        Self {
            ledger,
            snapshots: DashMap::new(),
        }
    }

    pub fn status_path(&self, campaign_id: &str) -> PathBuf {
        self.ledger.campaign_dir(campaign_id).join(STATUS_FILE)
    }

    /// Last successfully computed snapshot: memory first, then the persisted
    /// file. A campaign that never started is `NotFound`.
    pub fn get(&self, campaign_id: &str) -> TrafficResult<CampaignStatus> {
        validate_campaign_id(campaign_id)?;
        if let Some(snapshot) = self.snapshots.get(campaign_id) {
            return Ok(snapshot.clone());
        }
        self.load(campaign_id)?
            .ok_or_else(|| TrafficError::NotFound(campaign_id.to_string()))
    }

    fn load(&self, campaign_id: &str) -> TrafficResult<Option<CampaignStatus>> {
        let path = self.status_path(campaign_id);
        let bytes = self
            .ledger
            .retry_policy()
            .run("read status", &path, || read_optional(&path))?;
        match bytes {
            Some(bytes) => {
                let status: CampaignStatus = serde_json::from_slice(&bytes)?;
                self.snapshots
                    .insert(campaign_id.to_string(), status.clone());
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    fn current(&self, campaign_id: &str) -> TrafficResult<CampaignStatus> {
        match self.get(campaign_id) {
            Ok(status) => Ok(status),
            Err(TrafficError::NotFound(_)) => Ok(CampaignStatus::draft(campaign_id)),
            // A damaged status file is rebuilt from the ledger on the next write.
            Err(TrafficError::Serialization(_)) => Ok(CampaignStatus::draft(campaign_id)),
            Err(e) => Err(e),
        }
    }

    /// Start a fresh run: any prior state moves to `running` with reset
    /// timestamps. Only the registry calls this, from `start`.
    pub fn begin_run(
        &self,
        guard: &CampaignGuard,
        config: &CampaignConfig,
    ) -> TrafficResult<CampaignStatus> {
        let campaign_id = guard.campaign_id();
        let counts = self.ledger.counts(campaign_id)?;
        let now = Utc::now();

        let status = CampaignStatus {
            campaign_id: campaign_id.to_string(),
            status: RunStatus::Running,
            total_requests: counts.total,
            successful_requests: counts.successful,
            progress_percentage: 0.0,
            start_time: Some(now),
            end_time: None,
            last_activity_time: Some(now),
            requests_per_minute: Some(config.requests_per_minute),
            duration_minutes: config.duration_minutes,
            error: None,
        };
        self.persist(&status)?;
        info!(campaign_id = %campaign_id, "Campaign run started");
        Ok(status)
    }

    /// Recompute counts from the ledger, merge `patch`, and persist.
    pub fn update(
        &self,
        campaign_id: &str,
        status: RunStatus,
        patch: StatusPatch,
    ) -> TrafficResult<CampaignStatus> {
        validate_campaign_id(campaign_id)?;
        let guard = self.ledger.locks().acquire(campaign_id);
        self.update_locked(&guard, status, patch)
    }

    pub fn update_locked(
        &self,
        guard: &CampaignGuard,
        next: RunStatus,
        patch: StatusPatch,
    ) -> TrafficResult<CampaignStatus> {
        let campaign_id = guard.campaign_id();
        let mut snapshot = self.current(campaign_id)?;

        if !snapshot.status.can_transition_to(next) {
            return Err(TrafficError::InvalidTransition {
                campaign_id: campaign_id.to_string(),
                from: snapshot.status,
                to: next,
            });
        }

        // A run failing on its ledger must still be able to report `error`,
        // with the last counts that could be computed.
        match self.ledger.counts(campaign_id) {
            Ok(counts) => {
                snapshot.total_requests = counts.total;
                snapshot.successful_requests = counts.successful;
            }
            Err(e) if next == RunStatus::Error => {
                warn!(campaign_id = %campaign_id, error = %e, "Keeping previous counts");
            }
            Err(e) => return Err(e),
        }
        snapshot.status = next;
        patch.apply(&mut snapshot);

        self.persist(&snapshot)?;
        debug!(
            campaign_id = %campaign_id,
            status = %next,
            total = snapshot.total_requests,
            successful = snapshot.successful_requests,
            "Status updated"
        );
        Ok(snapshot)
    }

    /// Recompute counts for the current snapshot without touching its status.
    /// `None` if the campaign has no status yet.
    pub fn refresh_counts(&self, guard: &CampaignGuard) -> TrafficResult<Option<CampaignStatus>> {
        let campaign_id = guard.campaign_id();
        let mut snapshot = match self.get(campaign_id) {
            Ok(snapshot) => snapshot,
            Err(TrafficError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        let counts = self.ledger.counts(campaign_id)?;
        if counts.total == snapshot.total_requests
            && counts.successful == snapshot.successful_requests
        {
            return Ok(Some(snapshot));
        }
        snapshot.total_requests = counts.total;
        snapshot.successful_requests = counts.successful;
        self.persist(&snapshot)?;
        Ok(Some(snapshot))
    }

    fn persist(&self, status: &CampaignStatus) -> TrafficResult<()> {
        let path = self.status_path(&status.campaign_id);
        let bytes = serde_json::to_vec_pretty(status)?;
        self.ledger
            .retry_policy()
            .run("write status", &path, || write_atomic(&path, &bytes))?;
        // Only cache what made it to disk.
        self.snapshots
            .insert(status.campaign_id.clone(), status.clone());
        Ok(())
    }
}
