//! Running campaigns and the token of their current run.
//!
//! Every mutation takes a [`CampaignGuard`], so registry changes happen under
//! the same per-campaign lock as the status write that accompanies them.

use std::fmt;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use traffic_core::{TrafficError, TrafficResult};
use traffic_storage::CampaignGuard;
use uuid::Uuid;

use crate::worker::RunOutcome;

/// Identifies one run of a campaign. A worker whose token is no longer
/// registered belongs to a stopped run and must exit without writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunToken(Uuid);

impl RunToken {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for RunToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

#[derive(Debug)]
pub struct WorkerHandle {
    pub token: RunToken,
    pub started_at: DateTime<Utc>,
    /// Whether this run writes campaign log lines.
    pub enable_logging: bool,
    task: Option<JoinHandle<RunOutcome>>,
}

#[derive(Debug, Default)]
pub struct CampaignRegistry {
    handles: DashMap<String, WorkerHandle>,
}

impl CampaignRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the campaign for a new run.
    pub fn register(
        &self,
        guard: &CampaignGuard,
        enable_logging: bool,
    ) -> TrafficResult<RunToken> {
        match self.handles.entry(guard.campaign_id().to_string()) {
            Entry::Occupied(_) => Err(TrafficError::AlreadyRunning(
                guard.campaign_id().to_string(),
            )),
            Entry::Vacant(slot) => {
                let token = RunToken::new();
                slot.insert(WorkerHandle {
                    token,
                    started_at: Utc::now(),
                    enable_logging,
                    task: None,
                });
                Ok(token)
            }
        }
    }

    /// Attach the spawned task to its run. If the run already ended the task
    /// is handed back to the caller.
    pub fn attach(
        &self,
        campaign_id: &str,
        token: RunToken,
        task: JoinHandle<RunOutcome>,
    ) -> Option<JoinHandle<RunOutcome>> {
        match self.handles.get_mut(campaign_id) {
            Some(mut handle) if handle.token == token => {
                handle.task = Some(task);
                None
            }
            _ => Some(task),
        }
    }

    pub fn is_current(&self, campaign_id: &str, token: RunToken) -> bool {
        self.handles
            .get(campaign_id)
            .map_or(false, |handle| handle.token == token)
    }

    pub fn is_running(&self, campaign_id: &str) -> bool {
        self.handles.contains_key(campaign_id)
    }

    /// Unregister whatever run is current. Used by Stop.
    pub fn remove(&self, guard: &CampaignGuard) -> TrafficResult<WorkerHandle> {
        self.handles
            .remove(guard.campaign_id())
            .map(|(_, handle)| handle)
            .ok_or_else(|| TrafficError::NotRunning(guard.campaign_id().to_string()))
    }

    /// Unregister only if `token` is still current. Used by a worker ending
    /// its own run; returns false if a Stop got there first.
    pub fn release(&self, guard: &CampaignGuard, token: RunToken) -> bool {
        self.handles
            .remove_if(guard.campaign_id(), |_, handle| handle.token == token)
            .is_some()
    }

    /// Take the join handle of the current run, if any, for awaiting.
    pub fn take_task(&self, campaign_id: &str) -> Option<JoinHandle<RunOutcome>> {
        self.handles
            .get_mut(campaign_id)
            .and_then(|mut handle| handle.task.take())
    }

    pub fn active_campaigns(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl WorkerHandle {
    pub fn into_task(self) -> Option<JoinHandle<RunOutcome>> {
        self.task
    }
}
