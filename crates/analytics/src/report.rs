//! Traffic downloads and the campaign listing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;
use traffic_core::types::RunStatus;
use traffic_core::{TrafficError, TrafficResult};
use traffic_storage::{LedgerEntries, StatusTracker, TrafficLedger};

/// Full id-keyed record map of a campaign with summary metadata.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficDownload {
    pub campaign_id: String,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_updated: Option<DateTime<Utc>>,
    pub traffic: LedgerEntries,
}

/// Current ledger only, or the whole history with rotation archives first.
pub fn download(
    ledger: &TrafficLedger,
    campaign_id: &str,
    include_archives: bool,
) -> TrafficResult<TrafficDownload> {
    let snapshot = if include_archives {
        ledger.read_with_archives(campaign_id)?
    } else {
        ledger.read(campaign_id)?
    };
    let counts = snapshot.counts();

    Ok(TrafficDownload {
        campaign_id: snapshot.campaign_id,
        total_requests: counts.total,
        successful_requests: counts.successful,
        last_updated: snapshot.last_modified,
        traffic: snapshot.entries,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignSummary {
    pub campaign_id: String,
    /// `None` when only a ledger exists.
    pub status: Option<RunStatus>,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub last_activity_time: Option<DateTime<Utc>>,
}

/// Every campaign with persisted data. Counts come from the ledger so they
/// match downloads even for campaigns without a status file.
pub fn list_campaigns(
    ledger: &TrafficLedger,
    tracker: &StatusTracker,
) -> TrafficResult<Vec<CampaignSummary>> {
    let mut summaries = Vec::new();
    for campaign_id in ledger.campaign_ids()? {
        let counts = ledger.counts(&campaign_id)?;
        let status = match tracker.get(&campaign_id) {
            Ok(status) => Some(status),
            Err(TrafficError::NotFound(_)) => None,
            Err(e) => {
                warn!(campaign_id = %campaign_id, error = %e, "Unreadable status");
                None
            }
        };

        summaries.push(CampaignSummary {
            total_requests: counts.total,
            successful_requests: counts.successful,
            status: status.as_ref().map(|s| s.status),
            last_activity_time: status.and_then(|s| s.last_activity_time),
            campaign_id,
        });
    }
    Ok(summaries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use traffic_core::config::StorageConfig;
    use traffic_core::types::{CampaignConfig, StatusPatch, TrafficRecord};
    use traffic_storage::CampaignLocks;

    fn setup(dir: &std::path::Path, rotate_bytes: u64) -> (Arc<TrafficLedger>, StatusTracker) {
        let config = StorageConfig {
            data_dir: dir.to_path_buf(),
            rotate_bytes,
            retry_backoff_ms: 1,
            ..StorageConfig::default()
        };
        let ledger = Arc::new(TrafficLedger::new(&config, CampaignLocks::new()));
        let tracker = StatusTracker::new(ledger.clone());
        (ledger, tracker)
    }

    fn record(campaign_id: &str, id: &str, success: bool) -> TrafficRecord {
        let status_code = if success { 200 } else { 502 };
        serde_json::from_value(serde_json::json!({
            "id": id,
            "timestamp": "2024-03-01T12:00:00Z",
            "campaign_id": campaign_id,
            "target_url": "https://example.com",
            "geo_location": "United States",
            "success": success,
            "status_code": status_code,
            "response_time": 150,
        }))
        .unwrap()
    }

    #[test]
    fn test_download_of_unknown_campaign_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _) = setup(dir.path(), u64::MAX);

        let download = download(&ledger, "nothing", true).unwrap();
        assert_eq!(download.total_requests, 0);
        assert!(download.traffic.is_empty());
        assert!(download.last_updated.is_none());
    }

    #[test]
    fn test_download_with_and_without_archives() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, _) = setup(dir.path(), 1200);
        for i in 0..10 {
            ledger
                .append("big", &record("big", &format!("r{i}"), i % 2 == 0))
                .unwrap();
        }

        let full = download(&ledger, "big", true).unwrap();
        assert_eq!(full.total_requests, 10);
        assert_eq!(full.successful_requests, 5);
        assert_eq!(full.traffic.keys().next().map(String::as_str), Some("r0"));

        let current = download(&ledger, "big", false).unwrap();
        assert!(current.total_requests < 10);
        assert!(current.last_updated.is_some());

        let json = serde_json::to_value(&full).unwrap();
        assert_eq!(json["traffic"]["r3"]["status_code"], 502);
    }

    #[test]
    fn test_listing_merges_status_and_counts() {
        let dir = tempfile::tempdir().unwrap();
        let (ledger, tracker) = setup(dir.path(), u64::MAX);

        {
            let guard = ledger.locks().acquire("with-status");
            tracker
                .begin_run(&guard, &CampaignConfig::new("with-status", "https://example.com", 60))
                .unwrap();
        }
        ledger.append("with-status", &record("with-status", "a", true)).unwrap();
        tracker
            .update("with-status", RunStatus::Completed, StatusPatch::finished())
            .unwrap();
        ledger.append("ledger-only", &record("ledger-only", "b", false)).unwrap();

        let listing = list_campaigns(&ledger, &tracker).unwrap();
        assert_eq!(listing.len(), 2);

        assert_eq!(listing[0].campaign_id, "ledger-only");
        assert_eq!(listing[0].status, None);
        assert_eq!(listing[0].total_requests, 1);
        assert_eq!(listing[0].successful_requests, 0);

        assert_eq!(listing[1].campaign_id, "with-status");
        assert_eq!(listing[1].status, Some(RunStatus::Completed));
        assert_eq!(listing[1].successful_requests, 1);
        assert!(listing[1].last_activity_time.is_some());
    }
}
