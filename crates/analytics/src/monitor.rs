//! Live campaign monitoring: the status snapshot plus statistics computed
//! over every ledger entry, archives included.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;
use traffic_core::types::CampaignStatus;
use traffic_core::TrafficResult;
use traffic_storage::{LedgerEntries, StatusTracker, TrafficLedger};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrafficStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Percent of requests that succeeded.
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: Option<u64>,
    pub max_response_time_ms: Option<u64>,
    /// Records per minute between the first and last record timestamps.
    pub throughput_per_minute: f64,
    pub total_bids: u64,
    pub avg_win_price: Option<f64>,
    pub total_win_value: f64,
    pub by_geo: BTreeMap<String, u64>,
    pub by_status_code: BTreeMap<u16, u64>,
    pub first_request: Option<DateTime<Utc>>,
    pub last_request: Option<DateTime<Utc>>,
}

impl TrafficStats {
    /// Entries are read field by field so legacy records missing fields
    /// still count.
    pub fn from_entries(entries: &LedgerEntries) -> Self {
        let mut stats = Self::default();
        let mut response_total: u64 = 0;
        let mut response_samples: u64 = 0;

        for entry in entries.values() {
            stats.total_requests += 1;
            if entry.get("success").and_then(Value::as_bool) == Some(true) {
                stats.successful_requests += 1;
            }

            if let Some(ms) = entry.get("response_time").and_then(Value::as_u64) {
                response_total += ms;
                response_samples += 1;
                stats.min_response_time_ms = Some(stats.min_response_time_ms.map_or(ms, |m| m.min(ms)));
                stats.max_response_time_ms = Some(stats.max_response_time_ms.map_or(ms, |m| m.max(ms)));
            }

            if let Some(geo) = entry.get("geo_location").and_then(Value::as_str) {
                *stats.by_geo.entry(geo.to_string()).or_default() += 1;
            }
            if let Some(code) = entry
                .get("status_code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
            {
                *stats.by_status_code.entry(code).or_default() += 1;
            }

            if let Some(price) = entry.get("win_price").and_then(Value::as_f64) {
                stats.total_bids += 1;
                stats.total_win_value += price;
            }

            if let Some(ts) = entry
                .get("timestamp")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
            {
                stats.first_request = Some(stats.first_request.map_or(ts, |t| t.min(ts)));
                stats.last_request = Some(stats.last_request.map_or(ts, |t| t.max(ts)));
            }
        }

        stats.failed_requests = stats.total_requests - stats.successful_requests;
        if stats.total_requests > 0 {
            stats.success_rate =
                stats.successful_requests as f64 / stats.total_requests as f64 * 100.0;
        }
        if response_samples > 0 {
            stats.avg_response_time_ms = response_total as f64 / response_samples as f64;
        }
        if stats.total_bids > 0 {
            stats.avg_win_price = Some(stats.total_win_value / stats.total_bids as f64);
        }
        if let (Some(first), Some(last)) = (stats.first_request, stats.last_request) {
            let minutes = (last - first).num_milliseconds() as f64 / 60_000.0;
            if minutes > 0.0 && stats.total_requests > 1 {
                stats.throughput_per_minute = (stats.total_requests - 1) as f64 / minutes;
            }
        }
        stats
    }
}

/// RFC 3339, or the naive ISO form older writers produced (read as UTC).
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub status: CampaignStatus,
    pub is_active: bool,
    pub stats: TrafficStats,
    pub generated_at: DateTime<Utc>,
}

/// Status plus ledger statistics. `NotFound` for a campaign that never ran;
/// `is_active` comes from the caller, which owns the registry.
pub fn monitor(
    ledger: &TrafficLedger,
    tracker: &StatusTracker,
    campaign_id: &str,
    is_active: bool,
) -> TrafficResult<MonitorReport> {
    let status = tracker.get(campaign_id)?;
    let snapshot = ledger.read_with_archives(campaign_id)?;
    let stats = TrafficStats::from_entries(&snapshot.entries);
    debug!(
        campaign_id = %campaign_id,
        total = stats.total_requests,
        success_rate = stats.success_rate,
        "Monitor report computed"
    );

    Ok(MonitorReport {
        status,
        is_active,
        stats,
        generated_at: Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use traffic_core::config::StorageConfig;
    use traffic_core::TrafficError;
    use traffic_storage::CampaignLocks;

    fn entries(values: Vec<Value>) -> LedgerEntries {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (format!("r{i}"), v))
            .collect()
    }

    #[test]
    fn test_empty_ledger_stats() {
        let stats = TrafficStats::from_entries(&LedgerEntries::new());
        assert_eq!(stats.total_requests, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.avg_win_price.is_none());
        assert!(stats.first_request.is_none());
    }

    #[test]
    fn test_stats_over_mixed_entries() {
        let stats = TrafficStats::from_entries(&entries(vec![
            json!({
                "timestamp": "2024-01-01T00:00:00Z",
                "geo_location": "Canada",
                "success": true,
                "status_code": 200,
                "response_time": 100,
                "win_price": 1.5
            }),
            json!({
                "timestamp": "2024-01-01T00:00:30Z",
                "geo_location": "Canada",
                "success": false,
                "status_code": 503,
                "response_time": 300
            }),
            json!({
                "timestamp": "2024-01-01T00:01:00",
                "geo_location": "Germany",
                "success": true,
                "status_code": 200,
                "response_time": 200,
                "win_price": 2.5
            }),
            // Legacy entry with almost nothing in it.
            json!({"campaign_id": "c"}),
        ]));

        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.successful_requests, 2);
        assert_eq!(stats.failed_requests, 2);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.avg_response_time_ms, 200.0);
        assert_eq!(stats.min_response_time_ms, Some(100));
        assert_eq!(stats.max_response_time_ms, Some(300));
        assert_eq!(stats.total_bids, 2);
        assert_eq!(stats.avg_win_price, Some(2.0));
        assert_eq!(stats.by_geo["Canada"], 2);
        assert_eq!(stats.by_status_code[&200], 2);
        assert_eq!(stats.by_status_code[&503], 1);
        // Four records over one minute.
        assert_eq!(stats.throughput_per_minute, 3.0);
    }

    #[test]
    fn test_monitor_requires_status() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            data_dir: dir.path().to_path_buf(),
            ..StorageConfig::default()
        };
        let ledger = std::sync::Arc::new(TrafficLedger::new(&config, CampaignLocks::new()));
        let tracker = StatusTracker::new(ledger.clone());

        assert!(matches!(
            monitor(&ledger, &tracker, "ghost", false),
            Err(TrafficError::NotFound(_))
        ));
    }
}
