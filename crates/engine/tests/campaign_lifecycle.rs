//! End-to-end worker lifecycle against a temporary data dir, on paused tokio
//! time so a one-minute run finishes instantly.

use std::fs;
use std::path::Path;
use std::time::Duration;

use traffic_core::config::{AppConfig, StorageConfig};
use traffic_core::types::{CampaignConfig, RtbConfig, RunStatus};
use traffic_core::TrafficError;
use traffic_engine::{RunOutcome, TrafficEngine};

fn engine_in(dir: &Path) -> TrafficEngine {
    let config = AppConfig {
        storage: StorageConfig {
            data_dir: dir.to_path_buf(),
            retry_backoff_ms: 1,
            ..StorageConfig::default()
        },
        ..AppConfig::default()
    };
    TrafficEngine::new(&config).unwrap()
}

fn campaign(id: &str, rpm: u32, duration_minutes: Option<u32>) -> CampaignConfig {
    let mut config = CampaignConfig::new(id, "https://example.com/landing", rpm);
    config.duration_minutes = duration_minutes;
    config.geo_locations = vec!["United States".to_string(), "Canada".to_string()];
    config.rtb_config = Some(RtbConfig::default());
    config.seed = Some(11);
    config
}

async fn wait_for_records(engine: &TrafficEngine, id: &str, at_least: usize) -> usize {
    for _ in 0..600 {
        let seen = engine.read(id).unwrap().len();
        if seen >= at_least {
            return seen;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
    panic!("campaign {id} never reached {at_least} records");
}

#[tokio::test(start_paused = true)]
async fn test_one_minute_at_sixty_rpm_emits_about_sixty() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    let started = engine.start(campaign("scenario-a", 60, Some(1))).unwrap();
    assert_eq!(started.status, RunStatus::Running);
    assert_eq!(started.total_requests, 0);

    let outcome = engine.wait("scenario-a").await.unwrap();
    let records = match outcome {
        RunOutcome::Completed { records } => records,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert!((48..=72).contains(&records), "{records}");

    let status = engine.status("scenario-a").unwrap();
    assert_eq!(status.status, RunStatus::Completed);
    assert_eq!(status.total_requests, records);
    assert_eq!(status.progress_percentage, 100.0);
    assert!(status.end_time.is_some());
    assert!(!engine.is_running("scenario-a"));

    let snapshot = engine.read("scenario-a").unwrap();
    assert_eq!(snapshot.len() as u64, records);
    assert_eq!(snapshot.counts().successful, status.successful_requests);
    for record in snapshot.records() {
        assert_eq!(record.campaign_id, "scenario-a");
        assert!(record.has_rtb());
    }

    let log = engine.campaign_log("scenario-a").unwrap();
    assert!(log.first().unwrap().contains("Traffic generation started"));
    assert!(log.last().unwrap().contains("Traffic generation completed"));
}

#[tokio::test(start_paused = true)]
async fn test_stop_after_five_records_adds_at_most_one_more() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("scenario-b", 60, None)).unwrap();
    let observed = wait_for_records(&engine, "scenario-b", 5).await;

    let stopped = engine.stop("scenario-b").unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert!(!engine.is_running("scenario-b"));

    tokio::time::sleep(Duration::from_secs(30)).await;
    let total = engine.read("scenario-b").unwrap().len();
    assert!(total <= observed + 1, "{total} > {observed} + 1");

    let status = engine.status("scenario-b").unwrap();
    assert_eq!(status.status, RunStatus::Stopped);
    assert_eq!(status.total_requests, total as u64);
}

#[tokio::test(start_paused = true)]
async fn test_second_stop_is_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("twice", 60, None)).unwrap();
    wait_for_records(&engine, "twice", 1).await;
    let first = engine.stop("twice").unwrap();

    assert!(matches!(
        engine.stop("twice"),
        Err(TrafficError::NotRunning(_))
    ));
    let after = engine.status("twice").unwrap();
    assert_eq!(after.end_time, first.end_time);
    assert_eq!(after.status, RunStatus::Stopped);

    assert!(matches!(
        engine.stop("never-started"),
        Err(TrafficError::NotRunning(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_adds_no_records() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("busy", 60, None)).unwrap();
    wait_for_records(&engine, "busy", 2).await;

    let before = engine.read("busy").unwrap().len();
    let err = engine.start(campaign("busy", 600, None)).unwrap_err();
    assert!(matches!(err, TrafficError::AlreadyRunning(_)));
    assert_eq!(engine.read("busy").unwrap().len(), before);
    assert_eq!(engine.active_campaigns(), vec!["busy".to_string()]);

    engine.stop("busy").unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop_supersedes_old_worker() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("again", 60, None)).unwrap();
    wait_for_records(&engine, "again", 3).await;
    engine.stop("again").unwrap();
    let carried = engine.read("again").unwrap().len();

    let restarted = engine.start(campaign("again", 60, Some(1))).unwrap();
    assert_eq!(restarted.status, RunStatus::Running);
    assert_eq!(restarted.total_requests, carried as u64);
    assert!(restarted.end_time.is_none());

    let outcome = engine.wait("again").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Completed { .. }));

    // Only the new worker wrote after the restart.
    let status = engine.status("again").unwrap();
    assert_eq!(status.status, RunStatus::Completed);
    assert_eq!(status.total_requests, carried as u64 + outcome.records());
}

#[tokio::test(start_paused = true)]
async fn test_never_started_campaign_reads_empty() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    let snapshot = engine.read("scenario-c").unwrap();
    assert!(snapshot.is_empty());
    assert!(matches!(
        engine.status("scenario-c"),
        Err(TrafficError::NotFound(_))
    ));
    assert!(engine.campaign_ids().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_campaigns_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("slow", 60, Some(1))).unwrap();
    engine.start(campaign("fast", 120, Some(1))).unwrap();

    let (slow, fast) = tokio::join!(engine.wait("slow"), engine.wait("fast"));
    let slow = slow.unwrap().records();
    let fast = fast.unwrap().records();
    assert!((48..=72).contains(&slow), "{slow}");
    assert!((96..=144).contains(&fast), "{fast}");

    for (id, expected) in [("slow", slow), ("fast", fast)] {
        let snapshot = engine.read(id).unwrap();
        assert_eq!(snapshot.len() as u64, expected);
        assert!(snapshot.records().all(|r| r.campaign_id == id));
        assert_eq!(engine.status(id).unwrap().total_requests, expected);
    }
    assert_eq!(
        engine.campaign_ids().unwrap(),
        vec!["fast".to_string(), "slow".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn test_invalid_envelope_rejected_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    assert!(matches!(
        engine.start(campaign("zero-rate", 0, Some(1))),
        Err(TrafficError::Configuration(_))
    ));
    assert!(matches!(
        engine.start(campaign("zero-duration", 60, Some(0))),
        Err(TrafficError::Configuration(_))
    ));
    assert!(matches!(
        engine.status("zero-rate"),
        Err(TrafficError::NotFound(_))
    ));
    assert!(engine.active_campaigns().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_storage_failure_moves_run_to_error() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("doomed", 60, None)).unwrap();
    wait_for_records(&engine, "doomed", 1).await;

    // A directory where the ledger file should be makes every read fail.
    let ledger_path = engine.ledger().ledger_path("doomed");
    fs::remove_file(&ledger_path).unwrap();
    fs::create_dir(&ledger_path).unwrap();

    let outcome = engine.wait("doomed").await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }), "{outcome:?}");

    let status = engine.status("doomed").unwrap();
    assert_eq!(status.status, RunStatus::Error);
    assert!(status.error.as_deref().unwrap().contains("Storage error"));
    assert!(status.end_time.is_some());
    assert!(!engine.is_running("doomed"));
}

#[tokio::test(start_paused = true)]
async fn test_disabled_logging_writes_no_campaign_log() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    let mut config = campaign("quiet", 60, Some(1));
    config.config.enable_logging = false;
    config.config.randomize_timing = false;
    engine.start(config).unwrap();

    let outcome = engine.wait("quiet").await.unwrap();
    assert_eq!(outcome, RunOutcome::Completed { records: 60 });
    assert!(engine.campaign_log("quiet").unwrap().is_empty());

    let mut config = campaign("quiet", 60, None);
    config.config.enable_logging = false;
    engine.start(config).unwrap();
    wait_for_records(&engine, "quiet", 63).await;
    let stopped = engine.stop("quiet").unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert!(engine.campaign_log("quiet").unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_logs_only_when_logging_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());

    engine.start(campaign("chatty", 60, None)).unwrap();
    wait_for_records(&engine, "chatty", 2).await;
    engine.stop("chatty").unwrap();

    let log = engine.campaign_log("chatty").unwrap();
    assert!(log.iter().any(|line| line.contains("Campaign stopped after")));
}

#[tokio::test(start_paused = true)]
async fn test_high_rate_keeps_pace_despite_latency() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_in(dir.path());
    assert!(AppConfig::default().simulation.simulate_latency);

    let mut config = campaign("fast-lane", 600, Some(1));
    config.seed = Some(3);
    engine.start(config).unwrap();

    let outcome = engine.wait("fast-lane").await.unwrap();
    let records = match outcome {
        RunOutcome::Completed { records } => records,
        other => panic!("unexpected outcome {other:?}"),
    };
    // Default latency is 100..=500 ms, well above the 100 ms interval.
    assert!((570..=630).contains(&records), "{records}");
    assert_eq!(engine.status("fast-lane").unwrap().total_requests, records);
}
