//! traffic-sim: run one or more campaign configurations and persist their
//! simulated RTB traffic.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use traffic_analytics::monitor;
use traffic_core::config::AppConfig;
use traffic_core::types::CampaignConfig;
use traffic_engine::TrafficEngine;

#[derive(Parser, Debug)]
#[command(name = "traffic-sim")]
#[command(about = "Simulated RTB traffic generator for configured campaigns")]
#[command(version)]
struct Cli {
    /// Campaign configuration files (JSON)
    #[arg(required = true)]
    campaigns: Vec<PathBuf>,

    /// Configuration file (TOML)
    #[arg(long, short, env = "TRAFFIC_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory (overrides config)
    #[arg(long, env = "TRAFFIC_SIM__STORAGE__DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Human-readable logs instead of JSON
    #[arg(long, default_value_t = false)]
    pretty: bool,

    /// Seconds between progress reports
    #[arg(long, default_value_t = 10)]
    progress_secs: u64,

    /// Print a monitor report per campaign to stdout when done
    #[arg(long, default_value_t = false)]
    report: bool,
}

fn init_tracing(pretty: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "traffic_sim=info,traffic_engine=info,traffic_storage=info".into()
    });
    if pretty {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}

fn load_campaign(path: &Path) -> anyhow::Result<CampaignConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading campaign file {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing campaign file {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.pretty);

    info!("traffic-sim starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }

    info!(
        data_dir = %config.storage.data_dir.display(),
        success_probability = config.simulation.success_probability,
        jitter = config.scheduler.jitter,
        "Configuration loaded"
    );

    let engine = Arc::new(TrafficEngine::new(&config)?);

    let mut started = Vec::new();
    let mut runs = JoinSet::new();
    for path in &cli.campaigns {
        let campaign = match load_campaign(path) {
            Ok(campaign) => campaign,
            Err(e) => {
                error!(path = %path.display(), error = %e, "Skipping campaign");
                continue;
            }
        };
        let campaign_id = campaign.campaign_id.clone();
        match engine.start(campaign) {
            Ok(status) => {
                info!(
                    campaign_id = %campaign_id,
                    rpm = ?status.requests_per_minute,
                    duration_minutes = ?status.duration_minutes,
                    "Campaign running"
                );
                started.push(campaign_id.clone());
                let engine = engine.clone();
                runs.spawn(async move {
                    let outcome = engine.wait(&campaign_id).await;
                    (campaign_id, outcome)
                });
            }
            Err(e) => error!(campaign_id = %campaign_id, error = %e, "Failed to start campaign"),
        }
    }

    if started.is_empty() {
        anyhow::bail!("no campaign could be started");
    }

    let mut progress = tokio::time::interval(Duration::from_secs(cli.progress_secs.max(1)));
    progress.tick().await;

    loop {
        tokio::select! {
            joined = runs.join_next() => match joined {
                None => break,
                Some(Ok((campaign_id, Some(outcome)))) => {
                    info!(campaign_id = %campaign_id, outcome = ?outcome, "Campaign finished");
                }
                Some(Ok((campaign_id, None))) => {
                    warn!(campaign_id = %campaign_id, "Campaign ended without an outcome");
                }
                Some(Err(e)) => error!(error = %e, "Run task failed"),
            },
            _ = progress.tick() => {
                for campaign_id in engine.active_campaigns() {
                    match engine.status(&campaign_id) {
                        Ok(status) => info!(
                            campaign_id = %campaign_id,
                            total = status.total_requests,
                            successful = status.successful_requests,
                            progress = status.progress_percentage,
                            "Progress"
                        ),
                        Err(e) => warn!(campaign_id = %campaign_id, error = %e, "Status unavailable"),
                    }
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, stopping all campaigns");
                let stopped = engine.stop_all();
                info!(stopped = stopped.len(), "Campaigns stopped");
            },
        }
    }

    if cli.report {
        for campaign_id in &started {
            let report = monitor(engine.ledger(), engine.tracker(), campaign_id, false)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    info!("traffic-sim finished");
    Ok(())
}
