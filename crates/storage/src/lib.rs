//! Durable per-campaign persistence: the traffic ledger, status snapshots,
//! and the activity log, all serialized through one lock per campaign.

pub mod campaign_log;
mod fs;
pub mod ledger;
pub mod locks;
pub mod retry;
pub mod status;

pub use campaign_log::{CampaignLog, LogLevel};
pub use ledger::{AppendOutcome, LedgerCounts, LedgerEntries, LedgerSnapshot, Repair, TrafficLedger};
pub use locks::{CampaignGuard, CampaignLocks};
pub use retry::RetryPolicy;
pub use status::StatusTracker;
