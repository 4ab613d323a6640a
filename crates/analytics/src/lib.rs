//! Read-side views over campaign ledgers: monitor statistics, traffic
//! downloads and the campaign listing.

pub mod monitor;
pub mod report;

pub use monitor::{monitor, MonitorReport, TrafficStats};
pub use report::{download, list_campaigns, CampaignSummary, TrafficDownload};
