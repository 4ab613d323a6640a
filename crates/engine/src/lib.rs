//! Campaign traffic-generation engine: one tokio task per running campaign,
//! pacing simulated RTB requests into the ledger.

pub mod engine;
pub mod registry;
pub mod scheduler;
pub mod simulator;
pub mod worker;

pub use engine::TrafficEngine;
pub use registry::{CampaignRegistry, RunToken};
pub use scheduler::{Clock, RateScheduler, TokioClock};
pub use simulator::RequestSimulator;
pub use worker::{CampaignWorker, RunOutcome};
