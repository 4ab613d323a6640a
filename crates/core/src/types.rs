use crate::error::{TrafficError, TrafficResult};
use crate::openrtb::{BidRequest, Device, Impression, Site, User};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle state of a campaign run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Draft,
    Running,
    Completed,
    Stopped,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped | Self::Error)
    }

    /// Transitions allowed during a run. Re-entering `Running` from a
    /// terminal state is only possible through a fresh start.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        match (self, next) {
            (Self::Draft, Self::Running) => true,
            (Self::Running, _) => next != Self::Draft,
            (from, to) if from.is_terminal() => from == to,
            _ => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Campaign ids double as directory names, so they are restricted to a
/// filesystem-safe alphabet.
pub fn validate_campaign_id(campaign_id: &str) -> TrafficResult<()> {
    let valid = !campaign_id.is_empty()
        && campaign_id.len() <= 128
        && campaign_id != "."
        && campaign_id != ".."
        && campaign_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TrafficError::Configuration(format!(
            "invalid campaign id {campaign_id:?}"
        )))
    }
}

/// Per-run generation switches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationOptions {
    #[serde(default = "default_true")]
    pub randomize_timing: bool,
    #[serde(default = "default_true")]
    pub enable_logging: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            randomize_timing: true,
            enable_logging: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// RTB generation pools and flags. Missing fields take their defaults on
/// deserialization; empty pools are replaced by [`RtbConfig::resolved`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RtbConfig {
    #[serde(default = "default_device_brand")]
    pub device_brand: String,
    #[serde(default = "default_device_models")]
    pub device_models: Vec<String>,
    #[serde(default = "default_ad_formats")]
    pub ad_formats: Vec<String>,
    #[serde(default = "default_app_categories")]
    pub app_categories: Vec<String>,
    #[serde(default = "default_true")]
    pub generate_adid: bool,
    #[serde(default = "default_true")]
    pub simulate_bid_requests: bool,
    #[serde(default = "default_banner_w")]
    pub banner_w: u32,
    #[serde(default = "default_banner_h")]
    pub banner_h: u32,
    #[serde(default = "default_bidfloor")]
    pub bidfloor: f64,
    #[serde(default = "default_bidfloorcur")]
    pub bidfloorcur: String,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub site_name: Option<String>,
    #[serde(default)]
    pub site_domain: Option<String>,
    #[serde(default)]
    pub ua: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default = "default_auction_type")]
    pub at: u32,
    #[serde(default = "default_tmax")]
    pub tmax: u32,
    #[serde(default = "default_cur")]
    pub cur: Vec<String>,
}

fn default_device_brand() -> String {
    "samsung".to_string()
}
fn default_device_models() -> Vec<String> {
    vec!["Galaxy S24".to_string()]
}
fn default_ad_formats() -> Vec<String> {
    vec!["banner".to_string()]
}
fn default_app_categories() -> Vec<String> {
    vec!["IAB9".to_string()]
}
fn default_banner_w() -> u32 {
    300
}
fn default_banner_h() -> u32 {
    250
}
fn default_bidfloor() -> f64 {
    0.05
}
fn default_bidfloorcur() -> String {
    "USD".to_string()
}
fn default_auction_type() -> u32 {
    1
}
fn default_tmax() -> u32 {
    120
}
fn default_cur() -> Vec<String> {
    vec!["USD".to_string()]
}

impl Default for RtbConfig {
    fn default() -> Self {
        Self {
            device_brand: default_device_brand(),
            device_models: default_device_models(),
            ad_formats: default_ad_formats(),
            app_categories: default_app_categories(),
            generate_adid: true,
            simulate_bid_requests: true,
            banner_w: default_banner_w(),
            banner_h: default_banner_h(),
            bidfloor: default_bidfloor(),
            bidfloorcur: default_bidfloorcur(),
            site_id: None,
            site_name: None,
            site_domain: None,
            ua: None,
            ip: None,
            user_id: None,
            at: default_auction_type(),
            tmax: default_tmax(),
            cur: default_cur(),
        }
    }
}

impl RtbConfig {
    /// Substitute defaults for explicitly empty pools.
    pub fn resolved(mut self) -> Self {
        if self.device_brand.trim().is_empty() {
            self.device_brand = default_device_brand();
        }
        if self.device_models.is_empty() {
            self.device_models = default_device_models();
        }
        if self.ad_formats.is_empty() {
            self.ad_formats = default_ad_formats();
        }
        if self.app_categories.is_empty() {
            self.app_categories = default_app_categories();
        }
        if self.cur.is_empty() {
            self.cur = default_cur();
        }
        if self.bidfloorcur.trim().is_empty() {
            self.bidfloorcur = default_bidfloorcur();
        }
        self
    }
}

/// Campaign traffic configuration handed over by the campaign CRUD layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignConfig {
    pub campaign_id: String,
    pub target_url: String,
    pub requests_per_minute: u32,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default = "default_geo_locations")]
    pub geo_locations: Vec<String>,
    #[serde(default)]
    pub rtb_config: Option<RtbConfig>,
    #[serde(default)]
    pub config: GenerationOptions,
    #[serde(default)]
    pub user_profile_ids: Vec<String>,
    #[serde(default)]
    pub profile_user_counts: BTreeMap<String, u32>,
    /// Seeds the worker RNG for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_geo_locations() -> Vec<String> {
    vec!["United States".to_string()]
}

impl CampaignConfig {
    pub fn new(campaign_id: impl Into<String>, target_url: impl Into<String>, rpm: u32) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            target_url: target_url.into(),
            requests_per_minute: rpm,
            duration_minutes: None,
            geo_locations: default_geo_locations(),
            rtb_config: None,
            config: GenerationOptions::default(),
            user_profile_ids: Vec::new(),
            profile_user_counts: BTreeMap::new(),
            seed: None,
        }
    }

    pub fn total_profile_users(&self) -> u64 {
        self.user_profile_ids
            .iter()
            .map(|id| u64::from(self.profile_user_counts.get(id).copied().unwrap_or(0)))
            .sum()
    }

    /// Check the rate envelope and normalize pools. Runs before a worker exists.
    pub fn validated(mut self) -> TrafficResult<Self> {
        validate_campaign_id(&self.campaign_id)?;
        if self.target_url.trim().is_empty() {
            return Err(TrafficError::Configuration(
                "target_url must not be empty".to_string(),
            ));
        }
        if self.requests_per_minute == 0 {
            return Err(TrafficError::Configuration(
                "Requests per minute must be greater than 0".to_string(),
            ));
        }
        if self.duration_minutes == Some(0) {
            return Err(TrafficError::Configuration(
                "Duration must be greater than 0".to_string(),
            ));
        }
        self.geo_locations.retain(|g| !g.trim().is_empty());
        if self.geo_locations.is_empty() {
            self.geo_locations = default_geo_locations();
        }
        self.rtb_config = self.rtb_config.map(RtbConfig::resolved);
        Ok(self)
    }
}

/// Bid request objects stored as separate top-level nodes of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtbFields {
    pub rtb_id: String,
    pub rtb_imp: Vec<Impression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtb_site: Option<Site>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtb_device: Option<Device>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtb_user: Option<User>,
    pub rtb_auction_type: u32,
    pub rtb_timeout: u32,
    pub rtb_currency: Vec<String>,
}

impl From<&BidRequest> for RtbFields {
    fn from(request: &BidRequest) -> Self {
        Self {
            rtb_id: request.id.clone(),
            rtb_imp: request.imp.clone(),
            rtb_site: request.site.clone(),
            rtb_device: request.device.clone(),
            rtb_user: request.user.clone(),
            rtb_auction_type: request.at,
            rtb_timeout: request.tmax,
            rtb_currency: request.cur.clone(),
        }
    }
}

/// One simulated request as persisted in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub campaign_id: String,
    pub target_url: String,
    pub geo_location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile_id: Option<String>,
    #[serde(flatten)]
    pub rtb: Option<RtbFields>,
    /// Full bid request kept for readers of the nested layout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtb_data: Option<BidRequest>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub response_time: u64,
    #[serde(default)]
    pub response_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TrafficRecord {
    pub fn has_rtb(&self) -> bool {
        self.rtb.is_some() || self.rtb_data.is_some()
    }
}

/// Persisted status snapshot of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStatus {
    pub campaign_id: String,
    pub status: RunStatus,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub successful_requests: u64,
    #[serde(default)]
    pub progress_percentage: f64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requests_per_minute: Option<u32>,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CampaignStatus {
    pub fn draft(campaign_id: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            status: RunStatus::Draft,
            total_requests: 0,
            successful_requests: 0,
            progress_percentage: 0.0,
            start_time: None,
            end_time: None,
            last_activity_time: None,
            requests_per_minute: None,
            duration_minutes: None,
            error: None,
        }
    }

    pub fn failed_requests(&self) -> u64 {
        self.total_requests.saturating_sub(self.successful_requests)
    }
}

/// Optional fields merged into a status snapshot on update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusPatch {
    pub progress_percentage: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub last_activity_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StatusPatch {
    pub fn progress(progress_percentage: f64) -> Self {
        Self {
            progress_percentage: Some(progress_percentage),
            last_activity_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn finished() -> Self {
        Self {
            end_time: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn apply(self, status: &mut CampaignStatus) {
        if let Some(p) = self.progress_percentage {
            status.progress_percentage = p.clamp(0.0, 100.0);
        }
        if self.start_time.is_some() {
            status.start_time = self.start_time;
        }
        if self.end_time.is_some() {
            status.end_time = self.end_time;
        }
        if self.last_activity_time.is_some() {
            status.last_activity_time = self.last_activity_time;
        }
        if self.error.is_some() {
            status.error = self.error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> CampaignConfig {
        let mut config = CampaignConfig::new("camp-1", "https://example.com", 10);
        config.duration_minutes = Some(1);
        config
    }

    #[test]
    fn test_status_transitions() {
        assert!(RunStatus::Draft.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Error));
        assert!(!RunStatus::Stopped.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Stopped));
        assert!(RunStatus::Stopped.can_transition_to(RunStatus::Stopped));
        assert!(!RunStatus::Draft.can_transition_to(RunStatus::Completed));
    }

    #[test]
    fn test_config_validation() {
        assert!(sample_config().validated().is_ok());

        let mut zero_rate = sample_config();
        zero_rate.requests_per_minute = 0;
        assert!(matches!(
            zero_rate.validated(),
            Err(TrafficError::Configuration(_))
        ));

        let mut zero_duration = sample_config();
        zero_duration.duration_minutes = Some(0);
        assert!(matches!(
            zero_duration.validated(),
            Err(TrafficError::Configuration(_))
        ));

        let mut unbounded = sample_config();
        unbounded.duration_minutes = None;
        assert!(unbounded.validated().is_ok());

        let mut bad_id = sample_config();
        bad_id.campaign_id = "../etc".to_string();
        assert!(bad_id.validated().is_err());
    }

    #[test]
    fn test_empty_pools_resolved() {
        let mut config = sample_config();
        config.geo_locations = vec![];
        config.rtb_config = Some(RtbConfig {
            device_models: vec![],
            ad_formats: vec![],
            app_categories: vec![],
            ..RtbConfig::default()
        });

        let config = config.validated().unwrap();
        assert_eq!(config.geo_locations, vec!["United States".to_string()]);
        let rtb = config.rtb_config.unwrap();
        assert_eq!(rtb.device_models, vec!["Galaxy S24".to_string()]);
        assert_eq!(rtb.ad_formats, vec!["banner".to_string()]);
        assert_eq!(rtb.app_categories, vec!["IAB9".to_string()]);
    }

    #[test]
    fn test_config_from_crud_payload() {
        let json = r#"{
            "campaign_id": "test_campaign_1",
            "target_url": "https://example.com",
            "requests_per_minute": 10,
            "duration_minutes": 1,
            "rtb_config": {"device_brand": "samsung", "generate_adid": true},
            "config": {"randomize_timing": false},
            "user_profile_ids": ["p1", "p2"],
            "profile_user_counts": {"p1": 3, "p2": 7}
        }"#;
        let config: CampaignConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.geo_locations, vec!["United States".to_string()]);
        assert_eq!(config.total_profile_users(), 10);
        assert!(!config.config.randomize_timing);
        assert!(config.config.enable_logging);
        let rtb = config.rtb_config.unwrap();
        assert_eq!(rtb.ad_formats, vec!["banner".to_string()]);
        assert_eq!(rtb.tmax, 120);
    }

    #[test]
    fn test_record_without_rtb_has_no_flattened_nodes() {
        let json = r#"{
            "id": "request_001",
            "timestamp": "2024-01-01T00:00:00Z",
            "campaign_id": "c",
            "target_url": "https://example.com/1",
            "geo_location": "Canada",
            "success": true,
            "status_code": 200,
            "response_time": 150,
            "response_size": 1024
        }"#;
        let record: TrafficRecord = serde_json::from_str(json).unwrap();
        assert!(record.rtb.is_none());
        assert!(!record.has_rtb());

        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("rtb_id").is_none());
        assert_eq!(value["status_code"], 200);
    }

    #[test]
    fn test_patch_clamps_progress() {
        let mut status = CampaignStatus::draft("c");
        StatusPatch::progress(140.0).apply(&mut status);
        assert_eq!(status.progress_percentage, 100.0);
        assert!(status.last_activity_time.is_some());
    }
}
