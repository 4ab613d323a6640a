//! Synthetic request generation and outcome sampling.
//!
//! The simulator is pure: it never sleeps and never touches storage. All
//! randomness comes from the caller's RNG so a seeded worker reproduces the
//! same sequence of payloads and outcomes.

use chrono::Utc;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::warn;
use traffic_core::config::SimulationConfig;
use traffic_core::openrtb::{
    device_type, Banner, BidRequest, Device, Geo, Impression, Native, Site, User, Video,
};
use traffic_core::types::{CampaignConfig, RtbConfig, RtbFields, TrafficRecord};
use traffic_core::{TrafficError, TrafficResult};
use url::Url;
use uuid::Uuid;

/// Desktop, macOS and iOS browsers used when the RTB config pins no `ua`.
pub const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_6 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.1.1 Mobile/15E148 Safari/604.1",
];

#[derive(Debug, Clone)]
pub struct RequestSimulator {
    settings: SimulationConfig,
}

impl RequestSimulator {
    pub fn new(settings: SimulationConfig) -> TrafficResult<Self> {
        settings.validate().map_err(TrafficError::Configuration)?;
        Ok(Self { settings })
    }

    pub fn settings(&self) -> &SimulationConfig {
        &self.settings
    }

    /// Generate a payload and sample its outcome. Generation failures become
    /// failed records (status 500) so the run keeps its cadence.
    pub fn simulate<R: Rng + ?Sized>(&self, config: &CampaignConfig, rng: &mut R) -> TrafficRecord {
        match self.generate_payload(config, rng) {
            Ok(record) => self.simulate_outcome(record, rng),
            Err(e) => {
                warn!(campaign_id = %config.campaign_id, error = %e, "Payload generation failed");
                metrics::counter!("traffic.simulation_failures").increment(1);
                failed_record(config, &e)
            }
        }
    }

    /// Build the request side of a record: geo, user agent, profile user and,
    /// when enabled, an OpenRTB bid request.
    pub fn generate_payload<R: Rng + ?Sized>(
        &self,
        config: &CampaignConfig,
        rng: &mut R,
    ) -> TrafficResult<TrafficRecord> {
        let geo = config
            .geo_locations
            .choose(rng)
            .cloned()
            .ok_or_else(|| TrafficError::Simulation("no geo locations configured".to_string()))?;

        let rtb = config
            .rtb_config
            .as_ref()
            .filter(|rtb| rtb.simulate_bid_requests);

        let user_agent = match rtb.and_then(|r| r.ua.clone()) {
            Some(ua) => ua,
            None => USER_AGENTS
                .choose(rng)
                .map(|ua| ua.to_string())
                .unwrap_or_default(),
        };

        let profile_user = pick_profile_user(config, rng)?;

        let bid_request = match rtb {
            Some(rtb) => Some(build_bid_request(
                rtb,
                config,
                &geo,
                &user_agent,
                profile_user.as_ref().map(|(_, user)| user.as_str()),
                rng,
            )?),
            None => None,
        };

        Ok(TrafficRecord {
            id: format!("req_{}", Uuid::new_v4().simple()),
            timestamp: Utc::now(),
            campaign_id: config.campaign_id.clone(),
            target_url: config.target_url.clone(),
            geo_location: geo,
            user_agent: Some(user_agent),
            user_profile_id: profile_user.map(|(profile, _)| profile),
            rtb: bid_request.as_ref().map(RtbFields::from),
            rtb_data: bid_request,
            success: false,
            status_code: 0,
            response_time: 0,
            response_size: 0,
            bid_id: None,
            win_price: None,
            currency: None,
            error: None,
        })
    }

    /// Sample latency, success, status code and size. Successful RTB requests
    /// also get a bid id and a win price at or above the bid floor.
    pub fn simulate_outcome<R: Rng + ?Sized>(
        &self,
        mut record: TrafficRecord,
        rng: &mut R,
    ) -> TrafficRecord {
        let s = &self.settings;

        record.response_time = rng.gen_range(s.min_latency_ms..=s.max_latency_ms);
        record.success = rng.gen_bool(s.success_probability);

        if record.success {
            record.status_code = 200;
            record.response_size = rng.gen_range(s.min_response_bytes..=s.max_response_bytes);
        } else {
            record.status_code = s.error_codes.choose(rng).copied().unwrap_or(500);
            record.response_size = rng.gen_range(0..=s.min_response_bytes);
        }

        if record.success {
            if let Some(request) = record.rtb_data.as_ref() {
                let floor = request.min_bidfloor().max(0.0);
                let ceiling = s.max_win_price.max(floor);
                let price = if ceiling > floor {
                    rng.gen_range(floor..=ceiling)
                } else {
                    floor
                };
                record.bid_id = Some(format!("bid_{}", Uuid::new_v4().simple()));
                record.win_price = Some((price * 10_000.0).round() / 10_000.0);
                record.currency = Some(request.currency().to_string());
            }
        }

        record
    }
}

/// Record stored in place of a payload that could not be generated.
pub fn failed_record(config: &CampaignConfig, error: &TrafficError) -> TrafficRecord {
    TrafficRecord {
        id: format!("req_{}", Uuid::new_v4().simple()),
        timestamp: Utc::now(),
        campaign_id: config.campaign_id.clone(),
        target_url: config.target_url.clone(),
        geo_location: config
            .geo_locations
            .first()
            .cloned()
            .unwrap_or_else(|| "unknown".to_string()),
        user_agent: None,
        user_profile_id: None,
        rtb: None,
        rtb_data: None,
        success: false,
        status_code: 500,
        response_time: 0,
        response_size: 0,
        bid_id: None,
        win_price: None,
        currency: None,
        error: Some(error.to_string()),
    }
}

/// Pick a profile weighted by its user count, then one of its users.
/// Returns `(profile_id, user_id)`.
fn pick_profile_user<R: Rng + ?Sized>(
    config: &CampaignConfig,
    rng: &mut R,
) -> TrafficResult<Option<(String, String)>> {
    if config.user_profile_ids.is_empty() {
        return Ok(None);
    }

    // u64 so the summed weights cannot overflow.
    let weights: Vec<u64> = config
        .user_profile_ids
        .iter()
        .map(|id| u64::from(config.profile_user_counts.get(id).copied().unwrap_or(0)))
        .collect();

    let index = if weights.iter().all(|w| *w == 0) {
        rng.gen_range(0..config.user_profile_ids.len())
    } else {
        WeightedIndex::new(&weights)
            .map_err(|e| TrafficError::Simulation(format!("profile weights: {e}")))?
            .sample(rng)
    };

    let profile = config.user_profile_ids[index].clone();
    let users = weights[index].max(1);
    let user = format!("{profile}_user_{}", rng.gen_range(1..=users));
    Ok(Some((profile, user)))
}

fn build_bid_request<R: Rng + ?Sized>(
    rtb: &RtbConfig,
    config: &CampaignConfig,
    geo: &str,
    user_agent: &str,
    profile_user: Option<&str>,
    rng: &mut R,
) -> TrafficResult<BidRequest> {
    let ad_format = rtb
        .ad_formats
        .choose(rng)
        .map(String::as_str)
        .unwrap_or("banner");
    let category = rtb
        .app_categories
        .choose(rng)
        .cloned()
        .ok_or_else(|| TrafficError::Simulation("no app categories configured".to_string()))?;
    let model = rtb.device_models.choose(rng).cloned();

    let mut imp = Impression {
        id: "1".to_string(),
        banner: None,
        video: None,
        native: None,
        bidfloor: rtb.bidfloor,
        bidfloorcur: rtb.bidfloorcur.clone(),
    };
    match ad_format.to_ascii_lowercase().as_str() {
        "video" => {
            imp.video = Some(Video {
                mimes: vec!["video/mp4".to_string()],
                w: Some(640),
                h: Some(480),
                minduration: Some(5),
                maxduration: Some(30),
            })
        }
        "native" => {
            imp.native = Some(Native {
                request: r#"{"ver":"1.2","assets":[]}"#.to_string(),
                ver: Some("1.2".to_string()),
            })
        }
        _ => {
            imp.banner = Some(Banner {
                w: Some(rtb.banner_w),
                h: Some(rtb.banner_h),
                pos: 1,
            })
        }
    }

    let domain = rtb
        .site_domain
        .clone()
        .unwrap_or_else(|| host_of(&config.target_url));
    let site = Site {
        id: Some(
            rtb.site_id
                .clone()
                .unwrap_or_else(|| format!("site_{}", rng.gen_range(1000..10_000))),
        ),
        name: Some(rtb.site_name.clone().unwrap_or_else(|| domain.clone())),
        domain: Some(domain),
        cat: Some(vec![category]),
        page: Some(config.target_url.clone()),
    };

    let brand = rtb.device_brand.clone();
    let os = if brand.eq_ignore_ascii_case("apple") {
        "iOS"
    } else {
        "Android"
    };
    let device = Device {
        ua: Some(user_agent.to_string()),
        ip: Some(rtb.ip.clone().unwrap_or_else(|| random_ip(rng))),
        geo: Some(Geo {
            country: Some(geo.to_string()),
            region: None,
            city: None,
        }),
        devicetype: Some(device_type::PHONE),
        make: Some(brand),
        model,
        os: Some(os.to_string()),
        ifa: rtb.generate_adid.then(|| advertising_id(rng)),
    };

    let user = User {
        id: Some(
            profile_user
                .map(str::to_string)
                .or_else(|| rtb.user_id.clone())
                .unwrap_or_else(|| format!("user_{}", rng.gen_range(100_000..1_000_000))),
        ),
        buyeruid: None,
        keywords: None,
    };

    Ok(BidRequest {
        id: format!("rtb_{}", Uuid::new_v4().simple()),
        imp: vec![imp],
        site: Some(site),
        device: Some(device),
        user: Some(user),
        tmax: rtb.tmax,
        at: rtb.at,
        cur: rtb.cur.clone(),
    })
}

/// Hyphenated v4-style advertising id drawn from `rng`.
fn advertising_id<R: Rng + ?Sized>(rng: &mut R) -> String {
    let bytes: [u8; 16] = rng.gen();
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

fn random_ip<R: Rng + ?Sized>(rng: &mut R) -> String {
    format!(
        "{}.{}.{}.{}",
        rng.gen_range(1..=223u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(0..=255u8),
        rng.gen_range(1..=254u8)
    )
}

/// Host of `target_url`, without port or credentials. Bare hosts are read as
/// `http://` URLs.
fn host_of(target_url: &str) -> String {
    Url::parse(target_url)
        .or_else(|_| Url::parse(&format!("http://{target_url}")))
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
