use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `TRAFFIC_SIM__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// A ledger whose serialized size would exceed this is archived and restarted.
    #[serde(default = "default_rotate_bytes")]
    pub rotate_bytes: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

/// Outcome distribution of simulated requests.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "default_success_probability")]
    pub success_probability: f64,
    #[serde(default = "default_min_latency_ms")]
    pub min_latency_ms: u64,
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    #[serde(default = "default_min_response_bytes")]
    pub min_response_bytes: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: u64,
    #[serde(default = "default_error_codes")]
    pub error_codes: Vec<u16>,
    #[serde(default = "default_max_win_price")]
    pub max_win_price: f64,
    /// Sleep for the drawn latency inside each emission slot.
    #[serde(default = "default_simulate_latency")]
    pub simulate_latency: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Half-width of the uniform jitter factor applied when timing is randomized.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Persist a status snapshot after every n-th record.
    #[serde(default = "default_status_every")]
    pub status_every: u64,
}

// Default functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("traffic_data")
}
fn default_rotate_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    25
}
fn default_success_probability() -> f64 {
    0.85
}
fn default_min_latency_ms() -> u64 {
    100
}
fn default_max_latency_ms() -> u64 {
    500
}
fn default_min_response_bytes() -> u64 {
    512
}
fn default_max_response_bytes() -> u64 {
    16 * 1024
}
fn default_error_codes() -> Vec<u16> {
    vec![400, 403, 404, 408, 429, 500, 502, 503, 504]
}
fn default_max_win_price() -> f64 {
    5.0
}
fn default_simulate_latency() -> bool {
    true
}
fn default_jitter() -> f64 {
    0.2
}
fn default_status_every() -> u64 {
    1
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            rotate_bytes: default_rotate_bytes(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            success_probability: default_success_probability(),
            min_latency_ms: default_min_latency_ms(),
            max_latency_ms: default_max_latency_ms(),
            min_response_bytes: default_min_response_bytes(),
            max_response_bytes: default_max_response_bytes(),
            error_codes: default_error_codes(),
            max_win_price: default_max_win_price(),
            simulate_latency: default_simulate_latency(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            jitter: default_jitter(),
            status_every: default_status_every(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            simulation: SimulationConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Reject distributions the simulator cannot sample from.
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.success_probability) {
            return Err(format!(
                "success_probability must be within [0, 1], got {}",
                self.success_probability
            ));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err("min_latency_ms must not exceed max_latency_ms".to_string());
        }
        if self.min_response_bytes > self.max_response_bytes {
            return Err("min_response_bytes must not exceed max_response_bytes".to_string());
        }
        if self.error_codes.is_empty() {
            return Err("error_codes must not be empty".to_string());
        }
        Ok(())
    }
}

impl AppConfig {
    /// Load configuration from environment variables and an optional config file.
    pub fn load(file: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let builder = builder.add_source(
            config::Environment::with_prefix("TRAFFIC_SIM")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("simulation.error_codes"),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_simulation() {
        let config = AppConfig::default();
        assert_eq!(config.simulation.success_probability, 0.85);
        assert_eq!(config.storage.retry_attempts, 3);
        assert_eq!(config.scheduler.jitter, 0.2);
        assert!(config.simulation.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: AppConfig =
            serde_json::from_str(r#"{"storage": {"data_dir": "/tmp/x"}}"#).unwrap();
        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.storage.rotate_bytes, 50 * 1024 * 1024);
        assert_eq!(config.simulation.max_latency_ms, 500);
    }

    #[test]
    fn test_invalid_simulation_rejected() {
        let mut sim = SimulationConfig::default();
        sim.success_probability = 1.5;
        assert!(sim.validate().is_err());

        let mut sim = SimulationConfig::default();
        sim.min_latency_ms = 900;
        assert!(sim.validate().is_err());
    }
}
