//! Human-readable per-campaign activity log (`campaign.log`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use traffic_core::types::validate_campaign_id;
use traffic_core::{TrafficError, TrafficResult};

const LOG_FILE: &str = "campaign.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CampaignLog {
    data_dir: PathBuf,
}

impl CampaignLog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn path(&self, campaign_id: &str) -> PathBuf {
        self.data_dir.join(campaign_id).join(LOG_FILE)
    }

    /// Append one timestamped line. Newlines in `message` are flattened so
    /// every entry stays on a single line.
    pub fn append(&self, campaign_id: &str, level: LogLevel, message: &str) -> TrafficResult<()> {
        validate_campaign_id(campaign_id)?;
        let path = self.path(campaign_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| TrafficError::storage("create log dir", parent, e))?;
        }

        let line = format!(
            "{} [{}] {}\n",
            Utc::now().to_rfc3339(),
            level.as_str(),
            message.replace(['\n', '\r'], " ")
        );

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TrafficError::storage("open log", &path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| TrafficError::storage("write log", &path, e))
    }

    /// All lines of the campaign log; empty if nothing was logged.
    pub fn read(&self, campaign_id: &str) -> TrafficResult<Vec<String>> {
        validate_campaign_id(campaign_id)?;
        let path = self.path(campaign_id);
        match fs::read_to_string(&path) {
            Ok(text) => Ok(text.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(TrafficError::storage("read log", path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_appended_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = CampaignLog::new(dir.path());

        log.append("camp", LogLevel::Info, "started").unwrap();
        log.append("camp", LogLevel::Error, "disk\nfull").unwrap();

        let lines = log.read("camp").unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("[INFO] started"));
        assert!(lines[1].ends_with("[ERROR] disk full"));
        assert!(log.read("other").unwrap().is_empty());
    }
}
