//! Append-only, id-keyed traffic ledger: one JSON object per campaign,
//! rewritten atomically on every append.
//!
//! Historical files may hold a JSON array instead of an object, or may be
//! damaged outright. Both read and append paths classify the bytes first and
//! normalize to the canonical map before anything else looks at them:
//!
//! * object: used as is;
//! * array: each element is keyed on its own `id` (or `request_<n>`);
//! * anything else: treated as empty. On append the original bytes are kept
//!   in a timestamped `.backup` file before the ledger is overwritten.
//!
//! When a ledger grows past the rotation threshold its contents move to a
//! timestamped `.archive.json` file and a fresh ledger starts with the new
//! record. Counts always include the archives.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};
use traffic_core::config::StorageConfig;
use traffic_core::types::{validate_campaign_id, TrafficRecord};
use traffic_core::TrafficResult;

use crate::fs::{read_optional, write_atomic, write_new};
use crate::locks::{CampaignGuard, CampaignLocks};
use crate::retry::RetryPolicy;

pub type LedgerEntries = serde_json::Map<String, Value>;

const LEDGER_FILE: &str = "traffic.json";
pub(crate) const STATUS_FILE: &str = "status.json";
const ARCHIVE_PREFIX: &str = "traffic.";
const ARCHIVE_SUFFIX: &str = ".archive.json";

/// Record totals derived from ledger contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub total: u64,
    pub successful: u64,
}

impl LedgerCounts {
    pub fn of(entries: &LedgerEntries) -> Self {
        let successful = entries
            .values()
            .filter(|v| v.get("success").and_then(Value::as_bool) == Some(true))
            .count() as u64;
        Self {
            total: entries.len() as u64,
            successful,
        }
    }
}

impl std::ops::Add for LedgerCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            total: self.total + rhs.total,
            successful: self.successful + rhs.successful,
        }
    }
}

/// Non-fatal normalization applied while loading a ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Repair {
    None,
    /// A legacy array was converted to the id-keyed map.
    LegacyList { entries: usize },
    /// The file could not be parsed and was treated as empty. `backup` is set
    /// once the original bytes have been preserved.
    Unparseable { backup: Option<PathBuf> },
}

/// Outcome of one append.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendOutcome {
    /// Entries in the current ledger file after the append.
    pub entries: usize,
    /// An existing entry with the same id was overwritten.
    pub replaced: bool,
    pub repair: Repair,
    pub archived_to: Option<PathBuf>,
}

/// Normalized view of a campaign's current ledger file.
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    pub campaign_id: String,
    pub entries: LedgerEntries,
    pub last_modified: Option<DateTime<Utc>>,
    pub repair: Repair,
}

impl LedgerSnapshot {
    pub fn counts(&self) -> LedgerCounts {
        LedgerCounts::of(&self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<TrafficRecord> {
        self.entries
            .get(id)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Entries that decode as [`TrafficRecord`], in file order. Legacy entries
    /// missing required fields are skipped.
    pub fn records(&self) -> impl Iterator<Item = TrafficRecord> + '_ {
        self.entries
            .values()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
    }
}

enum Parsed {
    Map(LedgerEntries),
    List(Vec<Value>),
    Unparseable,
}

fn classify(bytes: &[u8]) -> Parsed {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Parsed::Map(LedgerEntries::new());
    }
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Parsed::Map(map),
        Ok(Value::Array(items)) => Parsed::List(items),
        _ => Parsed::Unparseable,
    }
}

/// Key every element of a legacy array on its own `id`, synthesizing
/// `request_<n>` for elements without one.
pub fn normalize_list(items: Vec<Value>) -> LedgerEntries {
    let mut entries = LedgerEntries::new();
    for item in items {
        let key = match item.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let mut n = entries.len();
                while entries.contains_key(&format!("request_{n}")) {
                    n += 1;
                }
                format!("request_{n}")
            }
        };
        if entries.insert(key.clone(), item).is_some() {
            warn!(id = %key, "Duplicate id in legacy ledger array, keeping last");
        }
    }
    entries
}

fn normalize(bytes: Option<&[u8]>) -> (LedgerEntries, Repair) {
    match bytes.map(classify) {
        None => (LedgerEntries::new(), Repair::None),
        Some(Parsed::Map(entries)) => (entries, Repair::None),
        Some(Parsed::List(items)) => {
            let count = items.len();
            (normalize_list(items), Repair::LegacyList { entries: count })
        }
        Some(Parsed::Unparseable) => (LedgerEntries::new(), Repair::Unparseable { backup: None }),
    }
}

fn file_stamp() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string()
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .map(|t: SystemTime| DateTime::<Utc>::from(t))
}

pub struct TrafficLedger {
    data_dir: PathBuf,
    locks: CampaignLocks,
    retry: RetryPolicy,
    rotate_bytes: u64,
    archive_counts: DashMap<PathBuf, LedgerCounts>,
}

impl TrafficLedger {
    pub fn new(config: &StorageConfig, locks: CampaignLocks) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            locks,
            retry: RetryPolicy::from_config(config),
            rotate_bytes: config.rotate_bytes,
            archive_counts: DashMap::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn locks(&self) -> &CampaignLocks {
        &self.locks
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn campaign_dir(&self, campaign_id: &str) -> PathBuf {
        self.data_dir.join(campaign_id)
    }

    pub fn ledger_path(&self, campaign_id: &str) -> PathBuf {
        self.campaign_dir(campaign_id).join(LEDGER_FILE)
    }

    /// Append one record under the campaign lock.
    pub fn append(&self, campaign_id: &str, record: &TrafficRecord) -> TrafficResult<AppendOutcome> {
        validate_campaign_id(campaign_id)?;
        let guard = self.locks.acquire(campaign_id);
        self.append_locked(&guard, record)
    }

    /// Append while the caller already holds the campaign lock.
    pub fn append_locked(
        &self,
        guard: &CampaignGuard,
        record: &TrafficRecord,
    ) -> TrafficResult<AppendOutcome> {
        let campaign_id = guard.campaign_id();
        let path = self.ledger_path(campaign_id);

        let (mut entries, repair) = self.load_for_write(campaign_id, &path)?;

        let value = serde_json::to_value(record)?;
        let replaced = entries.insert(record.id.clone(), value.clone()).is_some();
        if replaced {
            metrics::counter!("traffic.duplicate_ids").increment(1);
            warn!(
                campaign_id = %campaign_id,
                id = %record.id,
                "Duplicate record id, overwriting previous entry"
            );
        }

        let mut bytes = serde_json::to_vec_pretty(&entries)?;
        let mut archived_to = None;

        if bytes.len() as u64 > self.rotate_bytes && entries.len() > 1 {
            // The record moves to the fresh ledger, whether new or a replacement.
            entries.remove(&record.id);
            let archive = self.archive_locked(campaign_id, &entries)?;

            entries = LedgerEntries::new();
            entries.insert(record.id.clone(), value);
            bytes = serde_json::to_vec_pretty(&entries)?;
            archived_to = Some(archive);
        }

        self.retry
            .run("write ledger", &path, || write_atomic(&path, &bytes))?;

        metrics::counter!("traffic.records_appended").increment(1);
        debug!(
            campaign_id = %campaign_id,
            id = %record.id,
            entries = entries.len(),
            "Record appended"
        );

        Ok(AppendOutcome {
            entries: entries.len(),
            replaced,
            repair,
            archived_to,
        })
    }

    fn load_for_write(
        &self,
        campaign_id: &str,
        path: &Path,
    ) -> TrafficResult<(LedgerEntries, Repair)> {
        let bytes = self.retry.run("read ledger", path, || read_optional(path))?;
        let (entries, repair) = normalize(bytes.as_deref());

        let repair = match repair {
            Repair::Unparseable { .. } => {
                let backup = path.with_file_name(format!("{LEDGER_FILE}.{}.backup", file_stamp()));
                let original = bytes.unwrap_or_default();
                self.retry
                    .run("write backup", &backup, || write_new(&backup, &original))?;
                metrics::counter!("traffic.ledger_repairs", "kind" => "unparseable").increment(1);
                warn!(
                    campaign_id = %campaign_id,
                    backup = %backup.display(),
                    "Unparseable ledger replaced, original preserved"
                );
                Repair::Unparseable {
                    backup: Some(backup),
                }
            }
            Repair::LegacyList { entries: count } => {
                metrics::counter!("traffic.ledger_repairs", "kind" => "legacy_list").increment(1);
                warn!(
                    campaign_id = %campaign_id,
                    entries = count,
                    "Legacy array ledger converted to id-keyed map"
                );
                Repair::LegacyList { entries: count }
            }
            Repair::None => Repair::None,
        };

        Ok((entries, repair))
    }

    fn archive_locked(&self, campaign_id: &str, entries: &LedgerEntries) -> TrafficResult<PathBuf> {
        let dir = self.campaign_dir(campaign_id);
        let stamp = file_stamp();
        let mut archive = dir.join(format!("{ARCHIVE_PREFIX}{stamp}{ARCHIVE_SUFFIX}"));
        let mut n = 1;
        while archive.exists() {
            archive = dir.join(format!("{ARCHIVE_PREFIX}{stamp}-{n}{ARCHIVE_SUFFIX}"));
            n += 1;
        }

        let bytes = serde_json::to_vec_pretty(entries)?;
        self.retry
            .run("write archive", &archive, || write_new(&archive, &bytes))?;
        self.archive_counts
            .insert(archive.clone(), LedgerCounts::of(entries));

        metrics::counter!("traffic.ledger_rotations").increment(1);
        info!(
            campaign_id = %campaign_id,
            archive = %archive.display(),
            entries = entries.len(),
            "Ledger rotated"
        );
        Ok(archive)
    }

    /// Read the current ledger without taking the campaign lock. Writers only
    /// ever replace the file by rename, so the bytes are always complete. A
    /// missing file reads as an empty map.
    pub fn read(&self, campaign_id: &str) -> TrafficResult<LedgerSnapshot> {
        validate_campaign_id(campaign_id)?;
        let path = self.ledger_path(campaign_id);
        let bytes = self.retry.run("read ledger", &path, || read_optional(&path))?;
        let (entries, repair) = normalize(bytes.as_deref());

        if matches!(repair, Repair::Unparseable { .. }) {
            warn!(campaign_id = %campaign_id, "Unparseable ledger read as empty");
        }

        Ok(LedgerSnapshot {
            campaign_id: campaign_id.to_string(),
            entries,
            last_modified: modified_at(&path),
            repair,
        })
    }

    /// Archived entries followed by the current ledger, oldest first.
    pub fn read_with_archives(&self, campaign_id: &str) -> TrafficResult<LedgerSnapshot> {
        let mut merged = LedgerEntries::new();
        for archive in self.archives(campaign_id)? {
            let bytes = self
                .retry
                .run("read archive", &archive, || read_optional(&archive))?;
            let (entries, _) = normalize(bytes.as_deref());
            merged.extend(entries);
        }
        let mut current = self.read(campaign_id)?;
        merged.extend(std::mem::take(&mut current.entries));
        current.entries = merged;
        Ok(current)
    }

    /// Rotation archives for a campaign, oldest first.
    pub fn archives(&self, campaign_id: &str) -> TrafficResult<Vec<PathBuf>> {
        validate_campaign_id(campaign_id)?;
        let dir = self.campaign_dir(campaign_id);
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(traffic_core::TrafficError::storage("list archives", dir, e)),
        };

        let mut archives: Vec<PathBuf> = listing
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(ARCHIVE_PREFIX) && n.ends_with(ARCHIVE_SUFFIX))
                    .unwrap_or(false)
            })
            .collect();
        // Sort on the stem so `<stamp>` comes before its `<stamp>-<n>` siblings.
        archives.sort_by_key(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.trim_end_matches(ARCHIVE_SUFFIX).to_string())
                .unwrap_or_default()
        });
        Ok(archives)
    }

    /// Totals over the current ledger plus every archive.
    pub fn counts(&self, campaign_id: &str) -> TrafficResult<LedgerCounts> {
        let mut counts = self.read(campaign_id)?.counts();
        for archive in self.archives(campaign_id)? {
            counts = counts + self.archive_count(&archive)?;
        }
        Ok(counts)
    }

    fn archive_count(&self, archive: &Path) -> TrafficResult<LedgerCounts> {
        if let Some(cached) = self.archive_counts.get(archive) {
            return Ok(*cached);
        }
        let bytes = self
            .retry
            .run("read archive", archive, || read_optional(archive))?;
        let (entries, _) = normalize(bytes.as_deref());
        let counts = LedgerCounts::of(&entries);
        self.archive_counts.insert(archive.to_path_buf(), counts);
        Ok(counts)
    }

    /// Normalize the file on disk without appending anything.
    pub fn repair(&self, campaign_id: &str) -> TrafficResult<Repair> {
        validate_campaign_id(campaign_id)?;
        let guard = self.locks.acquire(campaign_id);
        let path = self.ledger_path(guard.campaign_id());
        if !path.exists() {
            return Ok(Repair::None);
        }

        let (entries, repair) = self.load_for_write(guard.campaign_id(), &path)?;
        if repair != Repair::None {
            let bytes = serde_json::to_vec_pretty(&entries)?;
            self.retry
                .run("write ledger", &path, || write_atomic(&path, &bytes))?;
        }
        Ok(repair)
    }

    /// Campaign ids whose directory holds a ledger or a status file.
    pub fn campaign_ids(&self) -> TrafficResult<Vec<String>> {
        let listing = match fs::read_dir(&self.data_dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(traffic_core::TrafficError::storage(
                    "list campaigns",
                    self.data_dir.clone(),
                    e,
                ))
            }
        };

        let mut ids: Vec<String> = listing
            .filter_map(Result::ok)
            .filter(|entry| {
                let dir = entry.path();
                dir.join(LEDGER_FILE).is_file() || dir.join(STATUS_FILE).is_file()
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|id| validate_campaign_id(id).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}
