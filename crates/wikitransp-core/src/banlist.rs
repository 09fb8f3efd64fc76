//! Persistent list of URLs that reliably fail.
//!
//! Lookups take a shared read lock and never touch disk. Failure recording is
//! serialized behind its own mutex, so only one writer at a time can decide
//! whether a URL has crossed the threshold.
//!
//! Entries added during a run are stored as [`BanStatus::Suggested`] and are
//! only applied to later runs once confirmed (or when the policy applies
//! suggestions directly).
//!
//! The file is JSON lines, one [`BanEntry`] per line.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::Path;

use crate::config::BansConfig;
use crate::error::{Result, WikitranspError};
use crate::pipeline::thumbnail::COMMONS_PREFIX;
use crate::types::ErrorKind;

/// Commons files known to answer 404, used by `bans seed`.
const BUILTIN_404S: [&str; 6] = [
    "5/50/50_Afghanis_of_Afghanistan_in_2002_Reverse.png",
    "4/4d/Nordamerikanische_Kulturareale_en.png",
    "e/ea/Park_Jihoon_GQ.png",
    "2/21/Breakers_Website_New_Logo_%281%29.png",
    "d/d2/StaatslijnC.png",
    "2/28/Logo_de_la_F%C3%A9d%C3%A9ration_de_Parkour.png",
];

/// Review state of a ban entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BanStatus {
    /// Reviewed; always applied
    Confirmed,
    /// Added automatically; awaiting review
    Suggested,
}

fn confirmed() -> BanStatus {
    BanStatus::Confirmed
}

/// One banned URL or URL prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BanEntry {
    /// Exact URL, or a prefix when it ends with `*`
    pub pattern: String,

    /// Failure code that caused the ban (e.g. "http-404")
    pub reason: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default = "confirmed")]
    pub status: BanStatus,
}

impl BanEntry {
    pub fn new(pattern: impl Into<String>, reason: impl Into<String>, status: BanStatus) -> Self {
        Self {
            pattern: pattern.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn matches(&self, url: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => url.starts_with(prefix),
            None => url == self.pattern,
        }
    }
}

/// Failure observed by a fetch worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    HttpStatus(u16),
    ConnectionFailure,
    Timeout,
    DecodeError,
}

impl FailureReason {
    /// The failure behind an errored outcome, if it is a fetch failure.
    pub fn from_error_kind(kind: ErrorKind) -> Option<Self> {
        match kind {
            ErrorKind::HttpStatus(code) => Some(Self::HttpStatus(code)),
            ErrorKind::ConnectionFailure => Some(Self::ConnectionFailure),
            ErrorKind::Timeout => Some(Self::Timeout),
            ErrorKind::DecodeError => Some(Self::DecodeError),
            ErrorKind::BanListedSkip | ErrorKind::Internal => None,
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HttpStatus(code) => write!(f, "http-{code}"),
            Self::ConnectionFailure => f.write_str("connection-failure"),
            Self::Timeout => f.write_str("timeout"),
            Self::DecodeError => f.write_str("decode-error"),
        }
    }
}

/// Which failures count, and how many make a ban.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanPolicy {
    pub failure_threshold: u32,
    pub ban_statuses: Vec<u16>,
    pub count_connection_failures: bool,
    pub count_timeouts: bool,
    pub apply_suggested: bool,
}

impl Default for BanPolicy {
    fn default() -> Self {
        Self::from(&BansConfig::default())
    }
}

impl From<&BansConfig> for BanPolicy {
    fn from(config: &BansConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            ban_statuses: config.ban_statuses.clone(),
            count_connection_failures: config.count_connection_failures,
            count_timeouts: config.count_timeouts,
            apply_suggested: config.apply_suggested,
        }
    }
}

impl BanPolicy {
    /// Decode errors never qualify: they are usually transient truncation.
    pub fn qualifies(&self, reason: FailureReason) -> bool {
        match reason {
            FailureReason::HttpStatus(code) => self.ban_statuses.contains(&code),
            FailureReason::ConnectionFailure => self.count_connection_failures,
            FailureReason::Timeout => self.count_timeouts,
            FailureReason::DecodeError => false,
        }
    }

    fn is_active(&self, entry: &BanEntry) -> bool {
        entry.status == BanStatus::Confirmed || self.apply_suggested
    }
}

#[derive(Debug, Default)]
struct BanIndex {
    /// Every entry, in load/insert order
    entries: Vec<BanEntry>,
    exact: HashSet<String>,
    prefixes: Vec<String>,
}

impl BanIndex {
    fn contains_pattern(&self, pattern: &str) -> bool {
        self.entries.iter().any(|e| e.pattern == pattern)
    }

    fn push(&mut self, entry: BanEntry, active: bool) {
        if active {
            match entry.pattern.strip_suffix('*') {
                Some(prefix) => self.prefixes.push(prefix.to_string()),
                None => {
                    self.exact.insert(entry.pattern.clone());
                }
            }
        }
        self.entries.push(entry);
    }
}

/// The ban list for one run.
#[derive(Debug)]
pub struct BanList {
    index: RwLock<BanIndex>,
    failures: Mutex<HashMap<String, u32>>,
    added: Mutex<Vec<BanEntry>>,
    policy: BanPolicy,
}

impl Default for BanList {
    fn default() -> Self {
        Self::new(BanPolicy::default())
    }
}

impl BanList {
    pub fn new(policy: BanPolicy) -> Self {
        Self {
            index: RwLock::new(BanIndex::default()),
            failures: Mutex::new(HashMap::new()),
            added: Mutex::new(Vec::new()),
            policy,
        }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = BanEntry>, policy: BanPolicy) -> Self {
        let list = Self::new(policy);
        for entry in entries {
            list.insert(entry);
        }
        list
    }

    /// Load entries from `path`. A missing file yields an empty list.
    pub fn load(path: &Path, policy: BanPolicy) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No ban list found, starting empty");
                return Ok(Self::new(policy));
            }
            Err(e) => {
                return Err(WikitranspError::BanList {
                    path: path.to_path_buf(),
                    message: e.to_string(),
                })
            }
        };

        let mut entries = Vec::new();
        for (i, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let entry: BanEntry =
                serde_json::from_str(line).map_err(|e| WikitranspError::BanList {
                    path: path.to_path_buf(),
                    message: format!("line {}: {e}", i + 1),
                })?;
            entries.push(entry);
        }
        tracing::info!(path = %path.display(), entries = entries.len(), "Loaded ban list");
        Ok(Self::from_entries(entries, policy))
    }

    /// Write every entry to `path`, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let io_err = |e: std::io::Error| WikitranspError::BanList {
            path: path.to_path_buf(),
            message: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut buf = Vec::new();
        for entry in self.index.read().entries.iter() {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = std::fs::File::create(&tmp_path).map_err(io_err)?;
        file.write_all(&buf).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        std::fs::rename(&tmp_path, path).map_err(io_err)?;
        Ok(())
    }

    /// Whether `url` matches an active entry. Pure lookup.
    pub fn should_skip(&self, url: &str) -> bool {
        let index = self.index.read();
        index.exact.contains(url) || index.prefixes.iter().any(|p| url.starts_with(p.as_str()))
    }

    /// Add `entry` unless its pattern is already present.
    pub fn insert(&self, entry: BanEntry) -> bool {
        let active = self.policy.is_active(&entry);
        let mut index = self.index.write();
        if index.contains_pattern(&entry.pattern) {
            return false;
        }
        index.push(entry, active);
        true
    }

    /// Count a failure for `url`. Returns the new entry if this failure
    /// crossed the threshold.
    pub fn record_failure(&self, url: &str, reason: FailureReason) -> Option<BanEntry> {
        if !self.policy.qualifies(reason) {
            return None;
        }
        let mut failures = self.failures.lock();
        let count = failures.entry(url.to_string()).or_insert(0);
        *count += 1;
        if *count != self.policy.failure_threshold {
            return None;
        }

        let entry = BanEntry::new(url, reason.to_string(), BanStatus::Suggested);
        if !self.insert(entry.clone()) {
            return None;
        }
        tracing::warn!(url, reason = %reason, "Suggesting ban for failing URL");
        self.added.lock().push(entry.clone());
        Some(entry)
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<BanEntry> {
        self.index.read().entries.clone()
    }

    /// Entries added by [`record_failure`](Self::record_failure) in this run.
    pub fn added(&self) -> Vec<BanEntry> {
        self.added.lock().clone()
    }

    /// Entries awaiting review.
    pub fn suggestions(&self) -> Vec<BanEntry> {
        self.index
            .read()
            .entries
            .iter()
            .filter(|e| e.status == BanStatus::Suggested)
            .cloned()
            .collect()
    }

    /// Confirm suggested entries whose pattern equals `pattern` (all of them
    /// when `None`). Returns how many were confirmed.
    pub fn confirm(&self, pattern: Option<&str>) -> usize {
        let mut index = self.index.write();
        let mut confirmed = Vec::new();
        for entry in index.entries.iter_mut() {
            if entry.status == BanStatus::Suggested && pattern.map_or(true, |p| p == entry.pattern)
            {
                entry.status = BanStatus::Confirmed;
                confirmed.push(entry.pattern.clone());
            }
        }
        for pattern in &confirmed {
            match pattern.strip_suffix('*') {
                Some(prefix) => index.prefixes.push(prefix.to_string()),
                None => {
                    index.exact.insert(pattern.clone());
                }
            }
        }
        confirmed.len()
    }

    pub fn len(&self) -> usize {
        self.index.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Confirmed entries for the known-404 Commons files.
pub fn builtin_entries() -> Vec<BanEntry> {
    BUILTIN_404S
        .iter()
        .map(|part| BanEntry::new(format!("{COMMONS_PREFIX}{part}"), "http-404", BanStatus::Confirmed))
        .collect()
}
