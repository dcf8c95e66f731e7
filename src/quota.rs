//! Monthly API quota ledger.
//!
//! The ledger is a list of call timestamps persisted as JSON
//! (`{"calls": [{"timestamp", "date", "hour"}], "monthly_limit"}`). Monthly
//! usage is always recounted from the entries; nothing is cached. Entries
//! older than [`RETENTION_DAYS`] are pruned on every load and write.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::model::timestamp;

pub const RETENTION_DAYS: i64 = 60;
pub const DEFAULT_MONTHLY_LIMIT: u32 = 500;

/// One upstream call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEntry {
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub hour: u32,
}

impl CallEntry {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            timestamp: now,
            date: now.date_naive(),
            hour: now.hour(),
        }
    }
}

fn default_monthly_limit() -> u32 {
    DEFAULT_MONTHLY_LIMIT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaLedger {
    #[serde(default)]
    pub calls: Vec<CallEntry>,
    #[serde(default = "default_monthly_limit")]
    pub monthly_limit: u32,
}

/// Coarse usage band, matching the thresholds operators alert on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    Ok,
    Caution,
    Warning,
}

impl UsageLevel {
    fn from_percent(percent: f64) -> Self {
        if percent > 80.0 {
            UsageLevel::Warning
        } else if percent > 60.0 {
            UsageLevel::Caution
        } else {
            UsageLevel::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStats {
    pub calls_this_month: u32,
    pub monthly_limit: u32,
    /// Negative when over quota. Never clamped.
    pub remaining: i64,
    pub usage_percent: f64,
    pub days_remaining_in_month: i64,
    pub calls_by_hour_this_month: BTreeMap<u32, u32>,
    pub calls_last_7_days: u32,
    /// Calls per remaining day that keep usage under the limit.
    pub daily_budget: f64,
    pub level: UsageLevel,
}

impl QuotaStats {
    /// Safe to spend another call this month.
    pub fn can_call(&self) -> bool {
        self.remaining > 0
    }
}

impl QuotaLedger {
    pub fn new(monthly_limit: u32) -> Self {
        Self {
            calls: Vec::new(),
            monthly_limit,
        }
    }

    /// Appends a call at `now` and prunes expired entries.
    pub fn record(&mut self, now: DateTime<Utc>) {
        self.calls.push(CallEntry::at(now));
        self.prune(now);
    }

    /// Drops entries older than the retention window. Returns how many went.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::days(RETENTION_DAYS);
        let before = self.calls.len();
        self.calls.retain(|call| call.timestamp > cutoff);
        before - self.calls.len()
    }

    /// Entries whose `date` falls in `now`'s calendar month.
    pub fn usage_for_month(&self, now: DateTime<Utc>) -> u32 {
        self.calls_in_month(now).count() as u32
    }

    fn calls_in_month(&self, now: DateTime<Utc>) -> impl Iterator<Item = &CallEntry> {
        let (year, month) = (now.year(), now.month());
        self.calls
            .iter()
            .filter(move |call| call.date.year() == year && call.date.month() == month)
    }

    pub fn calls_since(&self, since: DateTime<Utc>) -> u32 {
        self.calls.iter().filter(|call| call.timestamp > since).count() as u32
    }

    pub fn stats(&self, now: DateTime<Utc>) -> QuotaStats {
        let calls_this_month = self.usage_for_month(now);
        let remaining = i64::from(self.monthly_limit) - i64::from(calls_this_month);
        let usage_percent = if self.monthly_limit == 0 {
            100.0
        } else {
            f64::from(calls_this_month) / f64::from(self.monthly_limit) * 100.0
        };

        let mut calls_by_hour_this_month = BTreeMap::new();
        for call in self.calls_in_month(now) {
            *calls_by_hour_this_month.entry(call.hour).or_insert(0) += 1;
        }

        let days_remaining_in_month = days_remaining_in_month(now);
        let daily_budget = if remaining > 0 {
            remaining as f64 / days_remaining_in_month.max(1) as f64
        } else {
            0.0
        };

        QuotaStats {
            calls_this_month,
            monthly_limit: self.monthly_limit,
            remaining,
            usage_percent,
            days_remaining_in_month,
            calls_by_hour_this_month,
            calls_last_7_days: self.calls_since(now - Duration::days(7)),
            daily_budget,
            level: UsageLevel::from_percent(usage_percent),
        }
    }
}

/// Whole days between `now` and midnight UTC on the first of next month.
pub fn days_remaining_in_month(now: DateTime<Utc>) -> i64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    match NaiveDate::from_ymd_opt(year, month, 1).and_then(|d| d.and_hms_opt(0, 0, 0)) {
        Some(next) => (next.and_utc() - now).num_days(),
        None => 0,
    }
}

/// How the ledger backing a report was obtained.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LedgerStatus {
    Loaded,
    /// No ledger yet; usage starts from zero.
    Missing,
    /// The ledger could not be read and was treated as empty.
    Unreadable { reason: String },
}

impl LedgerStatus {
    /// Whether the stats reflect real history and may gate ingestion.
    pub fn is_authoritative(&self) -> bool {
        !matches!(self, LedgerStatus::Unreadable { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaReport {
    pub stats: QuotaStats,
    pub ledger: LedgerStatus,
}

/// Result of a fail-open load: the ledger to use plus what went wrong, if anything.
#[derive(Debug)]
pub struct LedgerLoad {
    pub ledger: QuotaLedger,
    pub warning: Option<LedgerError>,
}

impl LedgerLoad {
    pub fn status(&self) -> LedgerStatus {
        match &self.warning {
            None => LedgerStatus::Loaded,
            Some(e) if e.is_not_found() => LedgerStatus::Missing,
            Some(e) => LedgerStatus::Unreadable {
                reason: e.to_string(),
            },
        }
    }
}

/// File-backed quota ledger.
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    path: PathBuf,
    monthly_limit: u32,
}

impl QuotaTracker {
    /// `monthly_limit` is authoritative and overwrites the persisted value.
    pub fn new(path: impl Into<PathBuf>, monthly_limit: u32) -> Self {
        Self {
            path: path.into(),
            monthly_limit,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Strict load: every failure is returned to the caller.
    pub fn load(&self, now: DateTime<Utc>) -> Result<QuotaLedger, LedgerError> {
        let raw = fs::read(&self.path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                LedgerError::NotFound(self.path.clone())
            } else {
                LedgerError::Io {
                    path: self.path.clone(),
                    source: e,
                }
            }
        })?;

        let mut ledger: QuotaLedger =
            serde_json::from_slice(&raw).map_err(|e| LedgerError::Corrupt {
                path: self.path.clone(),
                source: e,
            })?;
        ledger.monthly_limit = self.monthly_limit;
        ledger.prune(now);
        Ok(ledger)
    }

    /// Fail-open load: a missing or unreadable ledger becomes an empty one.
    pub fn load_or_empty(&self, now: DateTime<Utc>) -> LedgerLoad {
        match self.load(now) {
            Ok(ledger) => LedgerLoad {
                ledger,
                warning: None,
            },
            Err(e) => {
                if e.is_not_found() {
                    debug!("No quota ledger at {}, starting empty", self.path.display());
                } else {
                    warn!("Treating quota ledger as empty: {}", e);
                }
                LedgerLoad {
                    ledger: QuotaLedger::new(self.monthly_limit),
                    warning: Some(e),
                }
            }
        }
    }

    /// Writes via a temp file and rename so readers never see a partial ledger.
    pub fn save(&self, ledger: &QuotaLedger) -> Result<(), LedgerError> {
        let io_err = |source| LedgerError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let body = serde_json::to_string_pretty(ledger).map_err(|e| LedgerError::Corrupt {
            path: self.path.clone(),
            source: e,
        })?;
        let tmp = self.path.with_extension(format!("json.tmp.{}", std::process::id()));
        fs::write(&tmp, body).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }

    /// Records one billable call at `now` and persists the pruned ledger.
    ///
    /// An unreadable ledger is moved aside before being replaced. If it cannot
    /// be moved, nothing is written and the error is returned.
    pub fn record_call(&self, now: DateTime<Utc>) -> Result<QuotaReport, LedgerError> {
        let mut load = self.load_or_empty(now);
        if load.warning.as_ref().map_or(false, |e| !e.is_not_found()) {
            self.quarantine(now)?;
        }

        load.ledger.record(now);
        self.save(&load.ledger)?;

        let stats = load.ledger.stats(now);
        info!(
            "API usage: {}/{} calls ({:.1}%)",
            stats.calls_this_month, stats.monthly_limit, stats.usage_percent
        );
        Ok(QuotaReport {
            stats,
            ledger: load.status(),
        })
    }

    /// Strict monthly count for callers that want to fail closed.
    pub fn usage_for_month(&self, now: DateTime<Utc>) -> Result<u32, LedgerError> {
        Ok(self.load(now)?.usage_for_month(now))
    }

    /// Fail-open statistics. Expired entries are pruned from disk as well.
    ///
    /// Writes the ledger, so only the ingestion path calls this.
    pub fn stats(&self, now: DateTime<Utc>) -> QuotaReport {
        let load = self.load_or_empty(now);
        if load.warning.is_none() {
            self.persist_pruned(&load.ledger);
        }
        QuotaReport {
            stats: load.ledger.stats(now),
            ledger: load.status(),
        }
    }

    /// Fail-open statistics that never touch the file. Safe to call while
    /// a cycle is recording a call.
    pub fn read_stats(&self, now: DateTime<Utc>) -> QuotaReport {
        let load = self.load_or_empty(now);
        QuotaReport {
            stats: load.ledger.stats(now),
            ledger: load.status(),
        }
    }

    fn persist_pruned(&self, pruned: &QuotaLedger) {
        let on_disk = fs::read(&self.path)
            .ok()
            .and_then(|raw| serde_json::from_slice::<QuotaLedger>(&raw).ok());
        let changed = on_disk.map_or(false, |ledger| ledger.calls.len() != pruned.calls.len());
        if changed {
            if let Err(e) = self.save(pruned) {
                warn!("Failed to persist pruned quota ledger: {}", e);
            }
        }
    }

    fn quarantine(&self, now: DateTime<Utc>) -> Result<(), LedgerError> {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".corrupt-{}", now.format("%Y%m%d%H%M%S")));
        let target = PathBuf::from(name);
        fs::rename(&self.path, &target).map_err(|e| {
            warn!("Could not move unreadable quota ledger aside, leaving it in place: {}", e);
            LedgerError::Io {
                path: self.path.clone(),
                source: e,
            }
        })?;
        warn!("Moved unreadable quota ledger to {}", target.display());
        Ok(())
    }
}
