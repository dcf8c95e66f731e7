//! One ingestion cycle: quota check → fetch → normalize → store → record.
//!
//! Cycles are serial by construction (single writer). A call is recorded
//! against the quota only when the upstream billed it (2xx response), and it
//! is recorded even if storage then fails.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::CycleError;
use crate::feed::{ApiQuota, OddsSource};
use crate::model::OddsRecord;
use crate::normalize::normalize;
use crate::quota::{LedgerStatus, QuotaStats, QuotaTracker};
use crate::store::{AppendBackend, SnapshotStore};

/// Outcome of a completed cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub recorded_at: DateTime<Utc>,
    pub games: usize,
    /// Rows appended to the daily rollup.
    pub records_written: usize,
    /// Rows appended across per-game archives.
    pub per_game_rows: usize,
    pub skipped_count: usize,
    pub quota_stats: QuotaStats,
    pub upstream_quota: Option<ApiQuota>,
    /// Non-fatal problems (e.g. the ledger could not be read or saved).
    pub warnings: Vec<String>,
}

pub struct IngestionPipeline<S, B> {
    source: S,
    store: SnapshotStore<B>,
    quota: QuotaTracker,
}

impl<S: OddsSource, B: AppendBackend> IngestionPipeline<S, B> {
    pub fn new(source: S, store: SnapshotStore<B>, quota: QuotaTracker) -> Self {
        Self {
            source,
            store,
            quota,
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn store(&self) -> &SnapshotStore<B> {
        &self.store
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    pub async fn run_ingestion_cycle(&self) -> Result<CycleReport, CycleError> {
        self.run_cycle_at(Utc::now()).await
    }

    /// Runs a cycle with `now` as the snapshot instant.
    pub async fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport, CycleError> {
        let mut warnings = Vec::new();

        let before = self.quota.stats(now);
        if let LedgerStatus::Unreadable { reason } = &before.ledger {
            warnings.push(format!("quota ledger unreadable, proceeding: {}", reason));
        } else if !before.stats.can_call() {
            warn!(
                "Skipping fetch: {}/{} calls used this month",
                before.stats.calls_this_month, before.stats.monthly_limit
            );
            return Err(CycleError::QuotaExhausted {
                calls: before.stats.calls_this_month,
                limit: before.stats.monthly_limit,
            });
        }

        let fetched = match self.source.fetch_odds().await {
            Ok(fetched) => fetched,
            Err(e) => {
                if e.is_billable() {
                    self.record_billable_call(now, &mut warnings);
                }
                error!("Fetch failed: {}", e);
                return Err(e.into());
            }
        };

        let normalized = normalize(&fetched.events, now);
        if normalized.skipped > 0 {
            warn!("Skipped {} malformed entries", normalized.skipped);
        }

        let stored = self.store_batch(&normalized.records);
        let quota_stats = self
            .record_billable_call(now, &mut warnings)
            .unwrap_or(before.stats);
        let (records_written, per_game_rows) = stored?;

        info!(
            "Cycle complete: {} games, {} rows ({} per-game), {} skipped",
            normalized.games, records_written, per_game_rows, normalized.skipped
        );

        Ok(CycleReport {
            recorded_at: now,
            games: normalized.games,
            records_written,
            per_game_rows,
            skipped_count: normalized.skipped,
            quota_stats,
            upstream_quota: fetched.quota,
            warnings,
        })
    }

    fn store_batch(&self, records: &[OddsRecord]) -> Result<(usize, usize), CycleError> {
        let daily = self.store.append_daily(records).map_err(|e| {
            error!("Daily append failed after {} rows: {}", e.rows_written(), e);
            e
        })?;
        let per_game = self.store.append_per_game(records).map_err(|e| {
            error!("Per-game append failed after {} rows: {}", e.rows_written(), e);
            e.with_prior_rows(daily)
        })?;
        Ok((daily, per_game))
    }

    /// Records a billed call. Ledger write failures become warnings.
    fn record_billable_call(&self, now: DateTime<Utc>, warnings: &mut Vec<String>) -> Option<QuotaStats> {
        match self.quota.record_call(now) {
            Ok(report) => Some(report.stats),
            Err(e) => {
                warn!("Failed to record API call: {}", e);
                warnings.push(format!("quota call not recorded: {}", e));
                None
            }
        }
    }
}

/// A refused cycle (quota spent) is expected and not a health error.
pub fn is_operational_failure(e: &CycleError) -> bool {
    !matches!(e, CycleError::QuotaExhausted { .. })
}
