//! Read-side reconciliation over snapshot history.
//!
//! Views are recomputed from the stored rows on every call and never write
//! back. Where the same `(bookmaker, market, outcome, recorded_at)` appears
//! more than once, the row read last wins.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

use crate::error::StoreError;
use crate::model::{Market, OddsRecord};
use crate::quota::QuotaReport;
use crate::store::{AppendBackend, PartitionRead, SnapshotStore};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeLine {
    pub outcome_name: String,
    pub price: i32,
    pub point: Option<f64>,
}

/// Outcomes of one bookmaker/market at its most recent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketView {
    pub recorded_at: DateTime<Utc>,
    pub outcomes: Vec<OutcomeLine>,
}

/// Latest known odds for one game.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestState {
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub commence_time: DateTime<Utc>,
    /// bookmaker → market → outcomes, each pair at its own latest `recorded_at`.
    pub bookmakers: BTreeMap<String, BTreeMap<Market, MarketView>>,
}

/// Latest state per `(bookmaker, market)`. Pairs are resolved independently:
/// a bookmaker that stopped updating keeps its last snapshot.
pub fn latest_state(game_id: &str, records: &[OddsRecord]) -> Option<LatestState> {
    let game: Vec<&OddsRecord> = records.iter().filter(|r| r.game_id == game_id).collect();
    let newest = game.iter().copied().fold(None::<&OddsRecord>, |best, r| match best {
        Some(b) if b.recorded_at > r.recorded_at => Some(b),
        _ => Some(r),
    })?;

    let mut latest_at: HashMap<(&str, Market), DateTime<Utc>> = HashMap::new();
    for r in &game {
        let at = latest_at.entry((r.bookmaker.as_str(), r.market)).or_insert(r.recorded_at);
        if r.recorded_at > *at {
            *at = r.recorded_at;
        }
    }

    let mut bookmakers: BTreeMap<String, BTreeMap<Market, MarketView>> = BTreeMap::new();
    for r in &game {
        let at = latest_at[&(r.bookmaker.as_str(), r.market)];
        if r.recorded_at != at {
            continue;
        }
        let view = bookmakers
            .entry(r.bookmaker.clone())
            .or_default()
            .entry(r.market)
            .or_insert_with(|| MarketView {
                recorded_at: at,
                outcomes: Vec::new(),
            });
        let line = OutcomeLine {
            outcome_name: r.outcome_name.clone(),
            price: r.price,
            point: r.point,
        };
        match view.outcomes.iter_mut().find(|o| o.outcome_name == r.outcome_name) {
            Some(existing) => *existing = line,
            None => view.outcomes.push(line),
        }
    }

    Some(LatestState {
        game_id: game_id.to_string(),
        home_team: newest.home_team.clone(),
        away_team: newest.away_team.clone(),
        commence_time: newest.commence_time,
        bookmakers,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLine {
    pub price: i32,
    pub point: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementLine {
    pub bookmaker: String,
    pub outcome_name: String,
    /// `None` for a line first offered in the current snapshot.
    pub previous: Option<PriceLine>,
    pub current: PriceLine,
    /// Widened so deltas between extreme prices cannot overflow.
    pub price_delta: Option<i64>,
    pub point_delta: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MovementView {
    pub game_id: String,
    pub market: Market,
    pub previous_at: DateTime<Utc>,
    pub current_at: DateTime<Utc>,
    pub lines: Vec<MovementLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Movement {
    /// Fewer than two snapshots exist for the market.
    Unavailable {
        game_id: String,
        market: Market,
        snapshots: usize,
    },
    Available(MovementView),
}

/// Delta between the two most recent snapshots of `(game_id, market)`.
///
/// Snapshot instants are taken across all bookmakers. Lines only in the
/// previous snapshot are dropped; lines only in the current one are reported
/// with no previous value.
pub fn movement(game_id: &str, market: Market, records: &[OddsRecord]) -> Movement {
    let rows: Vec<&OddsRecord> = records
        .iter()
        .filter(|r| r.game_id == game_id && r.market == market)
        .collect();

    let instants: BTreeSet<DateTime<Utc>> = rows.iter().map(|r| r.recorded_at).collect();
    let mut newest_first = instants.iter().rev();
    let (Some(&current_at), Some(&previous_at)) = (newest_first.next(), newest_first.next()) else {
        return Movement::Unavailable {
            game_id: game_id.to_string(),
            market,
            snapshots: instants.len(),
        };
    };

    let mut previous: HashMap<(&str, &str), PriceLine> = HashMap::new();
    let mut current: HashMap<(&str, &str), PriceLine> = HashMap::new();
    let mut current_order: Vec<(&str, &str)> = Vec::new();
    for r in &rows {
        let key = (r.bookmaker.as_str(), r.outcome_name.as_str());
        let line = PriceLine {
            price: r.price,
            point: r.point,
        };
        if r.recorded_at == current_at {
            if current.insert(key, line).is_none() {
                current_order.push(key);
            }
        } else if r.recorded_at == previous_at {
            previous.insert(key, line);
        }
    }

    let lines = current_order
        .into_iter()
        .map(|key| {
            let now = current[&key];
            let before = previous.get(&key).copied();
            MovementLine {
                bookmaker: key.0.to_string(),
                outcome_name: key.1.to_string(),
                previous: before,
                current: now,
                price_delta: before.map(|b| i64::from(now.price) - i64::from(b.price)),
                point_delta: before.and_then(|b| Some(now.point? - b.point?)),
            }
        })
        .collect();

    Movement::Available(MovementView {
        game_id: game_id.to_string(),
        market,
        previous_at,
        current_at,
        lines,
    })
}

/// Per-game line of the dashboard overview.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GameSummary {
    pub game_id: String,
    pub home_team: String,
    pub away_team: String,
    pub commence_time: DateTime<Utc>,
    pub bookmakers: usize,
    pub markets: Vec<Market>,
    pub last_recorded_at: DateTime<Utc>,
    pub rows: usize,
}

/// Games in `records`, ordered by kickoff.
pub fn summarize_games(records: &[OddsRecord]) -> Vec<GameSummary> {
    struct Acc<'a> {
        newest: &'a OddsRecord,
        bookmakers: BTreeSet<&'a str>,
        markets: BTreeSet<Market>,
        rows: usize,
    }

    let mut games: HashMap<&str, Acc<'_>> = HashMap::new();
    for r in records {
        let acc = games.entry(r.game_id.as_str()).or_insert_with(|| Acc {
            newest: r,
            bookmakers: BTreeSet::new(),
            markets: BTreeSet::new(),
            rows: 0,
        });
        if r.recorded_at >= acc.newest.recorded_at {
            acc.newest = r;
        }
        acc.bookmakers.insert(r.bookmaker.as_str());
        acc.markets.insert(r.market);
        acc.rows += 1;
    }

    let mut out: Vec<GameSummary> = games
        .into_iter()
        .map(|(game_id, acc)| GameSummary {
            game_id: game_id.to_string(),
            home_team: acc.newest.home_team.clone(),
            away_team: acc.newest.away_team.clone(),
            commence_time: acc.newest.commence_time,
            bookmakers: acc.bookmakers.len(),
            markets: acc.markets.into_iter().collect(),
            last_recorded_at: acc.newest.recorded_at,
            rows: acc.rows,
        })
        .collect();
    out.sort_by(|a, b| {
        a.commence_time
            .cmp(&b.commence_time)
            .then_with(|| a.game_id.cmp(&b.game_id))
    });
    out
}

/// A view plus the partitions that could not be used to build it.
#[derive(Debug, Clone, Serialize)]
pub struct ViewResult<T> {
    pub view: T,
    pub skipped_files: Vec<String>,
}

/// Snapshot rows gathered for one read.
#[derive(Debug, Clone, Default)]
pub struct LoadedRecords {
    pub source: Option<String>,
    pub records: Vec<OddsRecord>,
    pub skipped_files: Vec<String>,
    pub bad_rows: usize,
}

impl LoadedRecords {
    fn absorb(&mut self, key: &str, result: Result<PartitionRead, StoreError>) {
        match result {
            Ok(read) => {
                self.records.extend(read.records);
                self.bad_rows += read.bad_rows;
            }
            Err(e) => {
                warn!("Skipping {} for views: {}", key, e);
                self.skipped_files.push(key.to_string());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    pub total_games: usize,
    pub total_odds: usize,
    pub api_calls: u32,
    pub remaining_calls: i64,
    pub usage_percent: f64,
    pub last_update: Option<DateTime<Utc>>,
    pub latest_file: Option<String>,
}

/// Builds views from a snapshot store.
pub struct ViewBuilder<'a, B> {
    store: &'a SnapshotStore<B>,
}

impl<'a, B: AppendBackend> ViewBuilder<'a, B> {
    pub fn new(store: &'a SnapshotStore<B>) -> Self {
        Self { store }
    }

    /// All rows for a game: its archive file when present, otherwise every
    /// daily rollup filtered to the game.
    pub fn load_game(&self, game_id: &str) -> Result<LoadedRecords, StoreError> {
        let mut loaded = LoadedRecords::default();

        if let Some(key) = self.store.game_key(game_id)? {
            loaded.absorb(&key, self.store.read_game(&key));
            loaded.records.retain(|r| r.game_id == game_id);
            if loaded.skipped_files.is_empty() {
                loaded.source = Some(key);
                return Ok(loaded);
            }
        }

        for key in self.store.daily_keys()? {
            loaded.absorb(&key, self.store.read_daily(&key));
        }
        loaded.records.retain(|r| r.game_id == game_id);
        Ok(loaded)
    }

    /// Rows of the most recent daily rollup.
    pub fn load_latest_daily(&self) -> Result<LoadedRecords, StoreError> {
        let mut loaded = LoadedRecords::default();
        if let Some(key) = self.store.latest_daily_key()? {
            loaded.absorb(&key, self.store.read_daily(&key));
            loaded.source = Some(key);
        }
        Ok(loaded)
    }

    pub fn latest_state(&self, game_id: &str) -> Result<ViewResult<Option<LatestState>>, StoreError> {
        let loaded = self.load_game(game_id)?;
        Ok(ViewResult {
            view: latest_state(game_id, &loaded.records),
            skipped_files: loaded.skipped_files,
        })
    }

    pub fn movement(&self, game_id: &str, market: Market) -> Result<ViewResult<Movement>, StoreError> {
        let loaded = self.load_game(game_id)?;
        Ok(ViewResult {
            view: movement(game_id, market, &loaded.records),
            skipped_files: loaded.skipped_files,
        })
    }

    /// Game summaries from the latest daily rollup.
    pub fn games(&self) -> Result<ViewResult<Vec<GameSummary>>, StoreError> {
        let loaded = self.load_latest_daily()?;
        Ok(ViewResult {
            view: summarize_games(&loaded.records),
            skipped_files: loaded.skipped_files,
        })
    }

    pub fn dashboard_stats(&self, quota: &QuotaReport) -> Result<ViewResult<DashboardStats>, StoreError> {
        let loaded = self.load_latest_daily()?;
        let total_games = loaded
            .records
            .iter()
            .map(|r| r.game_id.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        Ok(ViewResult {
            view: DashboardStats {
                total_games,
                total_odds: loaded.records.len(),
                api_calls: quota.stats.calls_this_month,
                remaining_calls: quota.stats.remaining,
                usage_percent: quota.stats.usage_percent,
                last_update: loaded.records.iter().map(|r| r.recorded_at).max(),
                latest_file: loaded.source,
            },
            skipped_files: loaded.skipped_files,
        })
    }
}
