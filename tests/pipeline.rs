//! End-to-end ingestion cycles against a scripted upstream.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::TempDir;

use line_movement::error::{CycleError, FeedError};
use line_movement::feed::{ApiQuota, FetchedOdds, OddsSource};
use line_movement::ingest::IngestionPipeline;
use line_movement::model::{Market, OddsApiEvent, CSV_COLUMNS};
use line_movement::quota::QuotaTracker;
use line_movement::store::{
    game_file_name, AppendBackend, CsvDirBackend, MemoryBackend, SnapshotStore,
};
use line_movement::views::{Movement, ViewBuilder};

/// Replays queued responses in order.
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<FetchedOdds, FeedError>>>,
    calls: AtomicUsize,
}

impl ScriptedSource {
    fn new(responses: Vec<Result<FetchedOdds, FeedError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OddsSource for ScriptedSource {
    async fn fetch_odds(&self) -> Result<FetchedOdds, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(FeedError::Transport("no scripted response".into())))
    }
}

fn events(jets_price: i32) -> Vec<OddsApiEvent> {
    let body = format!(
        r#"[
          {{
            "id": "abc123",
            "sport_key": "americanfootball_nfl",
            "commence_time": "2024-09-08T17:00:00Z",
            "home_team": "New England Patriots",
            "away_team": "New York Jets",
            "bookmakers": [
              {{
                "key": "draftkings",
                "title": "DraftKings",
                "markets": [
                  {{"key": "h2h", "outcomes": [
                    {{"name": "New England Patriots", "price": -150}},
                    {{"name": "New York Jets", "price": {jets_price}}}
                  ]}},
                  {{"key": "spreads", "outcomes": [
                    {{"name": "New England Patriots", "price": -110, "point": -3.0}},
                    {{"name": "New York Jets", "price": -110, "point": 3.0}}
                  ]}},
                  {{"key": "totals", "outcomes": [
                    {{"name": "Over", "price": -105, "point": 41.5}},
                    {{"name": "Under", "price": -115, "point": 41.5}}
                  ]}}
                ]
              }},
              {{
                "key": "fanduel",
                "title": "FanDuel",
                "markets": [
                  {{"key": "h2h", "outcomes": [
                    {{"name": "New England Patriots", "price": -155}},
                    {{"name": "New York Jets", "price": 135}}
                  ]}}
                ]
              }}
            ]
          }},
          {{
            "id": "def456",
            "commence_time": "2024-09-08T20:25:00Z",
            "home_team": "Kansas City Chiefs",
            "away_team": "Baltimore Ravens",
            "bookmakers": []
          }}
        ]"#
    );
    serde_json::from_str(&body).unwrap()
}

fn ok(events: Vec<OddsApiEvent>) -> Result<FetchedOdds, FeedError> {
    Ok(FetchedOdds {
        events,
        quota: Some(ApiQuota {
            requests_used: Some(10),
            requests_remaining: Some(490),
        }),
    })
}

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 9, 5, h, m, 0).unwrap()
}

fn csv_pipeline(
    dir: &TempDir,
    responses: Vec<Result<FetchedOdds, FeedError>>,
) -> IngestionPipeline<ScriptedSource, CsvDirBackend> {
    IngestionPipeline::new(
        ScriptedSource::new(responses),
        SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games")),
        QuotaTracker::new(dir.path().join("api_usage.json"), 500),
    )
}

fn data_lines(path: &Path) -> usize {
    fs::read_to_string(path).unwrap().lines().count() - 1
}

#[tokio::test]
async fn cycle_writes_daily_and_game_snapshots() {
    let dir = TempDir::new().unwrap();
    let pipeline = csv_pipeline(&dir, vec![ok(events(130))]);

    let report = pipeline.run_cycle_at(at(12, 0)).await.unwrap();

    assert_eq!(report.games, 2);
    assert_eq!(report.records_written, 8);
    assert_eq!(report.per_game_rows, 8);
    assert_eq!(report.skipped_count, 0);
    assert_eq!(report.quota_stats.calls_this_month, 1);
    assert_eq!(report.upstream_quota.unwrap().requests_remaining, Some(490));
    assert!(report.warnings.is_empty());

    let daily = dir.path().join("nfl_odds_2024-09-05.csv");
    let header = fs::read_to_string(&daily).unwrap();
    assert_eq!(header.lines().next().unwrap(), CSV_COLUMNS.join(","));
    assert_eq!(data_lines(&daily), 8);

    let game_file = game_file_name(
        NaiveDate::from_ymd_opt(2024, 9, 8).unwrap(),
        "New York Jets",
        "New England Patriots",
        "abc123",
    );
    assert_eq!(game_file, "2024-09-08_New_York_Jets_at_New_England_Patriots_abc123.csv");
    assert_eq!(data_lines(&dir.path().join("games").join(&game_file)), 8);

    // a game with no bookmakers produces no archive file
    assert_eq!(pipeline.store().games().backend().keys().unwrap(), vec![game_file]);
}

#[tokio::test]
async fn consecutive_cycles_append_and_show_movement() {
    let dir = TempDir::new().unwrap();
    let pipeline = csv_pipeline(&dir, vec![ok(events(130)), ok(events(145))]);

    pipeline.run_cycle_at(at(10, 0)).await.unwrap();
    let report = pipeline.run_cycle_at(at(12, 0)).await.unwrap();
    assert_eq!(report.quota_stats.calls_this_month, 2);

    let daily = dir.path().join("nfl_odds_2024-09-05.csv");
    assert_eq!(data_lines(&daily), 16);
    let header_count = fs::read_to_string(&daily)
        .unwrap()
        .lines()
        .filter(|line| line.starts_with("timestamp,"))
        .count();
    assert_eq!(header_count, 1);

    let views = ViewBuilder::new(pipeline.store());
    let result = views.movement("abc123", Market::Moneyline).unwrap();
    assert!(result.skipped_files.is_empty());
    let Movement::Available(view) = result.view else {
        panic!("expected movement");
    };
    assert_eq!(view.previous_at, at(10, 0));
    assert_eq!(view.current_at, at(12, 0));

    let jets = view
        .lines
        .iter()
        .find(|l| l.bookmaker == "draftkings" && l.outcome_name == "New York Jets")
        .unwrap();
    assert_eq!(jets.price_delta, Some(15));

    let spreads = views.movement("abc123", Market::Spread).unwrap();
    let Movement::Available(spreads) = spreads.view else {
        panic!("expected movement");
    };
    assert!(spreads.lines.iter().all(|l| l.price_delta == Some(0)));
}

#[tokio::test]
async fn transport_and_status_failures_are_not_billed() {
    let dir = TempDir::new().unwrap();
    let pipeline = csv_pipeline(
        &dir,
        vec![
            Err(FeedError::Transport("connection reset".into())),
            Err(FeedError::Status {
                status: 401,
                body: "invalid api key".into(),
            }),
        ],
    );

    let first = pipeline.run_cycle_at(at(12, 0)).await;
    assert!(matches!(first, Err(CycleError::Fetch(FeedError::Transport(_)))));

    let second = pipeline.run_cycle_at(at(12, 30)).await;
    assert!(matches!(
        second,
        Err(CycleError::Fetch(FeedError::Status { status: 401, .. }))
    ));

    assert_eq!(pipeline.source().calls(), 2);
    assert!(!dir.path().join("api_usage.json").exists());
    assert!(pipeline.store().daily_keys().unwrap().is_empty());
    assert!(!dir.path().join("games").exists());
}

#[tokio::test]
async fn undecodable_response_is_billed() {
    let dir = TempDir::new().unwrap();
    let pipeline = csv_pipeline(&dir, vec![Err(FeedError::Decode("expected value".into()))]);

    let result = pipeline.run_cycle_at(at(12, 0)).await;
    assert!(matches!(result, Err(CycleError::Fetch(FeedError::Decode(_)))));

    assert_eq!(pipeline.quota().usage_for_month(at(12, 0)).unwrap(), 1);
    assert!(pipeline.store().daily_keys().unwrap().is_empty());
}

#[tokio::test]
async fn empty_response_is_billed_without_files() {
    let dir = TempDir::new().unwrap();
    let pipeline = csv_pipeline(&dir, vec![ok(Vec::new())]);

    let report = pipeline.run_cycle_at(at(12, 0)).await.unwrap();

    assert_eq!(report.records_written, 0);
    assert_eq!(report.games, 0);
    assert_eq!(report.quota_stats.calls_this_month, 1);
    assert!(pipeline.store().daily_keys().unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_quota_refuses_before_fetching() {
    let dir = TempDir::new().unwrap();
    let usage = dir.path().join("api_usage.json");
    let tracker = QuotaTracker::new(&usage, 2);
    tracker.record_call(at(8, 0)).unwrap();
    tracker.record_call(at(9, 0)).unwrap();

    let pipeline = IngestionPipeline::new(
        ScriptedSource::new(vec![ok(events(130))]),
        SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games")),
        QuotaTracker::new(&usage, 2),
    );

    let result = pipeline.run_cycle_at(at(12, 0)).await;
    assert!(matches!(
        result,
        Err(CycleError::QuotaExhausted { calls: 2, limit: 2 })
    ));
    assert_eq!(pipeline.source().calls(), 0);
    assert_eq!(pipeline.quota().usage_for_month(at(12, 0)).unwrap(), 2);
    assert!(pipeline.store().daily_keys().unwrap().is_empty());
}

#[tokio::test]
async fn partial_storage_failure_reports_rows_and_still_bills() {
    let dir = TempDir::new().unwrap();
    let source = ScriptedSource::new(vec![ok(events(130))]);
    let store = SnapshotStore::new(MemoryBackend::failing_after(3), MemoryBackend::new(), "nfl_odds");
    let pipeline = IngestionPipeline::new(
        source,
        store,
        QuotaTracker::new(dir.path().join("api_usage.json"), 500),
    );

    let result = pipeline.run_cycle_at(at(12, 0)).await;
    let err = result.unwrap_err();
    assert!(matches!(err, CycleError::Store(_)));
    assert_eq!(err.rows_written(), 3);

    let daily = pipeline.store().read_daily("nfl_odds_2024-09-05.csv").unwrap();
    assert_eq!(daily.records.len(), 3);
    assert_eq!(pipeline.quota().usage_for_month(at(12, 0)).unwrap(), 1);
}

#[tokio::test]
async fn corrupt_ledger_does_not_block_ingestion() {
    let dir = TempDir::new().unwrap();
    let usage = dir.path().join("api_usage.json");
    fs::write(&usage, "{not json").unwrap();

    let pipeline = csv_pipeline(&dir, vec![ok(events(130))]);
    let report = pipeline.run_cycle_at(at(12, 0)).await.unwrap();

    assert_eq!(report.records_written, 8);
    assert!(report.warnings.iter().any(|w| w.contains("unreadable")));
    assert_eq!(pipeline.quota().usage_for_month(at(12, 0)).unwrap(), 1);

    let quarantined = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .any(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("api_usage.json.corrupt-")
        });
    assert!(quarantined);
}

#[test]
fn in_memory_store_matches_file_layout() {
    let dir = TempDir::new().unwrap();
    let source = ScriptedSource::new(vec![ok(events(130))]);
    let pipeline = IngestionPipeline::new(
        source,
        SnapshotStore::in_memory("nfl_odds"),
        QuotaTracker::new(dir.path().join("api_usage.json"), 500),
    );

    let report = tokio_test::block_on(pipeline.run_cycle_at(at(12, 0))).unwrap();
    assert_eq!(report.records_written, 8);

    let store = pipeline.store();
    assert_eq!(store.daily_keys().unwrap(), vec!["nfl_odds_2024-09-05.csv".to_string()]);
    assert_eq!(store.daily().backend().header_writes("nfl_odds_2024-09-05.csv"), 1);
    assert_eq!(
        store.game_key("abc123").unwrap().as_deref(),
        Some("2024-09-08_New_York_Jets_at_New_England_Patriots_abc123.csv")
    );

    let state = ViewBuilder::new(store).latest_state("abc123").unwrap().view.unwrap();
    assert_eq!(state.bookmakers.len(), 2);
    assert_eq!(state.bookmakers["fanduel"].len(), 1);
}

#[tokio::test]
async fn refused_cycle_does_not_call_upstream() {
    let dir = TempDir::new().unwrap();
    let usage = dir.path().join("api_usage.json");
    QuotaTracker::new(&usage, 1).record_call(at(8, 0)).unwrap();

    let source = ScriptedSource::new(vec![ok(events(130))]);
    let pipeline = IngestionPipeline::new(
        source,
        SnapshotStore::in_memory("nfl_odds"),
        QuotaTracker::new(&usage, 1),
    );

    assert!(pipeline.run_cycle_at(at(12, 0)).await.is_err());
    assert_eq!(pipeline.source().calls(), 0);
    assert!(pipeline.store().daily_keys().unwrap().is_empty());
}
