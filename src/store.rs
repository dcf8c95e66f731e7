//! Append-only snapshot store.
//!
//! Storage is split into two seams:
//! - [`AppendBackend`]: where partitions live (a CSV directory, or memory for tests).
//! - [`SnapshotLayout`]: how records map to partitions (one per day, or one per game).
//!
//! Partitions are only ever appended to. The header is written when a
//! partition is first created and never again. Rows are flushed one at a
//! time, so an interrupted append leaves every earlier row intact.

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::error::StoreError;
use crate::model::{OddsRecord, CSV_COLUMNS};

/// Extension of every snapshot partition.
pub const SNAPSHOT_EXT: &str = "csv";

/// Rows read back from one partition.
#[derive(Debug, Clone, Default)]
pub struct PartitionRead {
    pub records: Vec<OddsRecord>,
    /// Rows that failed to parse (e.g. a torn final row) and were skipped.
    pub bad_rows: usize,
}

/// A keyed set of append-only partitions.
pub trait AppendBackend: Send + Sync {
    /// Appends rows to `key`, writing the header first if the partition is new.
    ///
    /// Returns the number of rows appended. On error, the rows reported in
    /// [`StoreError::Write`] are durable.
    fn append(&self, key: &str, records: &[&OddsRecord]) -> Result<usize, StoreError>;

    fn read(&self, key: &str) -> Result<PartitionRead, StoreError>;

    /// First readable row of `key`, or `None` for a partition with no rows.
    fn first_record(&self, key: &str) -> Result<Option<OddsRecord>, StoreError> {
        Ok(self.read(key)?.records.into_iter().next())
    }

    /// Partition keys, sorted.
    fn keys(&self) -> Result<Vec<String>, StoreError>;
}

// ── CSV directory backend ────────────────────────────────────────────

/// One CSV file per partition key inside `dir`.
#[derive(Debug, Clone)]
pub struct CsvDirBackend {
    dir: PathBuf,
}

impl CsvDirBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    /// Opens `path` for append and reports whether it still needs a header.
    ///
    /// A file whose last byte is not a newline was torn by an earlier crash;
    /// the partial row is terminated so the next row starts on its own line.
    fn open_for_append(path: &Path) -> io::Result<(File, bool)> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            return Ok((file, true));
        }

        file.seek(SeekFrom::Start(len - 1))?;
        let mut last = [0u8; 1];
        file.read_exact(&mut last)?;
        if last[0] != b'\n' {
            warn!("Terminating torn final row in {}", path.display());
            file.write_all(b"\n")?;
        }
        Ok((file, false))
    }

    /// Opens `key` for reading and checks it carries the snapshot columns.
    fn reader(&self, key: &str) -> Result<csv::Reader<File>, StoreError> {
        let path = self.path_for(key);
        let file = File::open(&path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                StoreError::NotFound {
                    key: key.to_string(),
                }
            } else {
                StoreError::Read {
                    key: key.to_string(),
                    source: e,
                }
            }
        })?;

        let mut reader = csv::ReaderBuilder::new().flexible(true).from_reader(file);
        let headers = reader.headers().map_err(|e| StoreError::Read {
            key: key.to_string(),
            source: e.into(),
        })?;
        let missing: Vec<&str> = CSV_COLUMNS
            .iter()
            .copied()
            .filter(|col| !headers.iter().any(|h| h == *col))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                detail: format!("missing columns {}", missing.join(", ")),
            });
        }
        Ok(reader)
    }
}

impl AppendBackend for CsvDirBackend {
    fn append(&self, key: &str, records: &[&OddsRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let fail = |written: usize, source: io::Error| StoreError::Write {
            key: key.to_string(),
            rows_written: written,
            source,
        };

        fs::create_dir_all(&self.dir).map_err(|e| fail(0, e))?;
        let path = self.path_for(key);
        let (file, needs_header) = Self::open_for_append(&path).map_err(|e| fail(0, e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);

        if needs_header {
            writer
                .write_record(CSV_COLUMNS)
                .and_then(|_| writer.flush().map_err(csv::Error::from))
                .map_err(|e| fail(0, e.into()))?;
        }

        for record in records {
            writer
                .serialize(record)
                .map_err(|e| fail(written, e.into()))?;
            writer.flush().map_err(|e| fail(written, e))?;
            written += 1;
        }

        Ok(written)
    }

    fn read(&self, key: &str) -> Result<PartitionRead, StoreError> {
        let mut reader = self.reader(key)?;
        let mut out = PartitionRead::default();
        for row in reader.deserialize::<OddsRecord>() {
            match row {
                Ok(record) => out.records.push(record),
                Err(e) => {
                    warn!("Skipping unreadable row in {}: {}", key, e);
                    out.bad_rows += 1;
                }
            }
        }
        Ok(out)
    }

    fn first_record(&self, key: &str) -> Result<Option<OddsRecord>, StoreError> {
        let mut reader = self.reader(key)?;
        let first = reader.deserialize::<OddsRecord>().find_map(|row| row.ok());
        Ok(first)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(StoreError::Read {
                    key: self.dir.display().to_string(),
                    source: e,
                })
            }
        };

        let mut keys: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.ends_with(&format!(".{}", SNAPSHOT_EXT)))
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// ── In-memory backend ────────────────────────────────────────────────

#[derive(Debug, Default, Clone)]
struct MemoryPartition {
    header_writes: usize,
    rows: Vec<OddsRecord>,
}

/// Same contract as [`CsvDirBackend`], without touching disk.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    partitions: Mutex<BTreeMap<String, MemoryPartition>>,
    /// Fail every append once this many rows exist in total.
    fail_after: Option<usize>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend whose appends start failing after `rows` total rows.
    pub fn failing_after(rows: usize) -> Self {
        Self {
            fail_after: Some(rows),
            ..Self::default()
        }
    }

    /// Times the header was written for `key`; 1 for any existing partition.
    pub fn header_writes(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, |p| p.header_writes)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, MemoryPartition>> {
        self.partitions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AppendBackend for MemoryBackend {
    fn append(&self, key: &str, records: &[&OddsRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut partitions = self.lock();
        let mut total: usize = partitions.values().map(|p| p.rows.len()).sum();
        let partition = partitions.entry(key.to_string()).or_default();
        if partition.header_writes == 0 {
            partition.header_writes = 1;
        }

        let mut written = 0;
        for record in records {
            if self.fail_after.map_or(false, |limit| total >= limit) {
                return Err(StoreError::Write {
                    key: key.to_string(),
                    rows_written: written,
                    source: io::Error::new(ErrorKind::Other, "simulated disk full"),
                });
            }
            partition.rows.push((*record).clone());
            written += 1;
            total += 1;
        }
        Ok(written)
    }

    fn read(&self, key: &str) -> Result<PartitionRead, StoreError> {
        self.lock()
            .get(key)
            .map(|p| PartitionRead {
                records: p.rows.clone(),
                bad_rows: 0,
            })
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.lock().keys().cloned().collect())
    }
}

// ── Layouts ──────────────────────────────────────────────────────────

/// Maps records to the partitions they belong in.
pub trait SnapshotLayout: Send + Sync {
    /// Records with the same group always share a partition.
    fn group_of(&self, record: &OddsRecord) -> String;

    /// Partition for the group `record` starts. `existing` holds the keys
    /// already present in `backend`.
    fn partition_key<B: AppendBackend>(
        &self,
        record: &OddsRecord,
        backend: &B,
        existing: &BTreeSet<String>,
    ) -> String;
}

/// One partition per UTC calendar day of `recorded_at`: `{prefix}_{YYYY-MM-DD}.csv`.
#[derive(Debug, Clone)]
pub struct DailyLayout {
    prefix: String,
}

impl DailyLayout {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key_for_date(&self, date: NaiveDate) -> String {
        format!("{}_{}.{}", self.prefix, date.format("%Y-%m-%d"), SNAPSHOT_EXT)
    }

    /// The day a key belongs to, or `None` if it is not one of ours.
    pub fn date_of(&self, key: &str) -> Option<NaiveDate> {
        let stem = key
            .strip_prefix(&self.prefix)?
            .strip_prefix('_')?
            .strip_suffix(SNAPSHOT_EXT)?
            .strip_suffix('.')?;
        NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
    }
}

impl SnapshotLayout for DailyLayout {
    fn group_of(&self, record: &OddsRecord) -> String {
        self.key_for_date(record.recorded_at.date_naive())
    }

    fn partition_key<B: AppendBackend>(
        &self,
        record: &OddsRecord,
        _backend: &B,
        _existing: &BTreeSet<String>,
    ) -> String {
        self.group_of(record)
    }
}

/// One partition per game: `{commence_date}_{away}_at_{home}_{game_id}.csv`.
///
/// A partition belongs to the game id of its first row. The name only
/// narrows the search: `x_123` and `123` produce names sharing a suffix, and
/// ids that sanitize alike produce the same name, in which case the later
/// game gets `{stem}~{n}.csv`.
///
/// An existing partition for the game id is always reused, so a rescheduled
/// kickoff keeps appending to the file the game started in.
#[derive(Debug, Clone, Default)]
pub struct GameLayout;

impl GameLayout {
    /// Whether `key` is named like a partition of `game_id`.
    fn named_for(game_id: &str, key: &str) -> bool {
        let Some(stem) = key
            .strip_suffix(SNAPSHOT_EXT)
            .and_then(|k| k.strip_suffix('.'))
        else {
            return false;
        };
        let stem = match stem.rsplit_once('~') {
            Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => base,
            _ => stem,
        };
        stem.ends_with(&format!("_{}", sanitize_component(game_id)))
    }

    /// Game id of the partition's first row. Unreadable partitions own nothing.
    fn owner<B: AppendBackend>(backend: &B, key: &str) -> Result<Option<String>, ()> {
        match backend.first_record(key) {
            Ok(first) => Ok(first.map(|r| r.game_id)),
            Err(e) => {
                warn!("Cannot tell which game {} belongs to: {}", key, e);
                Err(())
            }
        }
    }

    /// The partition already holding rows for `game_id`, if any.
    pub fn find_existing<B: AppendBackend>(
        game_id: &str,
        backend: &B,
        keys: &BTreeSet<String>,
    ) -> Option<String> {
        keys.iter()
            .filter(|key| Self::named_for(game_id, key))
            .find(|key| matches!(Self::owner(backend, key), Ok(Some(ref id)) if id == game_id))
            .cloned()
    }
}

fn disambiguate(base: &str, n: usize) -> String {
    let stem = base
        .strip_suffix(SNAPSHOT_EXT)
        .and_then(|k| k.strip_suffix('.'))
        .unwrap_or(base);
    format!("{}~{}.{}", stem, n, SNAPSHOT_EXT)
}

impl SnapshotLayout for GameLayout {
    fn group_of(&self, record: &OddsRecord) -> String {
        record.game_id.clone()
    }

    fn partition_key<B: AppendBackend>(
        &self,
        record: &OddsRecord,
        backend: &B,
        existing: &BTreeSet<String>,
    ) -> String {
        if let Some(key) = Self::find_existing(&record.game_id, backend, existing) {
            return key;
        }

        let base = game_file_name(
            record.commence_time.date_naive(),
            &record.away_team,
            &record.home_team,
            &record.game_id,
        );
        let mut key = base.clone();
        let mut n = 0;
        // A header-only partition has no owner yet and can be claimed.
        while existing.contains(&key) && Self::owner(backend, &key) != Ok(None) {
            n += 1;
            key = disambiguate(&base, n);
        }
        key
    }
}

/// Deterministic per-game filename.
pub fn game_file_name(commence_date: NaiveDate, away_team: &str, home_team: &str, game_id: &str) -> String {
    format!(
        "{}_{}_at_{}_{}.{}",
        commence_date.format("%Y-%m-%d"),
        sanitize_component(away_team),
        sanitize_component(home_team),
        sanitize_component(game_id),
        SNAPSHOT_EXT
    )
}

/// Spaces become `_`, `&` becomes `and`, path and shell-hostile characters become `_`.
pub fn sanitize_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        match ch {
            '&' => out.push_str("and"),
            ' ' | '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '~' => out.push('_'),
            c if c.is_control() => continue,
            c => out.push(c),
        }
    }
    out
}

// ── Partitioned log ──────────────────────────────────────────────────

/// A backend paired with a layout.
#[derive(Debug)]
pub struct PartitionedLog<B, L> {
    backend: B,
    layout: L,
}

impl<B: AppendBackend, L: SnapshotLayout> PartitionedLog<B, L> {
    pub fn new(backend: B, layout: L) -> Self {
        Self { backend, layout }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn layout(&self) -> &L {
        &self.layout
    }

    /// Groups records (first-seen order, input order within a group) and
    /// appends each group to its partition. Returns rows appended in total.
    pub fn append(&self, records: &[OddsRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&OddsRecord>> = HashMap::new();
        for record in records {
            let group = self.layout.group_of(record);
            groups
                .entry(group.clone())
                .or_insert_with(|| {
                    order.push(group);
                    Vec::new()
                })
                .push(record);
        }

        let mut existing: BTreeSet<String> = self.backend.keys()?.into_iter().collect();
        let mut total = 0;
        for group in &order {
            let rows = &groups[group];
            let key = self.layout.partition_key(rows[0], &self.backend, &existing);
            total += self
                .backend
                .append(&key, rows)
                .map_err(|e| e.with_prior_rows(total))?;
            existing.insert(key);
        }
        Ok(total)
    }
}

// ── Snapshot store ───────────────────────────────────────────────────

/// Daily rollup plus per-game archive over the same backend type.
#[derive(Debug)]
pub struct SnapshotStore<B> {
    daily: PartitionedLog<B, DailyLayout>,
    games: PartitionedLog<B, GameLayout>,
}

impl SnapshotStore<CsvDirBackend> {
    /// Daily files in `data_dir`, game files in `games_dir`.
    pub fn open_dir(data_dir: impl Into<PathBuf>, daily_prefix: &str, games_dir: impl Into<PathBuf>) -> Self {
        Self::new(
            CsvDirBackend::new(data_dir),
            CsvDirBackend::new(games_dir),
            daily_prefix,
        )
    }
}

impl SnapshotStore<MemoryBackend> {
    pub fn in_memory(daily_prefix: &str) -> Self {
        Self::new(MemoryBackend::new(), MemoryBackend::new(), daily_prefix)
    }
}

impl<B: AppendBackend> SnapshotStore<B> {
    pub fn new(daily_backend: B, games_backend: B, daily_prefix: &str) -> Self {
        Self {
            daily: PartitionedLog::new(daily_backend, DailyLayout::new(daily_prefix)),
            games: PartitionedLog::new(games_backend, GameLayout),
        }
    }

    pub fn daily(&self) -> &PartitionedLog<B, DailyLayout> {
        &self.daily
    }

    pub fn games(&self) -> &PartitionedLog<B, GameLayout> {
        &self.games
    }

    /// Appends to the daily rollup of each record's `recorded_at` date.
    pub fn append_daily(&self, records: &[OddsRecord]) -> Result<usize, StoreError> {
        let rows = self.daily.append(records)?;
        if rows > 0 {
            info!("Appended {} rows to daily snapshot", rows);
        }
        Ok(rows)
    }

    /// Appends each game's records to that game's archive file.
    pub fn append_per_game(&self, records: &[OddsRecord]) -> Result<usize, StoreError> {
        let rows = self.games.append(records)?;
        if rows > 0 {
            info!("Appended {} rows across per-game snapshots", rows);
        }
        Ok(rows)
    }

    /// Daily partition keys, oldest first.
    pub fn daily_keys(&self) -> Result<Vec<String>, StoreError> {
        let layout = self.daily.layout();
        let mut keys: Vec<(NaiveDate, String)> = self
            .daily
            .backend()
            .keys()?
            .into_iter()
            .filter_map(|key| layout.date_of(&key).map(|date| (date, key)))
            .collect();
        keys.sort();
        Ok(keys.into_iter().map(|(_, key)| key).collect())
    }

    pub fn latest_daily_key(&self) -> Result<Option<String>, StoreError> {
        Ok(self.daily_keys()?.pop())
    }

    pub fn read_daily(&self, key: &str) -> Result<PartitionRead, StoreError> {
        self.daily.backend().read(key)
    }

    /// The archive partition for `game_id`, if one exists.
    pub fn game_key(&self, game_id: &str) -> Result<Option<String>, StoreError> {
        let keys: BTreeSet<String> = self.games.backend().keys()?.into_iter().collect();
        Ok(GameLayout::find_existing(game_id, self.games.backend(), &keys))
    }

    pub fn read_game(&self, key: &str) -> Result<PartitionRead, StoreError> {
        self.games.backend().read(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Market;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::TempDir;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 9, d, h, 0, 0).unwrap()
    }

    fn record(game_id: &str, recorded_at: DateTime<Utc>, outcome: &str, price: i32) -> OddsRecord {
        OddsRecord {
            recorded_at,
            game_id: game_id.to_string(),
            commence_time: at(8, 17),
            home_team: "New England Patriots".to_string(),
            away_team: "New York Jets".to_string(),
            bookmaker: "draftkings".to_string(),
            market: Market::Moneyline,
            outcome_name: outcome.to_string(),
            price,
            point: None,
        }
    }

    fn batch(recorded_at: DateTime<Utc>) -> Vec<OddsRecord> {
        vec![
            record("abc123", recorded_at, "New England Patriots", -150),
            record("abc123", recorded_at, "New York Jets", 130),
            record("def456", recorded_at, "Over", -110),
        ]
    }

    #[test]
    fn per_game_filename_matches_expected_pattern() {
        let date = NaiveDate::from_ymd_opt(2024, 9, 8).unwrap();
        let name = game_file_name(date, "New York Jets", "New England Patriots", "abc123");
        assert_eq!(name, "2024-09-08_New_York_Jets_at_New_England_Patriots_abc123.csv");
        assert_eq!(
            name,
            game_file_name(date, "New York Jets", "New England Patriots", "abc123")
        );
    }

    #[test]
    fn sanitize_replaces_ampersand_and_separators() {
        assert_eq!(sanitize_component("Texas A&M Aggies"), "Texas_AandM_Aggies");
        assert_eq!(sanitize_component("a/b\\c"), "a_b_c");
    }

    #[test]
    fn daily_layout_round_trips_dates() {
        let layout = DailyLayout::new("nfl_odds");
        let date = NaiveDate::from_ymd_opt(2024, 9, 5).unwrap();
        let key = layout.key_for_date(date);
        assert_eq!(key, "nfl_odds_2024-09-05.csv");
        assert_eq!(layout.date_of(&key), Some(date));
        assert_eq!(layout.date_of("2024-09-08_Jets_at_Pats_abc.csv"), None);
    }

    #[test]
    fn repeated_daily_appends_write_header_once_in_memory() {
        let store = SnapshotStore::in_memory("nfl_odds");
        let records = batch(at(5, 12));

        store.append_daily(&records).unwrap();
        store.append_daily(&records).unwrap();

        let key = "nfl_odds_2024-09-05.csv";
        assert_eq!(store.daily().backend().header_writes(key), 1);
        assert_eq!(store.read_daily(key).unwrap().records.len(), 6);
    }

    #[test]
    fn repeated_daily_appends_write_header_once_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games"));
        let records = batch(at(5, 12));

        assert_eq!(store.append_daily(&records).unwrap(), 3);
        assert_eq!(store.append_daily(&records).unwrap(), 3);

        let raw = fs::read_to_string(dir.path().join("nfl_odds_2024-09-05.csv")).unwrap();
        assert_eq!(raw.matches("timestamp,game_id").count(), 1);
        assert_eq!(raw.lines().count(), 7);

        let read = store.read_daily("nfl_odds_2024-09-05.csv").unwrap();
        assert_eq!(read.records.len(), 6);
        assert_eq!(read.records[0], records[0]);
        assert_eq!(read.records[3], records[0]);
    }

    #[test]
    fn per_game_appends_group_by_game() {
        let dir = TempDir::new().unwrap();
        let games = dir.path().join("games");
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", &games);

        assert_eq!(store.append_per_game(&batch(at(5, 12))).unwrap(), 3);
        assert_eq!(store.append_per_game(&batch(at(6, 12))).unwrap(), 3);

        let key = store.game_key("abc123").unwrap().unwrap();
        assert_eq!(key, "2024-09-08_New_York_Jets_at_New_England_Patriots_abc123.csv");
        let read = store.read_game(&key).unwrap();
        assert_eq!(read.records.len(), 4);
        assert!(read.records.iter().all(|r| r.game_id == "abc123"));
        assert_eq!(store.games().backend().keys().unwrap().len(), 2);
    }

    #[test]
    fn game_ids_sharing_a_name_suffix_get_separate_files() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games"));

        let first = vec![record("x_123", at(5, 12), "New York Jets", 130)];
        let second = vec![record("123", at(5, 12), "New York Jets", 155)];
        store.append_per_game(&first).unwrap();
        store.append_per_game(&second).unwrap();
        store.append_per_game(&[first[0].clone(), second[0].clone()]).unwrap();

        let x_key = store.game_key("x_123").unwrap().unwrap();
        let key = store.game_key("123").unwrap().unwrap();
        assert_eq!(x_key, "2024-09-08_New_York_Jets_at_New_England_Patriots_x_123.csv");
        assert_ne!(key, x_key);
        assert_eq!(store.games().backend().keys().unwrap().len(), 2);

        let x_rows = store.read_game(&x_key).unwrap().records;
        assert_eq!(x_rows.len(), 2);
        assert!(x_rows.iter().all(|r| r.game_id == "x_123"));
        let rows = store.read_game(&key).unwrap().records;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.game_id == "123" && r.price == 155));
    }

    #[test]
    fn ids_that_sanitize_alike_are_disambiguated() {
        let store = SnapshotStore::in_memory("nfl_odds");
        store
            .append_per_game(&[record("a b", at(5, 12), "Over", -110)])
            .unwrap();
        store
            .append_per_game(&[record("a_b", at(5, 12), "Over", -105)])
            .unwrap();

        let spaced = store.game_key("a b").unwrap().unwrap();
        let underscored = store.game_key("a_b").unwrap().unwrap();
        assert_eq!(spaced, "2024-09-08_New_York_Jets_at_New_England_Patriots_a_b.csv");
        assert_eq!(underscored, "2024-09-08_New_York_Jets_at_New_England_Patriots_a_b~1.csv");
        assert_eq!(store.read_game(&underscored).unwrap().records[0].price, -105);
    }

    #[test]
    fn rescheduled_game_keeps_its_file() {
        let store = SnapshotStore::in_memory("nfl_odds");
        store.append_per_game(&batch(at(5, 12))).unwrap();

        let mut moved = batch(at(6, 12));
        for r in &mut moved {
            r.commence_time = at(9, 0);
        }
        store.append_per_game(&moved).unwrap();

        let keys = store.games().backend().keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().all(|k| k.starts_with("2024-09-08_")));
    }

    #[test]
    fn write_failure_reports_rows_already_written() {
        let store = SnapshotStore::new(MemoryBackend::failing_after(2), MemoryBackend::new(), "nfl_odds");
        let records = batch(at(5, 12));

        let err = store.append_daily(&records).unwrap_err();
        assert_eq!(err.rows_written(), 2);
        assert_eq!(store.read_daily("nfl_odds_2024-09-05.csv").unwrap().records.len(), 2);
    }

    #[test]
    fn torn_final_row_is_isolated() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games"));
        store.append_daily(&batch(at(5, 12))).unwrap();

        let path = dir.path().join("nfl_odds_2024-09-05.csv");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"2024-09-05T12:00:00Z,abc123,2024-09-08T17:00:00Z,New Eng").unwrap();
        drop(file);

        store.append_daily(&batch(at(5, 14))).unwrap();

        let read = store.read_daily("nfl_odds_2024-09-05.csv").unwrap();
        assert_eq!(read.records.len(), 6);
        assert_eq!(read.bad_rows, 1);
    }

    #[test]
    fn non_snapshot_files_are_rejected_on_read() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("nfl_odds_2024-09-05.csv"), "a,b,c\n1,2,3\n").unwrap();
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games"));

        assert!(matches!(
            store.read_daily("nfl_odds_2024-09-05.csv"),
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[test]
    fn daily_keys_are_date_ordered_and_filtered() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games"));
        store.append_daily(&batch(at(6, 12))).unwrap();
        store.append_daily(&batch(at(5, 12))).unwrap();
        fs::write(dir.path().join("notes.csv"), "x\n").unwrap();

        assert_eq!(
            store.daily_keys().unwrap(),
            vec!["nfl_odds_2024-09-05.csv", "nfl_odds_2024-09-06.csv"]
        );
        assert_eq!(
            store.latest_daily_key().unwrap().as_deref(),
            Some("nfl_odds_2024-09-06.csv")
        );
    }

    #[test]
    fn empty_batch_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open_dir(dir.path(), "nfl_odds", dir.path().join("games"));

        assert_eq!(store.append_daily(&[]).unwrap(), 0);
        assert_eq!(store.append_per_game(&[]).unwrap(), 0);
        assert!(store.daily_keys().unwrap().is_empty());
    }
}
