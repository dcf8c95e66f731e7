//! Quota-aware odds logger.
//!
//! Polls The Odds API on a weekly schedule, flattens each response into
//! timestamped odds rows, appends them to daily and per-game CSV snapshots,
//! and rebuilds latest-state and line-movement views from that history.

pub mod config;
pub mod dashboard;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod model;
pub mod normalize;
pub mod quota;
pub mod schedule;
pub mod store;
pub mod views;

pub use config::{Config, FeedConfig};
pub use error::{CycleError, FeedError, LedgerError, StoreError};
pub use ingest::{CycleReport, IngestionPipeline};
pub use model::{Market, OddsRecord};
pub use quota::{QuotaStats, QuotaTracker};
pub use store::SnapshotStore;
