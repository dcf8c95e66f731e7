//! Error taxonomy for the ingestion core.
//!
//! Each component owns a typed error so callers can choose between failing
//! open and failing closed. `anyhow` is only used at the binary edge.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Quota ledger load/save failures.
///
/// `NotFound` is the normal first-run state and is kept apart from `Corrupt`
/// so callers can tell "no ledger yet" from "ledger is damaged".
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("quota ledger not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("quota ledger at {} is corrupt: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("quota ledger I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LedgerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LedgerError::NotFound(_))
    }
}

/// Snapshot store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Append failed part-way. `rows_written` rows of the call are durable.
    #[error("failed appending to {key} after {rows_written} rows: {source}")]
    Write {
        key: String,
        rows_written: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed reading {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("partition {key} not found")]
    NotFound { key: String },

    #[error("partition {key} is not a snapshot file: {detail}")]
    Corrupt { key: String, detail: String },
}

impl StoreError {
    /// Rows durably written by the failing call (0 for read-side errors).
    pub fn rows_written(&self) -> usize {
        match self {
            StoreError::Write { rows_written, .. } => *rows_written,
            _ => 0,
        }
    }

    /// Adds rows written by earlier partitions of the same batch.
    pub(crate) fn with_prior_rows(self, prior: usize) -> Self {
        match self {
            StoreError::Write {
                key,
                rows_written,
                source,
            } => StoreError::Write {
                key,
                rows_written: rows_written + prior,
                source,
            },
            other => other,
        }
    }
}

/// Upstream fetch failures.
#[derive(Error, Debug)]
pub enum FeedError {
    /// The request never completed (DNS, connect, timeout).
    #[error("odds API request failed: {0}")]
    Transport(String),

    #[error("odds API error (status {status}): {body}")]
    Status { status: u16, body: String },

    /// A 2xx response whose body could not be decoded.
    #[error("failed to decode odds API response: {0}")]
    Decode(String),
}

impl FeedError {
    /// Whether the upstream counted this call against the quota.
    ///
    /// Only 2xx responses are billable; a body that fails to decode still
    /// reached the endpoint.
    pub fn is_billable(&self) -> bool {
        matches!(self, FeedError::Decode(_))
    }
}

/// Reasons an ingestion cycle aborts.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("monthly quota exhausted: {calls}/{limit} calls used")]
    QuotaExhausted { calls: u32, limit: u32 },

    #[error("upstream fetch failed: {0}")]
    Fetch(#[from] FeedError),

    #[error("snapshot storage failed: {0}")]
    Store(#[from] StoreError),
}

impl CycleError {
    /// Rows that made it to disk before the cycle failed.
    pub fn rows_written(&self) -> usize {
        match self {
            CycleError::Store(e) => e.rows_written(),
            _ => 0,
        }
    }
}
