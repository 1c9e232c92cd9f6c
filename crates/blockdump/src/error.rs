//! Error and Result types for block dumps and the underlying block store.

use crate::tsdb::SeriesRef;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A convenience `Result` type for dump operations.
pub type Result<T> = std::result::Result<T, DumpError>;

/// A convenience `Result` type for storage engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Why a block directory could not be cataloged.
///
/// Each variant is a distinct outcome so a failed discovery can be traced to
/// the exact directory and reason.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// The database directory (or a directory entry) could not be listed.
    #[error("cannot list directory: {0}")]
    ReadDir(#[source] io::Error),

    /// The block directory has no `meta.json`.
    #[error("meta.json not found")]
    MissingMeta,

    /// `meta.json` exists but could not be read.
    #[error("cannot read meta.json: {0}")]
    UnreadableMeta(#[source] io::Error),

    /// `meta.json` is not valid block metadata.
    #[error("malformed meta.json: {0}")]
    MalformedMeta(#[source] serde_json::Error),

    /// `meta.json` declares a format version other than 1.
    #[error("unexpected meta file version {0}")]
    UnsupportedVersion(i64),
}

/// The error type for the storage engine (WAL, head, chunks, index, compactor).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid magic bytes at the start of an engine file.
    #[error("Invalid magic bytes: {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported engine file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// Stored checksum does not match the data.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Expected CRC32 checksum.
        expected: u32,
        /// Actual computed CRC32 checksum.
        actual: u32,
    },

    /// Structurally invalid data.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// A series reference is unknown to the head.
    #[error("Series not found: {0}")]
    NotFound(SeriesRef),

    /// A sample is older than the head accepts.
    #[error("Out of bounds: sample timestamp {timestamp} is before {min_valid}")]
    OutOfBounds {
        /// Timestamp of the rejected sample.
        timestamp: i64,
        /// Oldest timestamp the head currently accepts.
        min_valid: i64,
    },

    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A single WAL entry does not fit in one frame.
    #[error("WAL entry of {size} bytes exceeds frame limit {limit}")]
    RecordTooLarge {
        /// Encoded size of the entry with its frame header.
        size: usize,
        /// Frame payload limit.
        limit: usize,
    },

    /// Block metadata could not be loaded.
    #[error("Block metadata: {0}")]
    Meta(#[from] CatalogError),

    /// Block metadata could not be encoded.
    #[error("Encode metadata: {0}")]
    EncodeMeta(#[from] serde_json::Error),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// The error type for catalog, extraction and dump orchestration.
///
/// Every variant except `Config` and `Aggregate` names the operation and the
/// path it failed on.
#[derive(Debug, Error)]
pub enum DumpError {
    /// Invalid arguments: empty database path, inverted window, or a dump
    /// directory that resolves to the source directory.
    #[error("config error: {0}")]
    Config(String),

    /// The block catalog could not be built.
    #[error("discover blocks at {}: {source}", path.display())]
    Discovery {
        /// Directory being cataloged.
        path: PathBuf,
        /// What went wrong.
        #[source]
        source: CatalogError,
    },

    /// A directory could not be created or a file could not be linked.
    #[error("{op} {}: {source}", path.display())]
    Filesystem {
        /// Operation that failed.
        op: &'static str,
        /// Path the operation was applied to.
        path: PathBuf,
        /// Underlying filesystem error.
        #[source]
        source: io::Error,
    },

    /// The storage engine failed (WAL replay, head init, block write).
    #[error("{op} {}: {source}", path.display())]
    Engine {
        /// Operation that failed.
        op: &'static str,
        /// Path the operation was applied to.
        path: PathBuf,
        /// Underlying engine error.
        #[source]
        source: EngineError,
    },

    /// Several independent block extractions failed.
    #[error("{} block extractions failed", .0.len())]
    Aggregate(Vec<DumpError>),
}

/// The error type for sample import.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A line could not be parsed.
    #[error("line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// The input could not be read.
    #[error("read input: {0}")]
    Io(#[from] io::Error),

    /// The database rejected a batch.
    #[error("batch {batch}: {source}")]
    Engine {
        /// Index of the failed batch.
        batch: usize,
        /// Underlying engine error.
        #[source]
        source: EngineError,
    },
}

impl DumpError {
    pub(crate) fn filesystem(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Filesystem {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn engine(op: &'static str, path: &Path, source: EngineError) -> Self {
        Self::Engine {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn discovery(path: &Path, source: CatalogError) -> Self {
        Self::Discovery {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Returns true for argument and precondition failures.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns every leaf error, flattening `Aggregate`.
    pub fn leaves(&self) -> Vec<&DumpError> {
        match self {
            Self::Aggregate(errors) => errors.iter().flat_map(|e| e.leaves()).collect(),
            other => vec![other],
        }
    }
}
