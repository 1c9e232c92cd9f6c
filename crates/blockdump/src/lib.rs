//! Blockdump - time-range dumps of an Alopex block store.
//!
//! A block store keeps sealed, immutable blocks (`<db>/<ulid>/`) next to a
//! write-ahead log that rebuilds the not-yet-sealed head. This crate
//! extracts everything a time window touches into a separate directory.
//!
//! # Components
//!
//! - [`Dumper`]: opens a database for a window and runs the dump
//! - [`dump::catalog`]: block discovery and `meta.json` validation
//! - [`Window`]: closed-interval overlap test
//! - [`dump::extract`]: hard-link extraction of sealed blocks
//! - [`HeadManager`]: WAL replay and head flush
//! - [`tsdb`]: the block store itself (WAL, head, chunks, index, compactor)
//! - [`ingest`]: batched bulk import into a [`tsdb::Db`]
//!
//! # Example
//!
//! ```rust,ignore
//! use alopex_blockdump::Dumper;
//!
//! let dumper = Dumper::open("data/prometheus", 1_600_000_000_000, 1_600_003_600_000)?;
//! let report = dumper.dump("dump/2020-09-13")?;
//! println!("linked {} blocks, head block {:?}", report.linked.len(), report.head_block);
//! ```

#![deny(missing_docs)]

pub mod config;
pub mod dump;
pub mod error;
pub mod ingest;
pub mod tsdb;

pub use config::DumpConfig;
pub use dump::{Block, DumpReport, Dumper, HeadManager, LinkedBlock, Window};
pub use error::{CatalogError, DumpError, EngineError, IngestError, Result};
