#![forbid(unsafe_code)]

//! Core domain model and business logic for the training-load rollup engine.
//!
//! This crate provides:
//! - Domain types (workout inputs, set facts, series targets)
//! - Set fact generation and weekly delta aggregation
//! - Weekly series persistence over a document store
//! - Idempotency ledger, reconciliation and purge
//! - Capped, paginated read queries and progress flags
//! - Catalog attribution, lookup caching and CSV export

pub mod types;
pub mod error;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod week;
pub mod facts;
pub mod delta;
pub mod store;
pub mod file_store;
pub mod series;
pub mod ledger;
pub mod rollup;
pub mod cursor;
pub mod progress;
pub mod query;
pub mod cache;
pub mod export;

// Re-export commonly used types
pub use error::{Error, ErrorKind, Result};
pub use types::*;
pub use catalog::{build_default_catalog, AttributionProvider, StaticCatalog};
pub use config::Config;
pub use store::{DocumentStore, MemoryStore};
pub use file_store::FileStore;
pub use series::{WeekPoint, WeeklySeries};
pub use rollup::{ApplyReport, RetractReport, RollupEngine};
pub use query::{ProgressRequest, QueryCapsEngine, SeriesRequest, SeriesTarget, SetQueryRequest};
pub use cache::CachedCatalog;
pub use export::export_series_csv;
