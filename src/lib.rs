//! Testing-program result pipeline.
//!
//! The pipeline reconciles test records from two sources (the nightly lab
//! feed and the collection kiosks) into a single store keyed by specimen
//! barcode, aggregates them into dashboard-ready time series, and delivers
//! result notifications over email and SMS with full attempt bookkeeping.
//!
//! Module boundaries:
//! - `config` / `error`: runtime configuration and the shared error types
//! - `models` / `schema` / `store`: the record model and its SQLite store
//! - `search`: the filter set shared by queries and aggregations
//! - `ingest`: lab-feed file decoding and import
//! - `reconcile`: barcode upsert merging and the similar-record sweep
//! - `aggregate`: daily, hourly, weekday, and rolling-window totals
//! - `notify`: pending-record selection and outbound send passes
//! - `jobs`: the scheduled pass tying the above together

pub mod aggregate;
pub mod config;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod models;
pub mod notify;
pub mod reconcile;
pub mod schema;
pub mod search;
pub mod store;

pub use config::Config;
pub use error::{Error, Result, SendError};
pub use models::{Channel, Sample};
