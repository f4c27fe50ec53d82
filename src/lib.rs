//! # device-enrich
//!
//! A row-group pipeline that corrects device fields and enriches event
//! records with reverse-geocoded locations.
//!
//! Input Parquet files are read one row-group at a time. Each row-group
//! goes through device correction (vendor token stripping and a model
//! table lookup) and location enrichment (a cached, concurrency-bounded
//! reverse geocoder), and the results are merged into an output file of
//! the same name. A checkpoint and a status ledger record progress.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────┐   ┌──────────┐   ┌─────────────┐
//! │ input/*.pq  │──▶│ correct  │──▶│  enrich  │──▶│ output/*.pq │
//! │ row-groups  │   │ (vendor, │   │ (geocode │   │ merge+dedup │
//! └─────────────┘   │  models) │   │  cache)  │   └─────────────┘
//!                   └────┬─────┘   └────┬─────┘
//!                        ▼              ▼
//!                   ┌─────────────────────────┐
//!                   │  KvStore (SQLite / mem) │
//!                   └─────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! denrich init                  # create the store schema
//! denrich learn                 # fold inputs into the model table
//! denrich run --clean           # clean, then correct and enrich
//! denrich stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`logging`] | Tracing subscriber setup |
//! | [`error`] | Domain error taxonomy |
//! | [`models`] | Records, model details, geocode properties, coordinates |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`kv`] | Key-value abstraction (SQLite and in-memory) |
//! | [`vendor`] | Vendor set and user-agent vendor extraction |
//! | [`mapping`] | Vendor set and model table persistence |
//! | [`correct`] | Device corrector |
//! | [`geocode`] | Bounded-concurrency reverse geocoder |
//! | [`location`] | Location cache |
//! | [`enrich`] | Enrichment stage and output transform |
//! | [`parquet_io`] | Row-group reads and atomic output writes |
//! | [`progress`] | Checkpoint and status ledger |
//! | [`connector_fs`] | Input discovery |
//! | [`ingest`] | Row-group orchestrator |
//! | [`learn`] | Model table learning pass |
//! | [`clean`] | Input cleaning pass |
//! | [`stats`] | Store overview |

pub mod clean;
pub mod config;
pub mod connector_fs;
pub mod correct;
pub mod db;
pub mod enrich;
pub mod error;
pub mod geocode;
pub mod ingest;
pub mod kv;
pub mod learn;
pub mod location;
pub mod logging;
pub mod mapping;
pub mod migrate;
pub mod models;
pub mod parquet_io;
pub mod progress;
pub mod stats;
pub mod vendor;
