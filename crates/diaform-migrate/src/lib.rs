// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # Diaform Migration Tool
//!
//! `diaform-migrate` is a CLI tool and library that moves a Diaform
//! knowledge base (users, things and the ordered connections between
//! things) from MongoDB into PostgreSQL in one resumable transaction.
//!
//! ## Phases
//!
//! | Phase | Writes | Notes |
//! |-------|--------|-------|
//! | Users | `users` | Identical rows are accepted, different passwords are reported |
//! | Things | `things` | `json_content` is derived with [`content::tokenize`] |
//! | Connections | `connections` | Inserted with `parent_index = -1` |
//! | Index repair | `connections.parent_index` | Replays each parent's ordering list |
//!
//! Rows that already exist are skipped, so an interrupted run is resumed by
//! running it again. Data problems never abort the run; they are collected
//! as [`report::IntegrityWarning`]s.
//!
//! ## Quick Start
//!
//! ```bash
//! diaform-migrate init -o migration.yaml
//! diaform-migrate run --config migration.yaml --dry-run
//! diaform-migrate run --config migration.yaml --report report.json
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   type: mongodb
//!   uri: mongodb://localhost:27017 # or DIAFORM_DATABASE
//!   database: diaform
//!
//! destination:
//!   type: postgres
//!   host: localhost
//!   username: postgres
//!
//! options:
//!   batch_size: 500
//!   legacy_children: false
//! ```

pub mod backfill;
pub mod config;
pub mod connectors;
pub mod content;
pub mod error;
pub mod legacy;
pub mod model;
pub mod ordering;
pub mod pipeline;
pub mod report;
pub mod reprocess;
pub mod retry;
pub mod source;
pub mod target;

pub use config::{DestinationConfig, MigrationConfig, MigrationOptions, SourceConfig};
pub use connectors::{Collection, ExtractedBatch, SourceConnector};
pub use content::{tokenize, Token};
pub use error::{Error, ErrorClass, Result};
pub use pipeline::{MigrationState, Pipeline};
pub use report::{IntegrityWarning, MigrationReport, PhaseStats, WarningKind};
pub use source::SourceReader;
pub use target::{create_target, TargetStore, WriteOutcome};
