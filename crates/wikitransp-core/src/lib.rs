//! wikitransp core - streaming transparency scanner for the WIT dataset.
//!
//! Finds PNG images with genuine semi-transparency (at least one alpha value
//! strictly between fully transparent and fully opaque) without downloading
//! most of them. Each candidate is streamed and parsed chunk by chunk, and
//! the connection is dropped as soon as the verdict is certain.
//!
//! # Architecture
//!
//! ```text
//! WIT TSV → filter (size, ban list) → fetch → chunk reader → classifier → TSV/JSONL
//!                                        ↑                                   |
//!                                        └──── bounded worker pool ──────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use wikitransp_core::{Config, Scan, ScanOptions};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> wikitransp_core::Result<()> {
//!     let config = Config::load()?;
//!     let scan = Scan::new(config)?;
//!     let options = ScanOptions {
//!         inputs: vec!["wit_v1.train.all-00000-of-00010.tsv.gz".into()],
//!         ..ScanOptions::default()
//!     };
//!     let report = scan.run(options, CancellationToken::new(), |_| {}).await?;
//!     eprint!("{}", report.render());
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod banlist;
pub mod config;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod png;
pub mod source;
pub mod telemetry;
pub mod types;

// Re-exports for convenient access
pub use banlist::{BanEntry, BanList, BanPolicy, BanStatus, FailureReason};
pub use config::Config;
pub use error::{ChunkError, ClassifyError, ConfigError, Result, SourceError, WikitranspError};
pub use output::{OutputFormat, OutputWriter};
pub use pipeline::{Resume, RunReport, RunTally, Scan, ScanOptions};
pub use png::{SizeBounds, TransparencyClassifier, Verdict};
pub use source::{HttpSource, ImageSource};
pub use telemetry::{Stage, StageSummary, Telemetry};
pub use types::{CandidateRow, ErrorKind, Outcome, OutcomeKind, RejectReason};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
