//! Error types for the wikitransp scanning pipeline.
//!
//! Errors are organized by layer: configuration, the PNG container parser, the
//! scanline decoder, the classifier, and the network source. Per-candidate
//! failures are folded into an [`Outcome`](crate::types::Outcome) by the fetch
//! worker; only [`WikitranspError`] ever reaches the caller of a scan.

use std::path::PathBuf;
use thiserror::Error;

use crate::pipeline::RunReport;

/// Top-level error type for wikitransp operations.
#[derive(Error, Debug)]
pub enum WikitranspError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The input table could not be read at all
    #[error("Input error for {path}: {message}")]
    Input { path: PathBuf, message: String },

    /// The ban list file could not be loaded or saved
    #[error("Ban list error for {path}: {message}")]
    BanList { path: PathBuf, message: String },

    /// The HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// General I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A run failed after dispatch finished; `report` covers the work that settled
    #[error("{source}")]
    Aborted {
        source: Box<WikitranspError>,
        report: Box<RunReport>,
    },
}

impl WikitranspError {
    /// Summary of the candidates settled before the run failed, if any.
    pub fn partial_report(&self) -> Option<&RunReport> {
        match self {
            Self::Aborted { report, .. } => Some(report.as_ref()),
            _ => None,
        }
    }

    /// The underlying failure, looking through [`Aborted`](Self::Aborted).
    pub fn root(&self) -> &WikitranspError {
        match self {
            Self::Aborted { source, .. } => source.root(),
            other => other,
        }
    }
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to read the config file from disk
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    /// Failed to parse TOML configuration
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Configuration values are invalid
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Failures opening or reading a network stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The server answered outside the 2xx range
    #[error("HTTP status {0}")]
    Status(u16),

    /// Connection could not be established or broke mid-body
    #[error("Connection failure: {0}")]
    Connection(String),

    /// The transport reported its own timeout
    #[error("Transport timeout")]
    Timeout,
}

/// Errors raised while framing a byte stream into PNG chunks.
#[derive(Error, Debug)]
pub enum ChunkError {
    /// The stream does not start with the PNG signature
    #[error("Missing PNG signature")]
    NotPng,

    /// The stream ended before a chunk was complete
    #[error("Stream truncated at byte {offset} (needed {needed} more)")]
    Truncated { offset: u64, needed: usize },

    /// Chunk framing is inconsistent (bad length, bad type tag)
    #[error("Malformed chunk at byte {offset}: {message}")]
    Malformed { offset: u64, message: String },

    /// The underlying stream failed
    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Errors raised while inflating and unfiltering image data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanlineError {
    /// The zlib stream is corrupt
    #[error("Inflate failed: {0}")]
    Inflate(String),

    /// A scanline carried a filter type outside 0..=4
    #[error("Invalid filter type {filter} on row {row}")]
    BadFilter { filter: u8, row: u32 },
}

/// Errors raised by the transparency classifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// The header chunk is missing, misplaced, or has invalid fields
    #[error("Invalid header: {0}")]
    InvalidHeader(String),

    /// Chunks arrived in an order the format forbids
    #[error("Chunk ordering violation: {0}")]
    Ordering(String),

    /// Image data could not be decoded
    #[error(transparent)]
    Scanline(#[from] ScanlineError),
}

/// Convenience type alias for wikitransp results.
pub type Result<T> = std::result::Result<T, WikitranspError>;
