//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Candidate selection and dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Maximum concurrent fetches
    pub concurrency: usize,

    /// Scan a random sample of the input instead of every row
    pub sample: bool,

    /// Fraction of rows kept when sampling
    pub sample_fraction: f64,

    /// Seed for the sampling RNG, so sampled runs are reproducible
    pub sample_seed: u64,

    /// Minimum length of the shorter side in pixels (0 disables)
    pub min_size: u32,

    /// Maximum length of the longer side in pixels (0 disables)
    pub max_size: u32,

    /// Only rows declaring this MIME type are considered
    pub mime_type: String,

    /// Fetch a Commons thumbnail of this width instead of the original (0 disables)
    pub thumbnail_width: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            sample: false,
            sample_fraction: 0.01,
            sample_seed: 42,
            min_size: 1000,
            max_size: 0,
            mime_type: "image/png".to_string(),
            thumbnail_width: 0,
        }
    }
}

/// Network fetch and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Per-attempt deadline in milliseconds
    pub timeout_ms: u64,

    /// TCP/TLS connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Extra attempts after a decode error
    pub decode_retries: u32,

    /// Extra attempts after a timeout
    pub timeout_retries: u32,

    /// Deadline multiplier applied on each timeout retry
    pub timeout_backoff_factor: u32,

    /// Delay before a retry in milliseconds
    pub retry_delay_ms: u64,

    /// User-Agent header sent with every request
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            connect_timeout_ms: 5_000,
            decode_retries: 1,
            timeout_retries: 0,
            timeout_backoff_factor: 2,
            retry_delay_ms: 250,
            user_agent: format!(
                "wikitransp/{} (https://github.com/lmmx/wikitransp)",
                env!("CARGO_PKG_VERSION")
            ),
        }
    }
}

/// PNG classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Compressed image-data bytes inspected before settling a verdict
    pub max_image_data_bytes: u64,

    /// Check chunk CRCs (mismatches are logged, never fatal)
    pub verify_crc: bool,

    /// Largest image-data slice handed to the decoder at once
    pub max_slice_bytes: usize,

    /// Headers declaring a wider decoded scanline are decode errors
    pub max_row_bytes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_image_data_bytes: 4 * 1024 * 1024,
            verify_crc: true,
            max_slice_bytes: 16 * 1024,
            max_row_bytes: 1024 * 1024,
        }
    }
}

/// Ban list settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BansConfig {
    /// Ban list file (JSON lines)
    pub path: PathBuf,

    /// Qualifying failures before a URL is suggested for banning
    pub failure_threshold: u32,

    /// HTTP statuses that count as qualifying failures
    pub ban_statuses: Vec<u16>,

    /// Count connection failures toward the threshold
    pub count_connection_failures: bool,

    /// Count timeouts toward the threshold
    pub count_timeouts: bool,

    /// Skip URLs matching suggested (unreviewed) entries too
    pub apply_suggested: bool,
}

impl Default for BansConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.wikitransp/bans.jsonl"),
            failure_threshold: 1,
            ban_statuses: vec![404, 410],
            count_connection_failures: false,
            count_timeouts: false,
            apply_suggested: false,
        }
    }
}

/// Accepted-row output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Output format ("tsv" or "jsonl")
    pub format: String,

    /// Flush after this many rows
    pub flush_every: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: "tsv".to_string(),
            flush_every: 1,
        }
    }
}

/// Run-level limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Halt dispatch after this many consecutive errored outcomes (0 disables)
    pub max_consecutive_errors: u32,

    /// Rows buffered between the input reader and the scheduler
    pub input_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 0,
            input_buffer: 256,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
