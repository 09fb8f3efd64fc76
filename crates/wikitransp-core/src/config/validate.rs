//! Configuration validation with range checks.

use crate::error::ConfigError;

use super::Config;

fn invalid(message: &str) -> ConfigError {
    ConfigError::ValidationError(message.to_string())
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan.concurrency == 0 {
            return Err(invalid("scan.concurrency must be > 0"));
        }
        if !(self.scan.sample_fraction > 0.0 && self.scan.sample_fraction <= 1.0) {
            return Err(invalid("scan.sample_fraction must be in (0.0, 1.0]"));
        }
        if self.scan.max_size > 0 && self.scan.max_size < self.scan.min_size {
            return Err(invalid("scan.max_size must be 0 or >= scan.min_size"));
        }
        if self.scan.mime_type.is_empty() {
            return Err(invalid("scan.mime_type must not be empty"));
        }
        if self.fetch.timeout_ms == 0 {
            return Err(invalid("fetch.timeout_ms must be > 0"));
        }
        if self.fetch.connect_timeout_ms == 0 {
            return Err(invalid("fetch.connect_timeout_ms must be > 0"));
        }
        if self.fetch.timeout_backoff_factor == 0 {
            return Err(invalid("fetch.timeout_backoff_factor must be > 0"));
        }
        if self.classifier.max_image_data_bytes == 0 {
            return Err(invalid("classifier.max_image_data_bytes must be > 0"));
        }
        if self.classifier.max_row_bytes == 0 {
            return Err(invalid("classifier.max_row_bytes must be > 0"));
        }
        if self.classifier.max_slice_bytes == 0 {
            return Err(invalid("classifier.max_slice_bytes must be > 0"));
        }
        if self.bans.failure_threshold == 0 {
            return Err(invalid("bans.failure_threshold must be > 0"));
        }
        if !matches!(self.output.format.as_str(), "tsv" | "jsonl") {
            return Err(invalid("output.format must be \"tsv\" or \"jsonl\""));
        }
        if self.output.flush_every == 0 {
            return Err(invalid("output.flush_every must be > 0"));
        }
        if self.limits.input_buffer == 0 {
            return Err(invalid("limits.input_buffer must be > 0"));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(invalid("logging.format must be \"pretty\" or \"json\""));
        }
        Ok(())
    }
}
