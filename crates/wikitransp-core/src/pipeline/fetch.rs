//! Fetch worker: one candidate in, one [`Outcome`] out.
//!
//! Each attempt opens a stream, frames it with a [`ChunkReader`], and feeds
//! every event to a fresh [`TransparencyClassifier`] until a verdict is known.
//! The attempt runs under a deadline; when the deadline fires the attempt
//! future is dropped, which drops the reader and releases the connection.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{ChunkError, ClassifyError, SourceError};
use crate::png::{AlphaRange, ChunkEvent, ChunkReader, ClassifierLimits, TransparencyClassifier, Verdict};
use crate::source::ImageSource;
use crate::telemetry::{Stage, Telemetry};
use crate::types::{CandidateRow, ErrorKind, Outcome, OutcomeKind, RejectReason};

use super::retry::{RetryBudget, RetryPolicy};
use super::thumbnail;

/// Per-fetch settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub verify_crc: bool,
    pub max_slice_bytes: usize,
    pub limits: ClassifierLimits,
    pub retry: RetryPolicy,
    /// Fetch Commons thumbnails this wide instead of originals (0 disables)
    pub thumbnail_width: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl FetchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            verify_crc: config.classifier.verify_crc,
            max_slice_bytes: config.classifier.max_slice_bytes,
            limits: config.classifier_limits(),
            retry: RetryPolicy::from(&config.fetch),
            thumbnail_width: config.scan.thumbnail_width,
        }
    }
}

/// A failed attempt, already mapped onto the outcome it would settle as.
#[derive(Debug)]
struct Failure {
    kind: OutcomeKind,
    detail: String,
}

impl Failure {
    fn errored(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Errored(kind),
            detail: detail.into(),
        }
    }
}

impl From<SourceError> for Failure {
    fn from(err: SourceError) -> Self {
        let kind = match err {
            SourceError::Status(code) => ErrorKind::HttpStatus(code),
            SourceError::Connection(_) => ErrorKind::ConnectionFailure,
            SourceError::Timeout => ErrorKind::Timeout,
        };
        Self::errored(kind, err.to_string())
    }
}

impl From<ChunkError> for Failure {
    fn from(err: ChunkError) -> Self {
        match err {
            ChunkError::NotPng => Self {
                kind: OutcomeKind::Rejected(RejectReason::NotPng),
                detail: err.to_string(),
            },
            ChunkError::Source(source) => source.into(),
            ChunkError::Truncated { .. } | ChunkError::Malformed { .. } => {
                Self::errored(ErrorKind::DecodeError, err.to_string())
            }
        }
    }
}

impl From<ClassifyError> for Failure {
    fn from(err: ClassifyError) -> Self {
        Self::errored(ErrorKind::DecodeError, err.to_string())
    }
}

#[derive(Debug)]
struct Classified {
    verdict: Verdict,
    alpha: Option<AlphaRange>,
}

/// Turns candidates into outcomes. Cheap to share behind an `Arc`.
pub struct FetchWorker {
    source: Arc<dyn ImageSource>,
    telemetry: Arc<Telemetry>,
    options: FetchOptions,
}

impl FetchWorker {
    pub fn new(source: Arc<dyn ImageSource>, telemetry: Arc<Telemetry>, options: FetchOptions) -> Self {
        Self {
            source,
            telemetry,
            options,
        }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// Fetch and classify `row`, retrying as the policy allows.
    ///
    /// Never fails: every error is folded into the returned outcome.
    pub async fn fetch(&self, row: CandidateRow) -> Outcome {
        let started = Instant::now();
        self.telemetry.increment_stage(Stage::CheckPng);

        let url = thumbnail::fetch_url(&row.url, row.width, self.options.thumbnail_width);
        let retry = &self.options.retry;
        let mut used = RetryBudget::default();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let deadline = retry.deadline(&used);
            let result = match tokio::time::timeout(deadline, self.attempt(&url)).await {
                Ok(result) => result,
                Err(_) => Err(Failure::errored(
                    ErrorKind::Timeout,
                    format!("no verdict within {} ms", deadline.as_millis()),
                )),
            };

            let failure = match result {
                Ok(classified) => {
                    tracing::debug!(url = %row.url, verdict = ?classified.verdict, attempts, "Classified");
                    return Outcome {
                        row,
                        kind: classified.verdict.outcome(),
                        alpha: classified.alpha,
                        elapsed: started.elapsed(),
                        attempts,
                        detail: None,
                    };
                }
                Err(failure) => failure,
            };

            if let OutcomeKind::Errored(kind) = failure.kind {
                if retry.try_consume(kind, &mut used) {
                    self.telemetry.increment_stage(Stage::Retry);
                    tracing::debug!(url = %row.url, attempt = attempts, error = %failure.detail, "Retrying");
                    let delay = retry.delay(used.total());
                    if delay > Duration::ZERO {
                        tokio::time::sleep(delay).await;
                    }
                    continue;
                }
            }

            tracing::debug!(url = %row.url, outcome = %failure.kind, detail = %failure.detail, "Fetch settled without verdict");
            return Outcome {
                row,
                kind: failure.kind,
                alpha: None,
                elapsed: started.elapsed(),
                attempts,
                detail: Some(failure.detail),
            };
        }
    }

    async fn attempt(&self, url: &str) -> Result<Classified, Failure> {
        let opened = Instant::now();
        let stream = self.source.open(url).await?;
        let mut reader = ChunkReader::new(stream, self.options.verify_crc, self.options.max_slice_bytes);
        let mut classifier = TransparencyClassifier::new(self.options.limits);
        let mut first_event: Option<Instant> = None;

        let result = loop {
            let event = match reader.next_event().await {
                Ok(event) => event,
                Err(err) => break Err(Failure::from(err)),
            };
            if first_event.is_none() {
                self.telemetry.record_stage(Stage::PngStream, opened.elapsed());
                first_event = Some(Instant::now());
            }
            let at_end = matches!(event, ChunkEvent::End);
            match classifier.observe(&event) {
                Ok(Some(verdict)) => break Ok(verdict),
                Ok(None) if at_end => {
                    break Err(Failure::errored(ErrorKind::DecodeError, "stream ended without a verdict"))
                }
                Ok(None) => {}
                Err(err) => break Err(Failure::from(err)),
            }
        };

        for _ in 0..reader.crc_mismatches() {
            self.telemetry.increment_stage(Stage::CrcMismatch);
        }
        let received = reader.abandon();

        let verdict = result?;
        if let Some(first) = first_event {
            self.telemetry.record_stage(Stage::PopulateChunks, first.elapsed());
        }
        tracing::trace!(
            url,
            received,
            image_data_bytes = classifier.state().image_data_bytes,
            rows = classifier.rows_decoded(),
            "Verdict reached"
        );

        let alpha = classifier
            .header()
            .filter(|header| header.color_type.has_alpha_channel())
            .map(|_| classifier.state().alpha);
        Ok(Classified { verdict, alpha })
    }
}
