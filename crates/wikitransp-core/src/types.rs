//! Core data types for the scanning pipeline.
//!
//! A [`CandidateRow`] enters the pipeline, a fetch worker turns it into exactly
//! one [`Outcome`], and the scheduler consumes that outcome for bookkeeping.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::png::AlphaRange;
use crate::telemetry::Stage;

/// One dataset entry considered for fetching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateRow {
    /// Source image URL as listed in the dataset
    pub url: String,

    /// Declared image width in pixels
    pub width: u32,

    /// Declared image height in pixels
    pub height: u32,

    /// Declared MIME type ("image/png")
    pub mime: String,

    /// Every field of the input row, passed through to the output
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl CandidateRow {
    /// Create a row without passthrough fields.
    pub fn new(url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            url: url.into(),
            width,
            height,
            mime: "image/png".to_string(),
            fields: Vec::new(),
        }
    }
}

/// Why a candidate was classified out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Declared dimensions outside the accepted range
    WrongSize,
    /// The image cannot carry alpha (or carries no alpha samples)
    NoAlphaChannel,
    /// Alpha only ever takes the values 0 and max
    BinaryAlphaOnly,
    /// The body does not start with the PNG signature
    NotPng,
}

impl RejectReason {
    /// Kebab-case name used in reports.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WrongSize => "wrong-size",
            Self::NoAlphaChannel => "no-alpha-channel",
            Self::BinaryAlphaOnly => "binary-alpha-only",
            Self::NotPng => "not-png",
        }
    }
}

/// Why a fetch failed to reach a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Deadline exceeded before a verdict
    Timeout,
    /// Network failure opening or reading the stream
    ConnectionFailure,
    /// Server answered outside the 2xx range
    HttpStatus(u16),
    /// Truncated or inconsistent PNG framing / image data
    DecodeError,
    /// URL matched an active ban entry; nothing was fetched
    BanListedSkip,
    /// The worker task panicked
    Internal,
}

impl ErrorKind {
    /// Kebab-case name used in reports (status codes are not included).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ConnectionFailure => "connection-failure",
            Self::HttpStatus(_) => "http-status",
            Self::DecodeError => "decode-error",
            Self::BanListedSkip => "ban-listed-skip",
            Self::Internal => "internal",
        }
    }
}

/// Terminal classification of one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutcomeKind {
    /// Semi-transparent: at least one alpha sample strictly inside (0, max)
    Accepted,
    Rejected(RejectReason),
    Errored(ErrorKind),
}

impl OutcomeKind {
    /// The stage under which this outcome is counted in the run summary.
    ///
    /// Every outcome maps to exactly one terminal stage, so the terminal stage
    /// counts always sum to the number of settled candidates.
    pub fn stage(self) -> Stage {
        match self {
            Self::Accepted => Stage::ConfAlpha,
            Self::Rejected(RejectReason::BinaryAlphaOnly) => Stage::ConfAlphaNeg,
            Self::Rejected(RejectReason::NoAlphaChannel) => Stage::DirectAlphaNeg,
            Self::Rejected(RejectReason::WrongSize) => Stage::WrongSize,
            Self::Rejected(RejectReason::NotPng) => Stage::NotPng,
            Self::Errored(ErrorKind::Timeout) => Stage::Timeout,
            Self::Errored(ErrorKind::ConnectionFailure) => Stage::ConnectionFailure,
            Self::Errored(ErrorKind::HttpStatus(_)) => Stage::HttpStatus,
            Self::Errored(ErrorKind::DecodeError) => Stage::DecodeError,
            Self::Errored(ErrorKind::BanListedSkip) => Stage::BanListedSkip,
            Self::Errored(ErrorKind::Internal) => Stage::Internal,
        }
    }
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected(reason) => write!(f, "rejected({})", reason.as_str()),
            Self::Errored(ErrorKind::HttpStatus(code)) => write!(f, "errored(http-status {code})"),
            Self::Errored(kind) => write!(f, "errored({})", kind.as_str()),
        }
    }
}

/// Terminal result of one fetch. Constructed once, consumed once.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// The candidate this outcome settles
    pub row: CandidateRow,

    /// Verdict or failure class
    pub kind: OutcomeKind,

    /// Alpha samples observed before the verdict (direct-alpha images only)
    pub alpha: Option<AlphaRange>,

    /// Wall time from dispatch to settlement
    pub elapsed: Duration,

    /// Fetch attempts made (0 for short-circuited candidates)
    pub attempts: u32,

    /// Human-readable failure detail, if any
    pub detail: Option<String>,
}

impl Outcome {
    /// An outcome reached without any network I/O.
    pub fn short_circuit(row: CandidateRow, kind: OutcomeKind) -> Self {
        Self {
            row,
            kind,
            alpha: None,
            elapsed: Duration::ZERO,
            attempts: 0,
            detail: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.kind == OutcomeKind::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_row_serde_skips_empty_fields() {
        let row = CandidateRow::new("https://example.org/a.png", 1200, 900);
        let json = serde_json::to_string(&row).unwrap();
        assert!(!json.contains("fields"));
        let parsed: CandidateRow = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, row);
    }

    #[test]
    fn test_every_outcome_kind_has_a_distinct_terminal_stage() {
        let kinds = [
            OutcomeKind::Accepted,
            OutcomeKind::Rejected(RejectReason::WrongSize),
            OutcomeKind::Rejected(RejectReason::NoAlphaChannel),
            OutcomeKind::Rejected(RejectReason::BinaryAlphaOnly),
            OutcomeKind::Rejected(RejectReason::NotPng),
            OutcomeKind::Errored(ErrorKind::Timeout),
            OutcomeKind::Errored(ErrorKind::ConnectionFailure),
            OutcomeKind::Errored(ErrorKind::HttpStatus(404)),
            OutcomeKind::Errored(ErrorKind::DecodeError),
            OutcomeKind::Errored(ErrorKind::BanListedSkip),
            OutcomeKind::Errored(ErrorKind::Internal),
        ];
        let mut stages: Vec<&str> = kinds.iter().map(|k| k.stage().name()).collect();
        stages.sort_unstable();
        stages.dedup();
        assert_eq!(stages.len(), kinds.len());
        assert!(kinds.iter().all(|k| k.stage().is_terminal()));
    }

    #[test]
    fn test_outcome_kind_display() {
        assert_eq!(OutcomeKind::Accepted.to_string(), "accepted");
        assert_eq!(
            OutcomeKind::Rejected(RejectReason::BinaryAlphaOnly).to_string(),
            "rejected(binary-alpha-only)"
        );
        assert_eq!(
            OutcomeKind::Errored(ErrorKind::HttpStatus(404)).to_string(),
            "errored(http-status 404)"
        );
    }
}
