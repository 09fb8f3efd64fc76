//! Process-wide stage counters and timing aggregates.
//!
//! Every component reports into a shared [`Telemetry`] handle. Stages are
//! created on first use and reported in first-touched order. Aggregation is
//! commutative: count, min and max are exact regardless of arrival order, and
//! the mean is maintained incrementally (Welford) rather than as sum / count.

use dashmap::DashMap;
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Named points in the fetch/classify pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// A fetch worker picked up a candidate
    CheckPng,
    /// Stream opened and signature verified
    PngStream,
    /// Verdict reached, timed from the first chunk event
    PopulateChunks,
    /// Verdict: semi-transparent
    ConfAlpha,
    /// Verdict: binary alpha only
    ConfAlphaNeg,
    /// Verdict: no alpha channel
    DirectAlphaNeg,
    WrongSize,
    NotPng,
    Timeout,
    ConnectionFailure,
    HttpStatus,
    DecodeError,
    BanListedSkip,
    Internal,
    /// A fetch attempt was repeated
    Retry,
    /// A chunk checksum did not match
    CrcMismatch,
    /// An accepted row was written to the output
    WriteRow,
    /// A URL crossed the ban threshold
    BanUrl,
}

impl Stage {
    /// Stages that settle a candidate. Exactly one is recorded per outcome.
    pub const TERMINAL: [Stage; 11] = [
        Stage::ConfAlpha,
        Stage::ConfAlphaNeg,
        Stage::DirectAlphaNeg,
        Stage::WrongSize,
        Stage::NotPng,
        Stage::Timeout,
        Stage::ConnectionFailure,
        Stage::HttpStatus,
        Stage::DecodeError,
        Stage::BanListedSkip,
        Stage::Internal,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::CheckPng => "CheckPng",
            Self::PngStream => "PngStream",
            Self::PopulateChunks => "PopulateChunks",
            Self::ConfAlpha => "ConfAlpha",
            Self::ConfAlphaNeg => "ConfAlphaNeg",
            Self::DirectAlphaNeg => "DirectAlphaNeg",
            Self::WrongSize => "WrongSize",
            Self::NotPng => "NotPng",
            Self::Timeout => "Timeout",
            Self::ConnectionFailure => "ConnectionFailure",
            Self::HttpStatus => "HttpStatus",
            Self::DecodeError => "DecodeError",
            Self::BanListedSkip => "BanListedSkip",
            Self::Internal => "Internal",
            Self::Retry => "Retry",
            Self::CrcMismatch => "CrcMismatch",
            Self::WriteRow => "WriteRow",
            Self::BanUrl => "BanURL",
        }
    }

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct StageStats {
    order: u64,
    count: u64,
    timed: u64,
    mean_secs: f64,
    min: Duration,
    max: Duration,
}

impl StageStats {
    fn new(order: u64) -> Self {
        Self {
            order,
            count: 0,
            timed: 0,
            mean_secs: 0.0,
            min: Duration::MAX,
            max: Duration::ZERO,
        }
    }

    fn add_timing(&mut self, duration: Duration) {
        self.timed += 1;
        let x = duration.as_secs_f64();
        self.mean_secs += (x - self.mean_secs) / self.timed as f64;
        self.min = self.min.min(duration);
        self.max = self.max.max(duration);
    }
}

/// Aggregate for one stage, as reported in the run summary.
#[derive(Debug, Clone, PartialEq)]
pub struct StageSummary {
    pub name: String,
    /// Events recorded, timed or not
    pub count: u64,
    /// Mean duration in seconds over timed events
    pub mean_secs: Option<f64>,
    pub min: Option<Duration>,
    pub max: Option<Duration>,
}

/// Concurrent stage aggregator.
///
/// Writers only contend on the shard holding their stage; there is no global
/// lock on either the write or the read path.
#[derive(Debug, Default)]
pub struct Telemetry {
    stages: DashMap<String, StageStats>,
    next_order: AtomicU64,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one timed event for `stage`.
    pub fn record(&self, stage: &str, duration: Duration) {
        self.update(stage, |stats| {
            stats.count += 1;
            stats.add_timing(duration);
        });
    }

    /// Record one untimed event for `stage`.
    pub fn increment(&self, stage: &str) {
        self.update(stage, |stats| stats.count += 1);
    }

    pub fn record_stage(&self, stage: Stage, duration: Duration) {
        self.record(stage.name(), duration);
    }

    pub fn increment_stage(&self, stage: Stage) {
        self.increment(stage.name());
    }

    fn update(&self, stage: &str, f: impl FnOnce(&mut StageStats)) {
        if let Some(mut stats) = self.stages.get_mut(stage) {
            f(&mut *stats);
            return;
        }
        let mut stats = self
            .stages
            .entry(stage.to_string())
            .or_insert_with(|| StageStats::new(self.next_order.fetch_add(1, Ordering::Relaxed)));
        f(&mut *stats);
    }

    /// Number of events recorded for `stage` so far.
    pub fn count(&self, stage: &str) -> u64 {
        self.stages.get(stage).map(|s| s.count).unwrap_or(0)
    }

    /// Sum of counts over the terminal stages.
    pub fn terminal_total(&self) -> u64 {
        Stage::TERMINAL.iter().map(|s| self.count(s.name())).sum()
    }

    /// Per-stage aggregates in first-touched order.
    pub fn summarize(&self) -> Vec<StageSummary> {
        let mut entries: Vec<(String, StageStats)> = self
            .stages
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by_key(|(_, stats)| stats.order);
        entries
            .into_iter()
            .map(|(name, stats)| {
                let timed = stats.timed > 0;
                StageSummary {
                    name,
                    count: stats.count,
                    mean_secs: timed.then_some(stats.mean_secs),
                    min: timed.then_some(stats.min),
                    max: timed.then_some(stats.max),
                }
            })
            .collect()
    }
}

/// One aligned line per stage, each prefixed with `indent`.
pub fn render_stages(stages: &[StageSummary], indent: &str) -> String {
    let name_width = stages.iter().map(|s| s.name.len()).max().unwrap_or(0);
    let count_width = stages
        .iter()
        .map(|s| s.count.to_string().len())
        .max()
        .unwrap_or(1);

    let mut out = String::new();
    for s in stages {
        let _ = write!(
            out,
            "{indent}{:<name_width$} : n={:<count_width$}",
            s.name, s.count
        );
        if let (Some(mean), Some(min), Some(max)) = (s.mean_secs, s.min, s.max) {
            let _ = write!(
                out,
                ", μ={:.4}, min={:.4}, max={:.4}",
                mean,
                min.as_secs_f64(),
                max.as_secs_f64()
            );
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_stages_created_on_first_use_in_order() {
        let telemetry = Telemetry::new();
        telemetry.increment("CheckPng");
        telemetry.record("PngStream", ms(5));
        telemetry.increment("CheckPng");
        telemetry.record("ConfAlpha", ms(9));

        let names: Vec<String> = telemetry.summarize().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["CheckPng", "PngStream", "ConfAlpha"]);
        assert_eq!(telemetry.count("CheckPng"), 2);
        assert_eq!(telemetry.count("Missing"), 0);
    }

    #[test]
    fn test_mean_min_max() {
        let telemetry = Telemetry::new();
        for v in [10, 20, 30, 40] {
            telemetry.record("PngStream", ms(v));
        }
        telemetry.increment("PngStream");

        let summary = &telemetry.summarize()[0];
        assert_eq!(summary.count, 5);
        assert!((summary.mean_secs.unwrap() - 0.025).abs() < 1e-12);
        assert_eq!(summary.min, Some(ms(10)));
        assert_eq!(summary.max, Some(ms(40)));
    }

    #[test]
    fn test_untimed_stage_has_no_timing() {
        let telemetry = Telemetry::new();
        telemetry.increment_stage(Stage::Retry);
        let summary = &telemetry.summarize()[0];
        assert_eq!(summary.name, "Retry");
        assert_eq!(summary.mean_secs, None);
        assert_eq!(render_stages(&telemetry.summarize(), ""), "Retry : n=1\n");
    }

    #[test]
    fn test_render_stages_aligns_columns() {
        let telemetry = Telemetry::new();
        for _ in 0..12 {
            telemetry.record_stage(Stage::CheckPng, ms(20));
        }
        telemetry.increment_stage(Stage::BanUrl);
        let rendered = render_stages(&telemetry.summarize(), "  ");
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(
            lines[0],
            "  CheckPng : n=12, μ=0.0200, min=0.0200, max=0.0200"
        );
        assert_eq!(lines[1], "  BanURL   : n=1 ");
    }

    #[test]
    fn test_aggregation_is_order_independent() {
        let events: Vec<(&str, Duration)> = (1..=200u64)
            .map(|i| {
                let stage = if i % 3 == 0 { "ConfAlpha" } else { "PngStream" };
                (stage, Duration::from_micros(i * 137 % 9973 + 1))
            })
            .collect();

        let forward = Telemetry::new();
        for (stage, d) in &events {
            forward.record(stage, *d);
        }

        let mut shuffled = events.clone();
        shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));
        let reordered = Telemetry::new();
        for (stage, d) in &shuffled {
            reordered.record(stage, *d);
        }

        for name in ["ConfAlpha", "PngStream"] {
            let a = forward.summarize().into_iter().find(|s| s.name == name).unwrap();
            let b = reordered.summarize().into_iter().find(|s| s.name == name).unwrap();
            assert_eq!(a.count, b.count);
            assert_eq!(a.min, b.min);
            assert_eq!(a.max, b.max);
            assert!((a.mean_secs.unwrap() - b.mean_secs.unwrap()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_concurrent_writers() {
        let telemetry = Arc::new(Telemetry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let telemetry = telemetry.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        telemetry.record_stage(Stage::PngStream, Duration::from_micros(i));
                        telemetry.increment_stage(Stage::CheckPng);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(telemetry.count("PngStream"), 8000);
        assert_eq!(telemetry.count("CheckPng"), 8000);
        let summary = telemetry
            .summarize()
            .into_iter()
            .find(|s| s.name == "PngStream")
            .unwrap();
        assert_eq!(summary.min, Some(Duration::ZERO));
        assert_eq!(summary.max, Some(Duration::from_micros(999)));
    }

    #[test]
    fn test_terminal_total_ignores_transitions() {
        let telemetry = Telemetry::new();
        telemetry.increment_stage(Stage::CheckPng);
        telemetry.record_stage(Stage::ConfAlpha, ms(1));
        telemetry.increment_stage(Stage::WrongSize);
        telemetry.increment_stage(Stage::WriteRow);
        assert_eq!(telemetry.terminal_total(), 2);
    }
}
