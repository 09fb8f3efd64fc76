//! One complete scan: input tables in, accepted rows out.
//!
//! The driver wires the input reader, scheduler, ban list, telemetry and
//! output writer together for a single run. The ban list is loaded at the
//! start and saved exactly once at the end, whether the run completed, was
//! cancelled, or failed part way.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::banlist::{BanEntry, BanList, BanPolicy};
use crate::config::Config;
use crate::error::{ConfigError, Result, WikitranspError};
use crate::output::{OutputFormat, OutputWriter};
use crate::source::{HttpSource, ImageSource};
use crate::telemetry::{render_stages, Stage, StageSummary, Telemetry};
use crate::types::Outcome;

use super::channel::bounded_channel;
use super::fetch::{FetchOptions, FetchWorker};
use super::input::{spawn_reader, InputOptions, InputStats, Resume};
use super::scheduler::{RunTally, Scheduler};

/// Per-run inputs that do not belong in the config file.
#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    /// WIT TSV tables, read in order
    pub inputs: Vec<PathBuf>,
    /// Accepted-row output file (stdout when unset)
    pub output: Option<PathBuf>,
    pub resume: Option<Resume>,
}

/// Everything the operator sees at the end of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub tally: RunTally,
    pub input: InputStats,
    pub stages: Vec<StageSummary>,
    /// Entries added during this run, awaiting review
    pub suggested_bans: Vec<BanEntry>,
    pub rows_written: usize,
    pub elapsed: Duration,
}

impl RunReport {
    /// Line-oriented summary, identical in shape for completed and
    /// interrupted runs.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "wikitransp summary ({:.1}s)", self.elapsed.as_secs_f64());
        out.push_str(&render_stages(&self.stages, "  "));

        let tally = &self.tally;
        let _ = writeln!(
            out,
            "dispatched={} settled={} accepted={} rejected={} errored={} written={}",
            tally.dispatched,
            tally.settled(),
            tally.accepted,
            tally.rejected.values().sum::<u64>(),
            tally.errored.values().sum::<u64>(),
            self.rows_written
        );
        for (label, counts) in [("rejected", &tally.rejected), ("errored", &tally.errored)] {
            if !counts.is_empty() {
                let parts: Vec<String> = counts.iter().map(|(k, v)| format!("{k}={v}")).collect();
                let _ = writeln!(out, "  {label}: {}", parts.join(", "));
            }
        }
        let _ = writeln!(
            out,
            "input: read={} kept={} duplicates={} malformed={}",
            self.input.read, self.input.kept, self.input.duplicates, self.input.malformed
        );

        if let Some(reason) = &tally.halted {
            let _ = writeln!(out, "Dispatch halted: {reason}");
        } else if tally.cancelled {
            let _ = writeln!(out, "Run was cancelled.");
        }
        if tally.stopped_early() {
            if let Some(url) = &tally.last_dispatched {
                let _ = writeln!(out, "You may want to resume AFTER the last URL: {url}");
            }
        }

        if !self.suggested_bans.is_empty() {
            let _ = writeln!(
                out,
                "{} URL(s) suggested for the ban list; review with `wikitransp bans list`:",
                self.suggested_bans.len()
            );
            for entry in &self.suggested_bans {
                let _ = writeln!(out, "  {}  {}", entry.reason, entry.pattern);
            }
        }
        out
    }
}

/// A configured scanner.
pub struct Scan {
    config: Config,
    source: Arc<dyn ImageSource>,
    ban_list_path: PathBuf,
}

impl Scan {
    /// Scanner fetching over HTTP.
    pub fn new(config: Config) -> Result<Self> {
        let source = HttpSource::new(
            &config.fetch.user_agent,
            Duration::from_millis(config.fetch.connect_timeout_ms),
        )?;
        Ok(Self::with_source(config, Arc::new(source)))
    }

    /// Scanner reading images from any source.
    pub fn with_source(config: Config, source: Arc<dyn ImageSource>) -> Self {
        let ban_list_path = config.ban_list_path();
        Self {
            config,
            source,
            ban_list_path,
        }
    }

    pub fn with_ban_list_path(mut self, path: PathBuf) -> Self {
        self.ban_list_path = path;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one scan. `on_outcome` sees every settled outcome (for progress).
    ///
    /// Per-candidate failures are reported in the [`RunReport`]. Only an
    /// unreadable input table, an unwritable output, or a ban list that
    /// cannot be loaded or saved fail the run.
    pub async fn run<P>(
        &self,
        options: ScanOptions,
        cancel: CancellationToken,
        mut on_outcome: P,
    ) -> Result<RunReport>
    where
        P: FnMut(&Outcome),
    {
        let started = Instant::now();
        let config = &self.config;
        let format = OutputFormat::parse(&config.output.format).ok_or_else(|| {
            ConfigError::ValidationError(format!(
                "unknown output format {:?}",
                config.output.format
            ))
        })?;

        let telemetry = Arc::new(Telemetry::new());
        let bans = Arc::new(BanList::load(&self.ban_list_path, BanPolicy::from(&config.bans))?);

        let sink: Box<dyn Write + Send> = match &options.output {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .append(options.resume.is_some())
                    .truncate(options.resume.is_none())
                    .open(path)?;
                Box::new(BufWriter::new(file))
            }
            None => Box::new(BufWriter::new(std::io::stdout())),
        };
        let mut writer = OutputWriter::new(sink, format).with_flush_every(config.output.flush_every);

        let (tx, rx) = bounded_channel(&config.limits);
        let input_options = InputOptions {
            resume: options.resume.clone(),
            ..InputOptions::from_config(config)
        };
        let reader = spawn_reader(options.inputs.clone(), input_options, tx);

        let worker = Arc::new(FetchWorker::new(
            self.source.clone(),
            telemetry.clone(),
            FetchOptions::from_config(config),
        ));
        let scheduler = Scheduler::new(
            worker,
            bans.clone(),
            telemetry.clone(),
            config.size_bounds(),
            config.scan.concurrency,
        )
        .with_max_consecutive_errors(config.limits.max_consecutive_errors);

        tracing::info!(
            inputs = options.inputs.len(),
            concurrency = config.scan.concurrency,
            sample = config.scan.sample,
            "Scan started"
        );

        let scheduled = scheduler
            .run(rx, cancel, |outcome| {
                on_outcome(outcome);
                if outcome.is_accepted() {
                    writer.write(outcome)?;
                    telemetry.increment_stage(Stage::WriteRow);
                }
                Ok::<_, std::io::Error>(())
            })
            .await;
        let flushed = writer.flush();

        let input = match reader.await {
            Ok(result) => result,
            Err(err) => Err(WikitranspError::Input {
                path: options.inputs.first().cloned().unwrap_or_default(),
                message: format!("input reader failed: {err}"),
            }),
        };

        let saved = bans.save(&self.ban_list_path);
        if saved.is_ok() {
            tracing::debug!(path = %self.ban_list_path.display(), entries = bans.len(), "Saved ban list");
        }

        let tally = scheduled?;
        let (input, failure): (InputStats, Option<WikitranspError>) = match (flushed, input, saved) {
            (Err(err), input, _) => (input.unwrap_or_default(), Some(err.into())),
            (Ok(()), Err(err), _) => (InputStats::default(), Some(err)),
            (Ok(()), Ok(input), Err(err)) => (input, Some(err)),
            (Ok(()), Ok(input), Ok(())) => (input, None),
        };

        let report = RunReport {
            tally,
            input,
            stages: telemetry.summarize(),
            suggested_bans: bans.added(),
            rows_written: writer.items_written(),
            elapsed: started.elapsed(),
        };
        if let Some(err) = failure {
            tracing::error!(settled = report.tally.settled(), error = %err, "Scan failed");
            return Err(WikitranspError::Aborted {
                source: Box::new(err),
                report: Box::new(report),
            });
        }
        tracing::info!(
            dispatched = report.tally.dispatched,
            accepted = report.tally.accepted,
            settled = report.tally.settled(),
            cancelled = report.tally.cancelled,
            new_bans = report.suggested_bans.len(),
            "Scan finished"
        );
        Ok(report)
    }
}
