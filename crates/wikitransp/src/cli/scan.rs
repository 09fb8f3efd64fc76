//! The `wikitransp scan` command.

use clap::{Args, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use wikitransp_core::{Config, Outcome, Resume, Scan, ScanOptions};

/// Supported output formats.
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    /// Original WIT fields, tab-separated
    Tsv,
    /// One JSON object per line, with the observed alpha range
    Jsonl,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Tsv => write!(f, "tsv"),
            OutputFormat::Jsonl => write!(f, "jsonl"),
        }
    }
}

/// Arguments for the `scan` command.
#[derive(Args, Debug)]
pub struct ScanArgs {
    /// WIT TSV tables to scan (plain or .gz), in order
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Output file for accepted rows (defaults to stdout)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Scan a seeded random sample of the input
    #[arg(long)]
    pub sample: bool,

    /// Fraction of rows kept when sampling
    #[arg(long)]
    pub sample_fraction: Option<f64>,

    /// Minimum length of the shorter side in pixels (0 disables)
    #[arg(long)]
    pub min_size: Option<u32>,

    /// Maximum length of the longer side in pixels (0 disables)
    #[arg(long)]
    pub max_size: Option<u32>,

    /// Maximum concurrent fetches
    #[arg(short = 'j', long)]
    pub concurrency: Option<usize>,

    /// Per-attempt deadline in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Fetch Commons thumbnails of this width instead of originals
    #[arg(long)]
    pub thumbnail_width: Option<u32>,

    /// Ban list file
    #[arg(long)]
    pub ban_list: Option<PathBuf>,

    /// Resume at this image URL (inclusive); output is appended
    #[arg(long, conflicts_with = "resume_after")]
    pub resume_at: Option<String>,

    /// Resume after this image URL; output is appended
    #[arg(long)]
    pub resume_after: Option<String>,

    /// Disable the progress display
    #[arg(long)]
    pub no_progress: bool,
}

impl ScanArgs {
    /// Apply command-line overrides on top of the loaded config.
    fn apply(&self, config: &mut Config) {
        if self.sample {
            config.scan.sample = true;
        }
        if let Some(fraction) = self.sample_fraction {
            config.scan.sample_fraction = fraction;
        }
        if let Some(min) = self.min_size {
            config.scan.min_size = min;
        }
        if let Some(max) = self.max_size {
            config.scan.max_size = max;
        }
        if let Some(concurrency) = self.concurrency {
            config.scan.concurrency = concurrency;
        }
        if let Some(timeout) = self.timeout_ms {
            config.fetch.timeout_ms = timeout;
        }
        if let Some(width) = self.thumbnail_width {
            config.scan.thumbnail_width = width;
        }
        if let Some(format) = self.format {
            config.output.format = format.to_string();
        }
        if let Some(path) = &self.ban_list {
            config.bans.path = path.clone();
        }
    }

    fn resume(&self) -> Option<Resume> {
        match (&self.resume_at, &self.resume_after) {
            (Some(url), _) => Some(Resume::At(url.clone())),
            (None, Some(url)) => Some(Resume::After(url.clone())),
            (None, None) => None,
        }
    }
}

/// Execute the scan command.
pub async fn execute(args: ScanArgs, mut config: Config) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate()?;

    for input in &args.inputs {
        if !input.exists() {
            anyhow::bail!("Input table not found: {}", input.display());
        }
    }

    let scan = Scan::new(config)?;
    let options = ScanOptions {
        inputs: args.inputs.clone(),
        output: args.output.clone(),
        resume: args.resume(),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, letting in-flight fetches settle");
            on_signal.cancel();
        }
    });

    let progress = create_progress(args.no_progress);
    let mut accepted = 0u64;
    let result = scan
        .run(options, cancel, |outcome: &Outcome| {
            progress.inc(1);
            if outcome.is_accepted() {
                accepted += 1;
                progress.set_message(format!("{accepted} accepted"));
            }
        })
        .await;
    progress.finish_and_clear();

    match result {
        Ok(report) => {
            eprint!("{}", report.render());
            Ok(())
        }
        Err(err) => {
            if let Some(report) = err.partial_report() {
                eprint!("{}", report.render());
            }
            Err(err.into())
        }
    }
}

/// Create a spinner counting settled candidates (the input length is unknown).
fn create_progress(hidden: bool) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if hidden {
        pb.set_draw_target(ProgressDrawTarget::hidden());
        return pb;
    }
    if let Ok(style) = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {pos} settled ({per_sec}) {msg}")
    {
        pb.set_style(style);
    }
    pb.enable_steady_tick(std::time::Duration::from_millis(120));
    pb.set_message("starting...");
    pb
}
