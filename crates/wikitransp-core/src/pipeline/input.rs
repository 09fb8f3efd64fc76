//! WIT TSV input.
//!
//! Rows are read on a blocking thread and sent to the scheduler through a
//! bounded channel. When the scheduler stops early it drops the receiver and
//! the reader stops at its next send.

use flate2::read::MultiGzDecoder;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Result, WikitranspError};
use crate::types::CandidateRow;

/// WIT column holding the image URL.
pub const URL_COLUMN: usize = 2;
pub const MIME_COLUMN: usize = 9;
pub const HEIGHT_COLUMN: usize = 10;
pub const WIDTH_COLUMN: usize = 11;

/// Where to pick up an interrupted scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resume {
    /// Start with the row carrying this URL
    At(String),
    /// Start with the row after the one carrying this URL
    After(String),
}

impl Resume {
    fn url(&self) -> &str {
        match self {
            Self::At(url) | Self::After(url) => url,
        }
    }
}

/// Keep each row with probability `fraction`, reproducibly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub fraction: f64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputOptions {
    pub mime_type: String,
    pub sample: Option<Sample>,
    pub resume: Option<Resume>,
}

impl Default for InputOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl InputOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mime_type: config.scan.mime_type.clone(),
            sample: config.scan.sample.then_some(Sample {
                fraction: config.scan.sample_fraction,
                seed: config.scan.sample_seed,
            }),
            resume: None,
        }
    }
}

/// Row counts from one pass over the input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputStats {
    /// Data lines read (headers and blank lines excluded)
    pub read: u64,
    /// Rows sent on for scheduling
    pub kept: u64,
    /// Rows with too few fields or unparseable dimensions
    pub malformed: u64,
    /// Repeats of an image URL already seen
    pub duplicates: u64,
}

/// Line-by-line selection of candidate rows.
pub struct RowFilter {
    options: InputOptions,
    rng: Option<StdRng>,
    seen: HashSet<String>,
    resumed: bool,
    stats: InputStats,
}

impl RowFilter {
    pub fn new(options: InputOptions) -> Self {
        let rng = options.sample.map(|s| StdRng::seed_from_u64(s.seed));
        let resumed = options.resume.is_none();
        Self {
            options,
            rng,
            seen: HashSet::new(),
            resumed,
            stats: InputStats::default(),
        }
    }

    pub fn stats(&self) -> InputStats {
        self.stats
    }

    /// Whether the resume point has been passed (always true without one).
    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// The candidate for one TSV line, if it is selected.
    pub fn accept(&mut self, line: &str) -> Option<CandidateRow> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() || line.starts_with("language\t") {
            return None;
        }
        self.stats.read += 1;

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() <= WIDTH_COLUMN {
            self.stats.malformed += 1;
            tracing::warn!(fields = fields.len(), "Skipping short input row");
            return None;
        }
        if fields[MIME_COLUMN] != self.options.mime_type {
            return None;
        }

        let url = fields[URL_COLUMN];
        if !self.resumed {
            let resume = self.options.resume.as_ref()?;
            if url != resume.url() {
                return None;
            }
            self.resumed = true;
            tracing::info!(url, "Reached resume point");
            if matches!(resume, Resume::After(_)) {
                return None;
            }
        }

        if !self.seen.insert(url.to_string()) {
            self.stats.duplicates += 1;
            return None;
        }

        let (Some(width), Some(height)) = (
            parse_dimension(fields[WIDTH_COLUMN]),
            parse_dimension(fields[HEIGHT_COLUMN]),
        ) else {
            self.stats.malformed += 1;
            tracing::warn!(url, "Skipping row with unparseable dimensions");
            return None;
        };

        if let (Some(rng), Some(sample)) = (self.rng.as_mut(), self.options.sample) {
            if !rng.gen_bool(sample.fraction.clamp(0.0, 1.0)) {
                return None;
            }
        }

        self.stats.kept += 1;
        Some(CandidateRow {
            url: url.to_string(),
            width,
            height,
            mime: fields[MIME_COLUMN].to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        })
    }
}

/// Dimensions are integers, occasionally written with a trailing ".0".
fn parse_dimension(field: &str) -> Option<u32> {
    let field = field.trim();
    field
        .parse::<u32>()
        .ok()
        .or_else(|| field.strip_suffix(".0").and_then(|f| f.parse().ok()))
}

/// Open a TSV table, transparently decompressing `.gz` files.
pub fn open_table(path: &Path) -> std::io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

fn input_error(path: &Path, err: std::io::Error) -> WikitranspError {
    WikitranspError::Input {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Read every table in order, sending selected rows to `tx`.
///
/// An unreadable table fails the whole read. Invalid UTF-8 is replaced
/// rather than rejected.
pub fn read_tables(paths: &[PathBuf], options: InputOptions, tx: &mpsc::Sender<CandidateRow>) -> Result<InputStats> {
    let mut filter = RowFilter::new(options);
    let mut line = Vec::new();

    for path in paths {
        tracing::info!(path = %path.display(), "Reading input table");
        let mut reader = open_table(path).map_err(|e| input_error(path, e))?;
        loop {
            line.clear();
            let n = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| input_error(path, e))?;
            if n == 0 {
                break;
            }
            let text = String::from_utf8_lossy(&line);
            if let Some(row) = filter.accept(&text) {
                if tx.blocking_send(row).is_err() {
                    tracing::debug!("Scheduler stopped reading input");
                    return Ok(filter.stats());
                }
            }
        }
    }

    if !filter.resumed() {
        tracing::warn!("Resume point was never reached; no rows were scheduled");
    }
    Ok(filter.stats())
}

/// Spawn [`read_tables`] on the blocking pool.
pub fn spawn_reader(
    paths: Vec<PathBuf>,
    options: InputOptions,
    tx: mpsc::Sender<CandidateRow>,
) -> JoinHandle<Result<InputStats>> {
    tokio::task::spawn_blocking(move || read_tables(&paths, options, &tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tempfile::TempDir;

    const HEADER: &str = "language\tpage_url\timage_url\tpage_title\tsection_title\thierarchical_section_title\tcaption_reference_description\tcaption_attribution_description\tcaption_alt_text_description\tmime_type\toriginal_height\toriginal_width\tis_main_image";

    fn row(url: &str, mime: &str, width: &str, height: &str) -> String {
        format!("en\thttps://en.wikipedia.org/wiki/X\t{url}\tX\t\t\t\t\t\t{mime}\t{height}\t{width}\tfalse")
    }

    fn url(i: usize) -> String {
        format!("https://upload.wikimedia.org/wikipedia/commons/a/ab/{i}.png")
    }

    #[test]
    fn test_parses_wit_columns() {
        let mut filter = RowFilter::new(InputOptions::default());
        assert!(filter.accept(HEADER).is_none());

        let row = filter.accept(&row(&url(1), "image/png", "1200", "800")).unwrap();
        assert_eq!(row.url, url(1));
        assert_eq!(row.width, 1200);
        assert_eq!(row.height, 800);
        assert_eq!(row.mime, "image/png");
        assert_eq!(row.fields.len(), 13);
        assert_eq!(filter.stats().read, 1);
    }

    #[test]
    fn test_filters_mime_duplicates_and_malformed() {
        let mut filter = RowFilter::new(InputOptions::default());
        assert!(filter.accept(&row(&url(1), "image/jpeg", "10", "10")).is_none());
        assert!(filter.accept(&row(&url(2), "image/png", "10", "10")).is_some());
        assert!(filter.accept(&row(&url(2), "image/png", "10", "10")).is_none());
        assert!(filter.accept(&row(&url(3), "image/png", "wide", "10")).is_none());
        assert!(filter.accept("en\tonly\tthree").is_none());
        assert!(filter.accept(&row(&url(4), "image/png", "640.0", "480")).is_some());

        let stats = filter.stats();
        assert_eq!(stats.read, 6);
        assert_eq!(stats.kept, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.malformed, 2);
    }

    #[test]
    fn test_resume_at_and_after() {
        let lines: Vec<String> = (0..5).map(|i| row(&url(i), "image/png", "9", "9")).collect();

        let run = |resume: Resume| {
            let mut filter = RowFilter::new(InputOptions {
                resume: Some(resume),
                ..InputOptions::default()
            });
            lines
                .iter()
                .filter_map(|l| filter.accept(l))
                .map(|r| r.url)
                .collect::<Vec<_>>()
        };

        assert_eq!(run(Resume::At(url(2))), vec![url(2), url(3), url(4)]);
        assert_eq!(run(Resume::After(url(2))), vec![url(3), url(4)]);
        assert!(run(Resume::At(url(9))).is_empty());
    }

    #[test]
    fn test_sampling_is_reproducible() {
        let lines: Vec<String> = (0..2000).map(|i| row(&url(i), "image/png", "9", "9")).collect();
        let sampled = |seed| {
            let mut filter = RowFilter::new(InputOptions {
                sample: Some(Sample { fraction: 0.1, seed }),
                ..InputOptions::default()
            });
            lines
                .iter()
                .filter_map(|l| filter.accept(l))
                .map(|r| r.url)
                .collect::<Vec<_>>()
        };

        let first = sampled(42);
        assert_eq!(first, sampled(42));
        assert_ne!(first, sampled(43));
        assert!((100..300).contains(&first.len()), "kept {}", first.len());
    }

    #[tokio::test]
    async fn test_reads_plain_and_gzip_tables() {
        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("part-1.tsv");
        std::fs::write(
            &plain,
            format!("{HEADER}\n{}\n{}\n", row(&url(0), "image/png", "5", "5"), row(&url(1), "image/png", "6", "6")),
        )
        .unwrap();

        let gz = dir.path().join("part-2.tsv.gz");
        let mut encoder = GzEncoder::new(File::create(&gz).unwrap(), Compression::default());
        writeln!(encoder, "{HEADER}").unwrap();
        writeln!(encoder, "{}", row(&url(1), "image/png", "6", "6")).unwrap();
        writeln!(encoder, "{}", row(&url(2), "image/png", "7", "7")).unwrap();
        encoder.finish().unwrap();

        let (tx, mut rx) = mpsc::channel(2);
        let handle = spawn_reader(vec![plain, gz], InputOptions::default(), tx);

        let mut urls = Vec::new();
        while let Some(row) = rx.recv().await {
            urls.push(row.url);
        }
        let stats = handle.await.unwrap().unwrap();

        assert_eq!(urls, vec![url(0), url(1), url(2)]);
        assert_eq!(stats.kept, 3);
        assert_eq!(stats.duplicates, 1);
    }

    #[tokio::test]
    async fn test_missing_table_is_an_input_error() {
        let (tx, _rx) = mpsc::channel(1);
        let err = spawn_reader(vec![PathBuf::from("/nonexistent/wit.tsv")], InputOptions::default(), tx)
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, WikitranspError::Input { .. }));
    }

    #[tokio::test]
    async fn test_reader_stops_when_receiver_drops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.tsv");
        let body: String = (0..1000)
            .map(|i| row(&url(i), "image/png", "9", "9") + "\n")
            .collect();
        std::fs::write(&path, body).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let handle = spawn_reader(vec![path], InputOptions::default(), tx);
        assert!(rx.recv().await.is_some());
        drop(rx);

        let stats = handle.await.unwrap().unwrap();
        assert!(stats.kept < 1000);
    }
}
