//! Accepted-row output in TSV or JSONL format.
//!
//! TSV output passes the original input fields through unchanged, so an
//! output file can be fed back in as input. JSONL output adds the observed
//! alpha range.

use serde::Serialize;
use std::io::{self, Write};

use crate::png::AlphaRange;
use crate::types::Outcome;

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Tab-separated input fields, one row per line
    Tsv,
    /// One JSON object per line (newline-delimited JSON)
    JsonLines,
}

impl OutputFormat {
    /// Parse format from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "tsv" => Some(Self::Tsv),
            "jsonl" | "jsonlines" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

/// JSONL record for one accepted image.
#[derive(Debug, Serialize)]
pub struct AcceptedRecord<'a> {
    pub url: &'a str,
    pub width: u32,
    pub height: u32,
    pub mime: &'a str,
    pub verdict: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpha: Option<AlphaRange>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    pub fields: &'a [String],
}

impl<'a> From<&'a Outcome> for AcceptedRecord<'a> {
    fn from(outcome: &'a Outcome) -> Self {
        Self {
            url: &outcome.row.url,
            width: outcome.row.width,
            height: outcome.row.height,
            mime: &outcome.row.mime,
            verdict: outcome.kind.to_string(),
            alpha: outcome.alpha,
            fields: &outcome.row.fields,
        }
    }
}

/// A writer that emits accepted rows, flushing every `flush_every` rows.
///
/// Each row is written with a single `write_all` into the underlying writer,
/// so rows never interleave.
pub struct OutputWriter<W: Write> {
    writer: W,
    format: OutputFormat,
    flush_every: usize,
    unflushed: usize,
    items_written: usize,
    line: Vec<u8>,
}

impl<W: Write> OutputWriter<W> {
    pub fn new(writer: W, format: OutputFormat) -> Self {
        Self {
            writer,
            format,
            flush_every: 1,
            unflushed: 0,
            items_written: 0,
            line: Vec::new(),
        }
    }

    pub fn with_flush_every(mut self, rows: usize) -> Self {
        self.flush_every = rows.max(1);
        self
    }

    /// Write one accepted outcome.
    pub fn write(&mut self, outcome: &Outcome) -> io::Result<()> {
        self.line.clear();
        match self.format {
            OutputFormat::Tsv => {
                let row = &outcome.row;
                if row.fields.is_empty() {
                    write!(self.line, "{}\t{}\t{}\t{}", row.url, row.width, row.height, row.mime)?;
                } else {
                    self.line.extend_from_slice(row.fields.join("\t").as_bytes());
                }
            }
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.line, &AcceptedRecord::from(outcome))
                    .map_err(io::Error::other)?;
            }
        }
        self.line.push(b'\n');
        self.writer.write_all(&self.line)?;

        self.items_written += 1;
        self.unflushed += 1;
        if self.unflushed >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Get the number of rows written.
    pub fn items_written(&self) -> usize {
        self.items_written
    }

    /// Flush the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.unflushed = 0;
        self.writer.flush()
    }

    /// Consume the writer and return the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandidateRow, OutcomeKind};

    fn accepted(row: CandidateRow) -> Outcome {
        let mut outcome = Outcome::short_circuit(row, OutcomeKind::Accepted);
        outcome.alpha = Some(AlphaRange {
            min: 12,
            max: 255,
            samples: 40,
        });
        outcome
    }

    #[test]
    fn test_tsv_passes_fields_through() {
        let mut row = CandidateRow::new("https://example.org/a.png", 1200, 900);
        row.fields = vec!["en".into(), "page".into(), row.url.clone()];
        let mut writer = OutputWriter::new(Vec::new(), OutputFormat::Tsv);
        writer.write(&accepted(row)).unwrap();

        let output = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(output, "en\tpage\thttps://example.org/a.png\n");
    }

    #[test]
    fn test_tsv_without_fields_writes_core_columns() {
        let mut writer = OutputWriter::new(Vec::new(), OutputFormat::Tsv);
        writer
            .write(&accepted(CandidateRow::new("https://example.org/b.png", 10, 20)))
            .unwrap();
        let output = String::from_utf8(writer.into_inner()).unwrap();
        assert_eq!(output, "https://example.org/b.png\t10\t20\timage/png\n");
    }

    #[test]
    fn test_write_jsonl() {
        let mut writer = OutputWriter::new(Vec::new(), OutputFormat::JsonLines);
        for name in ["a", "b"] {
            let row = CandidateRow::new(format!("https://example.org/{name}.png"), 8, 8);
            writer.write(&accepted(row)).unwrap();
        }
        assert_eq!(writer.items_written(), 2);

        let output = String::from_utf8(writer.into_inner()).unwrap();
        let lines: Vec<&str> = output.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(value["url"], "https://example.org/a.png");
        assert_eq!(value["verdict"], "accepted");
        assert_eq!(value["alpha"]["min"], 12);
        assert!(value.get("fields").is_none());
    }

    struct CountingFlush {
        flushes: usize,
    }

    impl Write for CountingFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_flush_every() {
        let mut writer =
            OutputWriter::new(CountingFlush { flushes: 0 }, OutputFormat::Tsv).with_flush_every(3);
        for i in 0..7 {
            let row = CandidateRow::new(format!("https://example.org/{i}.png"), 8, 8);
            writer.write(&accepted(row)).unwrap();
        }
        assert_eq!(writer.into_inner().flushes, 2);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(OutputFormat::parse("tsv"), Some(OutputFormat::Tsv));
        assert_eq!(OutputFormat::parse("jsonl"), Some(OutputFormat::JsonLines));
        assert_eq!(OutputFormat::parse("JSONL"), Some(OutputFormat::JsonLines));
        assert_eq!(OutputFormat::parse("json"), None);
    }
}
