//! Transparency classification over a chunk event stream.
//!
//! The classifier answers one question per image: does any pixel have an
//! alpha value strictly between fully transparent and fully opaque? It stops
//! as soon as the answer is known, so most images are abandoned long before
//! their last byte arrives.
//!
//! Decision rules:
//! - Indexed images decide on the palette transparency table (tRNS). Any entry
//!   strictly inside (0, 255) is semi-transparent; otherwise transparency is
//!   binary at best.
//! - Grayscale and truecolour images cannot carry partial alpha. A tRNS colour
//!   key makes them binary; without one they have no alpha at all.
//! - Images with an alpha channel are decoded scanline by scanline until a
//!   partial alpha sample is found, every row has been seen, or the
//!   compressed-byte budget runs out.

use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;

use crate::error::ClassifyError;
use crate::png::chunk::{ChunkEvent, ChunkType, PngChunk};
use crate::png::header::{ColorType, ImageHeader};
use crate::png::scanline::{Feed, ScanlineDecoder};
use crate::types::{OutcomeKind, RejectReason};

/// Declared-dimension bounds. A bound of zero is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SizeBounds {
    /// Minimum length of the shorter side
    pub min: u32,
    /// Maximum length of the longer side
    pub max: u32,
}

impl SizeBounds {
    pub fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn admits(&self, width: u32, height: u32) -> bool {
        if self.min > 0 && width.min(height) < self.min {
            return false;
        }
        if self.max > 0 && width.max(height) > self.max {
            return false;
        }
        true
    }
}

/// Running summary of alpha samples seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlphaRange {
    pub min: u16,
    pub max: u16,
    pub samples: u64,
}

impl Default for AlphaRange {
    fn default() -> Self {
        Self {
            min: u16::MAX,
            max: 0,
            samples: 0,
        }
    }
}

impl AlphaRange {
    fn observe(&mut self, alpha: u16) {
        self.min = self.min.min(alpha);
        self.max = self.max.max(alpha);
        self.samples += 1;
    }
}

/// Where the alpha sample sits within one pixel.
#[derive(Debug, Clone, Copy)]
struct AlphaLayout {
    pixel_bytes: usize,
    offset: usize,
    wide: bool,
    opaque: u16,
}

impl AlphaLayout {
    fn for_header(header: &ImageHeader) -> Self {
        let sample_bytes = header.bit_depth as usize / 8;
        let channels = header.color_type.channels() as usize;
        Self {
            pixel_bytes: channels * sample_bytes,
            offset: (channels - 1) * sample_bytes,
            wide: sample_bytes == 2,
            opaque: if sample_bytes == 2 { u16::MAX } else { 255 },
        }
    }

    /// Record every alpha sample in `row`; break on the first partial one.
    fn scan(&self, row: &[u8], range: &mut AlphaRange) -> ControlFlow<()> {
        for pixel in row.chunks_exact(self.pixel_bytes) {
            let alpha = if self.wide {
                u16::from_be_bytes([pixel[self.offset], pixel[self.offset + 1]])
            } else {
                pixel[self.offset] as u16
            };
            range.observe(alpha);
            if alpha != 0 && alpha != self.opaque {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }
}

/// Final answer for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    SemiTransparent,
    BinaryAlphaOnly,
    NoAlphaChannel,
}

impl Verdict {
    pub fn outcome(self) -> OutcomeKind {
        match self {
            Self::SemiTransparent => OutcomeKind::Accepted,
            Self::BinaryAlphaOnly => OutcomeKind::Rejected(RejectReason::BinaryAlphaOnly),
            Self::NoAlphaChannel => OutcomeKind::Rejected(RejectReason::NoAlphaChannel),
        }
    }
}

/// Classifier tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierLimits {
    /// Compressed IDAT bytes to inspect before settling on what was seen
    pub max_image_data_bytes: u64,
    /// Largest decoded scanline accepted from a header
    pub max_row_bytes: usize,
}

impl Default for ClassifierLimits {
    fn default() -> Self {
        Self {
            max_image_data_bytes: 4 * 1024 * 1024,
            max_row_bytes: 1024 * 1024,
        }
    }
}

/// Observable classifier state.
#[derive(Debug, Clone, Default)]
pub struct ClassifierState {
    pub header: Option<ImageHeader>,
    pub alpha: AlphaRange,
    /// Compressed image-data bytes consumed
    pub image_data_bytes: u64,
    /// A tRNS chunk with only fully transparent or opaque entries was seen
    pub binary_transparency: bool,
    pub verdict: Option<Verdict>,
}

/// Per-image state machine fed with [`ChunkEvent`]s.
pub struct TransparencyClassifier {
    limits: ClassifierLimits,
    state: ClassifierState,
    decoder: Option<ScanlineDecoder>,
    layout: Option<AlphaLayout>,
}

impl TransparencyClassifier {
    pub fn new(limits: ClassifierLimits) -> Self {
        Self {
            limits,
            state: ClassifierState::default(),
            decoder: None,
            layout: None,
        }
    }

    pub fn state(&self) -> &ClassifierState {
        &self.state
    }

    pub fn header(&self) -> Option<&ImageHeader> {
        self.state.header.as_ref()
    }

    /// Scanlines decoded so far (alpha-channel images only).
    pub fn rows_decoded(&self) -> u32 {
        self.decoder.as_ref().map_or(0, |d| d.rows_decoded())
    }

    /// Feed one event. Returns the verdict once it is known.
    pub fn observe(&mut self, event: &ChunkEvent<'_>) -> Result<Option<Verdict>, ClassifyError> {
        if let Some(verdict) = self.state.verdict {
            return Ok(Some(verdict));
        }
        let verdict = match event {
            ChunkEvent::Chunk(chunk) => self.on_chunk(chunk)?,
            ChunkEvent::Data { bytes, .. } => self.on_data(bytes)?,
            ChunkEvent::End => Some(self.on_end()?),
        };
        self.state.verdict = verdict;
        Ok(verdict)
    }

    fn on_chunk(&mut self, chunk: &PngChunk) -> Result<Option<Verdict>, ClassifyError> {
        let Some(header) = self.state.header else {
            if chunk.kind != ChunkType::IHDR {
                return Err(ClassifyError::InvalidHeader(format!(
                    "first chunk is {}, not IHDR",
                    chunk.kind
                )));
            }
            let header = ImageHeader::parse(&chunk.payload)?;
            if header.color_type.has_alpha_channel() {
                let row_bytes = header.row_bytes(header.width);
                if row_bytes > self.limits.max_row_bytes {
                    return Err(ClassifyError::InvalidHeader(format!(
                        "scanline of {row_bytes} bytes exceeds the {} byte limit",
                        self.limits.max_row_bytes
                    )));
                }
                self.decoder = Some(ScanlineDecoder::new(&header));
                self.layout = Some(AlphaLayout::for_header(&header));
            }
            self.state.header = Some(header);
            return Ok(None);
        };

        match chunk.kind {
            ChunkType::IHDR => Err(ClassifyError::Ordering("repeated IHDR".to_string())),
            ChunkType::TRNS => Ok(self.on_transparency(&header, &chunk.payload)),
            ChunkType::IEND => self.on_end().map(Some),
            _ => Ok(None),
        }
    }

    fn on_transparency(&mut self, header: &ImageHeader, payload: &[u8]) -> Option<Verdict> {
        match header.color_type {
            ColorType::Indexed => {
                if payload.iter().any(|&a| a != 0 && a != 255) {
                    return Some(Verdict::SemiTransparent);
                }
                self.state.binary_transparency = true;
                None
            }
            ColorType::Grayscale | ColorType::Truecolor => {
                self.state.binary_transparency = true;
                None
            }
            ColorType::GrayscaleAlpha | ColorType::TruecolorAlpha => {
                tracing::debug!("Ignoring tRNS on an image with an alpha channel");
                None
            }
        }
    }

    fn palette_or_key_verdict(&self) -> Verdict {
        if self.state.binary_transparency {
            Verdict::BinaryAlphaOnly
        } else {
            Verdict::NoAlphaChannel
        }
    }

    fn settle_on_seen(&self) -> Verdict {
        if self.state.alpha.samples > 0 {
            Verdict::BinaryAlphaOnly
        } else {
            Verdict::NoAlphaChannel
        }
    }

    fn on_data(&mut self, bytes: &[u8]) -> Result<Option<Verdict>, ClassifyError> {
        if self.state.header.is_none() {
            return Err(ClassifyError::InvalidHeader(
                "image data before IHDR".to_string(),
            ));
        }
        let Some(layout) = self.layout else {
            return Ok(Some(self.palette_or_key_verdict()));
        };
        let Some(decoder) = self.decoder.as_mut() else {
            return Ok(Some(self.palette_or_key_verdict()));
        };

        self.state.image_data_bytes += bytes.len() as u64;
        let alpha = &mut self.state.alpha;
        let feed = decoder.feed(bytes, |row| layout.scan(row, alpha))?;
        let verdict = match feed {
            Feed::Stopped => Some(Verdict::SemiTransparent),
            Feed::Complete => Some(self.settle_on_seen()),
            Feed::NeedMore if self.state.image_data_bytes >= self.limits.max_image_data_bytes => {
                tracing::debug!(
                    bytes = self.state.image_data_bytes,
                    samples = self.state.alpha.samples,
                    "Image data budget exhausted"
                );
                Some(self.settle_on_seen())
            }
            Feed::NeedMore => None,
        };
        Ok(verdict)
    }

    fn on_end(&mut self) -> Result<Verdict, ClassifyError> {
        let Some(header) = self.state.header else {
            return Err(ClassifyError::InvalidHeader("IEND before IHDR".to_string()));
        };
        if header.color_type.has_alpha_channel() {
            tracing::debug!(
                rows = self.rows_decoded(),
                samples = self.state.alpha.samples,
                "IEND reached before all rows were decoded"
            );
            Ok(self.settle_on_seen())
        } else {
            Ok(self.palette_or_key_verdict())
        }
    }
}
