//! Incremental inflate + unfilter of PNG image data.
//!
//! Compressed IDAT bytes are fed in whatever slices the network delivers.
//! Each completed scanline is unfiltered against the previous row of the same
//! pass and handed to a visitor, which may stop decoding early.

use miniz_oxide::inflate::stream::{inflate, InflateState};
use miniz_oxide::{DataFormat, MZError, MZFlush, MZStatus};
use std::ops::ControlFlow;

use crate::error::ScanlineError;
use crate::png::header::{ImageHeader, Pass};

/// Size of the inflate output window per call.
const INFLATE_CHUNK: usize = 32 * 1024;

/// Result of feeding one slice of compressed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// All input consumed; more is needed to finish the image
    NeedMore,
    /// The visitor asked to stop
    Stopped,
    /// Every scanline has been decoded
    Complete,
}

/// Reassembles and unfilters scanlines across passes.
struct RowAssembler {
    passes: Vec<Pass>,
    pass: usize,
    rows_left: u32,
    stride: usize,
    /// Filter byte followed by the row
    current: Vec<u8>,
    filled: usize,
    previous: Vec<u8>,
    row: u32,
}

impl RowAssembler {
    fn new(header: &ImageHeader) -> Self {
        let passes: Vec<Pass> = header
            .passes()
            .into_iter()
            .filter(|p| p.row_bytes > 0 && p.rows > 0)
            .collect();
        let mut assembler = Self {
            passes,
            pass: 0,
            rows_left: 0,
            stride: header.filter_stride(),
            current: Vec::new(),
            filled: 0,
            previous: Vec::new(),
            row: 0,
        };
        assembler.start_pass();
        assembler
    }

    fn start_pass(&mut self) {
        if let Some(pass) = self.passes.get(self.pass) {
            self.rows_left = pass.rows;
            self.current = vec![0; pass.row_bytes + 1];
            self.previous = vec![0; pass.row_bytes];
            self.filled = 0;
        }
    }

    fn done(&self) -> bool {
        self.pass >= self.passes.len()
    }

    fn push<F>(&mut self, mut data: &[u8], visit: &mut F) -> Result<ControlFlow<()>, ScanlineError>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        while !data.is_empty() && !self.done() {
            let n = (self.current.len() - self.filled).min(data.len());
            self.current[self.filled..self.filled + n].copy_from_slice(&data[..n]);
            self.filled += n;
            data = &data[n..];

            if self.filled < self.current.len() {
                break;
            }
            self.filled = 0;
            self.unfilter()?;
            let flow = visit(&self.current[1..]);
            self.advance();
            if flow.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn unfilter(&mut self) -> Result<(), ScanlineError> {
        let filter = self.current[0];
        let stride = self.stride;
        let prev = &self.previous;
        let row = &mut self.current[1..];
        match filter {
            0 => {}
            1 => {
                for i in stride..row.len() {
                    row[i] = row[i].wrapping_add(row[i - stride]);
                }
            }
            2 => {
                for (r, p) in row.iter_mut().zip(prev.iter()) {
                    *r = r.wrapping_add(*p);
                }
            }
            3 => {
                for i in 0..row.len() {
                    let left = if i >= stride { row[i - stride] } else { 0 };
                    let avg = ((left as u16 + prev[i] as u16) / 2) as u8;
                    row[i] = row[i].wrapping_add(avg);
                }
            }
            4 => {
                for i in 0..row.len() {
                    let (left, upper_left) = if i >= stride {
                        (row[i - stride], prev[i - stride])
                    } else {
                        (0, 0)
                    };
                    row[i] = row[i].wrapping_add(paeth(left, prev[i], upper_left));
                }
            }
            other => {
                return Err(ScanlineError::BadFilter {
                    filter: other,
                    row: self.row,
                })
            }
        }
        Ok(())
    }

    fn advance(&mut self) {
        self.row += 1;
        self.previous.copy_from_slice(&self.current[1..]);
        self.rows_left -= 1;
        if self.rows_left == 0 {
            self.pass += 1;
            self.start_pass();
        }
    }
}

pub(crate) fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

/// Streaming decoder for one image's IDAT payload.
pub struct ScanlineDecoder {
    inflater: Box<InflateState>,
    out: Vec<u8>,
    rows: RowAssembler,
}

impl ScanlineDecoder {
    pub fn new(header: &ImageHeader) -> Self {
        Self {
            inflater: InflateState::new_boxed(DataFormat::Zlib),
            out: vec![0; INFLATE_CHUNK],
            rows: RowAssembler::new(header),
        }
    }

    /// Scanlines handed to the visitor so far.
    pub fn rows_decoded(&self) -> u32 {
        self.rows.row
    }

    /// Feed compressed bytes, visiting every scanline they complete.
    pub fn feed<F>(&mut self, mut input: &[u8], mut visit: F) -> Result<Feed, ScanlineError>
    where
        F: FnMut(&[u8]) -> ControlFlow<()>,
    {
        loop {
            if self.rows.done() {
                return Ok(Feed::Complete);
            }
            let result = inflate(&mut self.inflater, input, &mut self.out, MZFlush::None);
            input = &input[result.bytes_consumed..];
            let written = result.bytes_written;

            if self.rows.push(&self.out[..written], &mut visit)?.is_break() {
                return Ok(Feed::Stopped);
            }

            match result.status {
                Ok(MZStatus::StreamEnd) => {
                    return if self.rows.done() {
                        Ok(Feed::Complete)
                    } else {
                        Err(ScanlineError::Inflate(format!(
                            "image data ended after {} rows",
                            self.rows.row
                        )))
                    };
                }
                Ok(MZStatus::Ok) => {
                    if input.is_empty() && written < self.out.len() {
                        return Ok(Feed::NeedMore);
                    }
                }
                Ok(MZStatus::NeedDict) => {
                    return Err(ScanlineError::Inflate("preset dictionary required".to_string()))
                }
                Err(MZError::Buf) => return Ok(Feed::NeedMore),
                Err(e) => return Err(ScanlineError::Inflate(format!("{e:?}"))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::png::synth::SynthPng;

    fn header(width: u32, height: u32, depth: u8, color: u8, interlaced: bool) -> ImageHeader {
        let mut payload = Vec::new();
        payload.extend_from_slice(&width.to_be_bytes());
        payload.extend_from_slice(&height.to_be_bytes());
        payload.extend_from_slice(&[depth, color, 0, 0, interlaced as u8]);
        ImageHeader::parse(&payload).unwrap()
    }

    /// Decode `zlib` fed in `slice`-sized pieces, collecting every row.
    fn decode_all(header: &ImageHeader, zlib: &[u8], slice: usize) -> Vec<Vec<u8>> {
        let mut decoder = ScanlineDecoder::new(header);
        let mut rows = Vec::new();
        let mut status = Feed::NeedMore;
        for piece in zlib.chunks(slice) {
            status = decoder
                .feed(piece, |row| {
                    rows.push(row.to_vec());
                    ControlFlow::Continue(())
                })
                .unwrap();
        }
        assert_eq!(status, Feed::Complete);
        rows
    }

    #[test]
    fn test_paeth_predictor() {
        assert_eq!(paeth(10, 20, 10), 20);
        assert_eq!(paeth(20, 10, 10), 20);
        assert_eq!(paeth(0, 0, 0), 0);
        assert_eq!(paeth(100, 50, 200), 50);
    }

    #[test]
    fn test_every_filter_roundtrips_pixels() {
        let pixel = |x: u32, y: u32| [(x * 31) as u8, (y * 17) as u8, (x ^ y) as u8, (x * y) as u8];
        let h = header(9, 7, 8, 6, false);
        for filter in 0..=4 {
            let png = SynthPng::rgba8(9, 7, pixel).with_filter(filter);
            let rows = decode_all(&h, &png.zlib_data(), 5);
            assert_eq!(rows.len(), 7);
            for (y, row) in rows.iter().enumerate() {
                let expected: Vec<u8> = (0..9).flat_map(|x| pixel(x, y as u32)).collect();
                assert_eq!(row, &expected, "filter {filter} row {y}");
            }
        }
    }

    #[test]
    fn test_interlaced_rows_follow_passes() {
        let h = header(10, 10, 8, 6, true);
        let png = SynthPng::rgba8(10, 10, |x, y| [x as u8, y as u8, 0, 255])
            .interlaced()
            .with_filter(4);
        let rows = decode_all(&h, &png.zlib_data(), 7);
        let expected_rows: u32 = h.passes().iter().map(|p| p.rows).sum();
        assert_eq!(rows.len() as u32, expected_rows);
        // First pass holds pixels (0,0) and (8,0).
        assert_eq!(rows[0], vec![0, 0, 0, 255, 8, 0, 0, 255]);
    }

    #[test]
    fn test_visitor_can_stop_early() {
        let h = header(4, 50, 8, 6, false);
        let png = SynthPng::rgba8(4, 50, |_, _| [1, 1, 1, 255]);
        let zlib = png.zlib_data();
        let mut decoder = ScanlineDecoder::new(&h);
        let mut seen = 0;
        let status = decoder
            .feed(&zlib, |_| {
                seen += 1;
                if seen == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();
        assert_eq!(status, Feed::Stopped);
        assert_eq!(seen, 3);
        assert_eq!(decoder.rows_decoded(), 3);
    }

    #[test]
    fn test_bad_filter_type() {
        let h = header(2, 2, 8, 0, false);
        let raw = [7u8, 0, 0, 0, 0, 0];
        let zlib = miniz_oxide::deflate::compress_to_vec_zlib(&raw, 6);
        let mut decoder = ScanlineDecoder::new(&h);
        let err = decoder
            .feed(&zlib, |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert_eq!(err, ScanlineError::BadFilter { filter: 7, row: 0 });
    }

    #[test]
    fn test_short_stream_is_an_error() {
        let h = header(2, 3, 8, 0, false);
        let raw = [0u8, 1, 2, 0, 3, 4];
        let zlib = miniz_oxide::deflate::compress_to_vec_zlib(&raw, 6);
        let mut decoder = ScanlineDecoder::new(&h);
        let err = decoder
            .feed(&zlib, |_| ControlFlow::Continue(()))
            .unwrap_err();
        assert!(matches!(err, ScanlineError::Inflate(_)));
    }

    #[test]
    fn test_garbage_is_an_inflate_error() {
        let h = header(2, 2, 8, 0, false);
        let mut decoder = ScanlineDecoder::new(&h);
        assert!(decoder
            .feed(&[0xFF; 32], |_| ControlFlow::Continue(()))
            .is_err());
    }
}
