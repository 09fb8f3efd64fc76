//! Minimal PNG encoder for fixtures.
//!
//! Produces small, valid (or deliberately damaged) PNG files with a chosen
//! colour type, filter, interlacing and IDAT split, so tests and benchmarks
//! can exercise the streaming classifier without network access.

use crate::png::header::{ColorType, ADAM7, PNG_SIGNATURE};
use crate::png::scanline::paeth;

/// Append one framed chunk (length, type, payload, CRC) to `out`.
pub fn write_chunk(out: &mut Vec<u8>, kind: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(kind);
    out.extend_from_slice(payload);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(kind);
    hasher.update(payload);
    out.extend_from_slice(&hasher.finalize().to_be_bytes());
}

/// A synthetic image description.
#[derive(Debug, Clone)]
pub struct SynthPng {
    width: u32,
    height: u32,
    color: ColorType,
    bit_depth: u8,
    /// Row-major samples, big-endian for 16-bit depths
    pixels: Vec<u8>,
    palette: Option<Vec<u8>>,
    trns: Option<Vec<u8>>,
    filter: u8,
    interlaced: bool,
    idat_size: usize,
    bad_header_crc: bool,
}

impl SynthPng {
    fn from_samples(
        width: u32,
        height: u32,
        color: ColorType,
        bit_depth: u8,
        pixel: impl Fn(u32, u32) -> Vec<u8>,
    ) -> Self {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend(pixel(x, y));
            }
        }
        Self {
            width,
            height,
            color,
            bit_depth,
            pixels,
            palette: None,
            trns: None,
            filter: 0,
            interlaced: false,
            idat_size: usize::MAX,
            bad_header_crc: false,
        }
    }

    pub fn rgba8(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 4]) -> Self {
        Self::from_samples(width, height, ColorType::TruecolorAlpha, 8, |x, y| {
            pixel(x, y).to_vec()
        })
    }

    pub fn rgba16(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u16; 4]) -> Self {
        Self::from_samples(width, height, ColorType::TruecolorAlpha, 16, |x, y| {
            pixel(x, y).iter().flat_map(|s| s.to_be_bytes()).collect()
        })
    }

    pub fn gray_alpha8(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 2]) -> Self {
        Self::from_samples(width, height, ColorType::GrayscaleAlpha, 8, |x, y| {
            pixel(x, y).to_vec()
        })
    }

    pub fn rgb8(width: u32, height: u32, pixel: impl Fn(u32, u32) -> [u8; 3]) -> Self {
        Self::from_samples(width, height, ColorType::Truecolor, 8, |x, y| {
            pixel(x, y).to_vec()
        })
    }

    pub fn gray8(width: u32, height: u32, pixel: impl Fn(u32, u32) -> u8) -> Self {
        Self::from_samples(width, height, ColorType::Grayscale, 8, |x, y| {
            vec![pixel(x, y)]
        })
    }

    /// 8-bit indexed image over `palette`.
    pub fn indexed(
        width: u32,
        height: u32,
        palette: &[[u8; 3]],
        index: impl Fn(u32, u32) -> u8,
    ) -> Self {
        let mut png = Self::from_samples(width, height, ColorType::Indexed, 8, |x, y| {
            vec![index(x, y)]
        });
        png.palette = Some(palette.iter().flatten().copied().collect());
        png
    }

    /// Add a tRNS chunk with this raw payload.
    pub fn with_trns(mut self, payload: Vec<u8>) -> Self {
        self.trns = Some(payload);
        self
    }

    /// Filter type (0..=4) applied to every scanline.
    pub fn with_filter(mut self, filter: u8) -> Self {
        self.filter = filter;
        self
    }

    pub fn interlaced(mut self) -> Self {
        self.interlaced = true;
        self
    }

    /// Split the compressed stream into IDAT chunks of at most `size` bytes.
    pub fn with_idat_size(mut self, size: usize) -> Self {
        self.idat_size = size.max(1);
        self
    }

    /// Corrupt the IHDR checksum.
    pub fn with_bad_header_crc(mut self) -> Self {
        self.bad_header_crc = true;
        self
    }

    fn pixel_bytes(&self) -> usize {
        self.color.channels() as usize * self.bit_depth as usize / 8
    }

    /// Filtered scanlines, pass by pass, before compression.
    pub fn raw_data(&self) -> Vec<u8> {
        let bpp = self.pixel_bytes();
        let passes: Vec<(u32, u32, u32, u32)> = if self.interlaced {
            ADAM7.to_vec()
        } else {
            vec![(0, 0, 1, 1)]
        };

        let mut out = Vec::new();
        for (x0, y0, dx, dy) in passes {
            let xs: Vec<u32> = (x0..self.width).step_by(dx as usize).collect();
            if xs.is_empty() {
                continue;
            }
            let mut prev = vec![0u8; xs.len() * bpp];
            for y in (y0..self.height).step_by(dy as usize) {
                let mut row = Vec::with_capacity(prev.len());
                for &x in &xs {
                    let at = (y as usize * self.width as usize + x as usize) * bpp;
                    row.extend_from_slice(&self.pixels[at..at + bpp]);
                }
                out.push(self.filter);
                out.extend(filter_row(self.filter, &row, &prev, bpp));
                prev = row;
            }
        }
        out
    }

    /// The zlib stream carried by the IDAT chunks.
    pub fn zlib_data(&self) -> Vec<u8> {
        miniz_oxide::deflate::compress_to_vec_zlib(&self.raw_data(), 6)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = PNG_SIGNATURE.to_vec();

        let mut ihdr = Vec::with_capacity(13);
        ihdr.extend_from_slice(&self.width.to_be_bytes());
        ihdr.extend_from_slice(&self.height.to_be_bytes());
        ihdr.extend_from_slice(&[
            self.bit_depth,
            self.color.to_u8(),
            0,
            0,
            self.interlaced as u8,
        ]);
        write_chunk(&mut out, b"IHDR", &ihdr);
        if self.bad_header_crc {
            let at = out.len() - 1;
            out[at] ^= 0xFF;
        }

        if let Some(palette) = &self.palette {
            write_chunk(&mut out, b"PLTE", palette);
        }
        if let Some(trns) = &self.trns {
            write_chunk(&mut out, b"tRNS", trns);
        }
        for piece in self.zlib_data().chunks(self.idat_size) {
            write_chunk(&mut out, b"IDAT", piece);
        }
        write_chunk(&mut out, b"IEND", &[]);
        out
    }
}

fn filter_row(filter: u8, row: &[u8], prev: &[u8], bpp: usize) -> Vec<u8> {
    (0..row.len())
        .map(|i| {
            let left = if i >= bpp { row[i - bpp] } else { 0 };
            let up = prev[i];
            let upper_left = if i >= bpp { prev[i - bpp] } else { 0 };
            let predicted = match filter {
                1 => left,
                2 => up,
                3 => ((left as u16 + up as u16) / 2) as u8,
                4 => paeth(left, up, upper_left),
                _ => 0,
            };
            row[i].wrapping_sub(predicted)
        })
        .collect()
}
