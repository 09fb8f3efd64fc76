//! IHDR parsing and scanline geometry.

use crate::error::ClassifyError;

/// The fixed 8-byte PNG file signature.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Adam7 passes as (x0, y0, dx, dy).
pub(crate) const ADAM7: [(u32, u32, u32, u32); 7] = [
    (0, 0, 8, 8),
    (4, 0, 8, 8),
    (0, 4, 4, 8),
    (2, 0, 4, 4),
    (0, 2, 2, 4),
    (1, 0, 2, 2),
    (0, 1, 1, 2),
];

/// PNG colour types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorType {
    Grayscale,
    Truecolor,
    Indexed,
    GrayscaleAlpha,
    TruecolorAlpha,
}

impl ColorType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Grayscale),
            2 => Some(Self::Truecolor),
            3 => Some(Self::Indexed),
            4 => Some(Self::GrayscaleAlpha),
            6 => Some(Self::TruecolorAlpha),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Grayscale => 0,
            Self::Truecolor => 2,
            Self::Indexed => 3,
            Self::GrayscaleAlpha => 4,
            Self::TruecolorAlpha => 6,
        }
    }

    /// Samples per pixel.
    pub fn channels(self) -> u8 {
        match self {
            Self::Grayscale | Self::Indexed => 1,
            Self::GrayscaleAlpha => 2,
            Self::Truecolor => 3,
            Self::TruecolorAlpha => 4,
        }
    }

    /// Whether every pixel carries its own alpha sample.
    pub fn has_alpha_channel(self) -> bool {
        matches!(self, Self::GrayscaleAlpha | Self::TruecolorAlpha)
    }

    fn allows_depth(self, depth: u8) -> bool {
        match self {
            Self::Grayscale => matches!(depth, 1 | 2 | 4 | 8 | 16),
            Self::Indexed => matches!(depth, 1 | 2 | 4 | 8),
            Self::Truecolor | Self::GrayscaleAlpha | Self::TruecolorAlpha => {
                matches!(depth, 8 | 16)
            }
        }
    }
}

/// One scanline pass: `rows` rows of `row_bytes` bytes each (filter byte excluded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pass {
    pub row_bytes: usize,
    pub rows: u32,
}

/// Parsed IHDR chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: ColorType,
    pub interlaced: bool,
}

impl ImageHeader {
    /// Parse and validate a 13-byte IHDR payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ClassifyError> {
        let bytes: &[u8; 13] = payload.try_into().map_err(|_| {
            ClassifyError::InvalidHeader(format!("IHDR length {} (expected 13)", payload.len()))
        })?;

        let width = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let height = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let bit_depth = bytes[8];
        let color_type = ColorType::from_u8(bytes[9]).ok_or_else(|| {
            ClassifyError::InvalidHeader(format!("unknown colour type {}", bytes[9]))
        })?;

        if width == 0 || height == 0 || width > i32::MAX as u32 || height > i32::MAX as u32 {
            return Err(ClassifyError::InvalidHeader(format!(
                "dimensions {width}x{height} out of range"
            )));
        }
        if !color_type.allows_depth(bit_depth) {
            return Err(ClassifyError::InvalidHeader(format!(
                "bit depth {bit_depth} invalid for colour type {}",
                bytes[9]
            )));
        }
        if bytes[10] != 0 || bytes[11] != 0 {
            return Err(ClassifyError::InvalidHeader(
                "unknown compression or filter method".to_string(),
            ));
        }
        let interlaced = match bytes[12] {
            0 => false,
            1 => true,
            other => {
                return Err(ClassifyError::InvalidHeader(format!(
                    "unknown interlace method {other}"
                )))
            }
        };

        Ok(Self {
            width,
            height,
            bit_depth,
            color_type,
            interlaced,
        })
    }

    pub fn bits_per_pixel(&self) -> usize {
        self.color_type.channels() as usize * self.bit_depth as usize
    }

    /// Byte distance used by the Sub, Average and Paeth filters.
    pub fn filter_stride(&self) -> usize {
        (self.bits_per_pixel() / 8).max(1)
    }

    /// Bytes in one scanline of `width` pixels, filter byte excluded.
    pub fn row_bytes(&self, width: u32) -> usize {
        (width as usize * self.bits_per_pixel()).div_ceil(8)
    }

    /// Scanline passes in stream order. Empty Adam7 passes are omitted, since
    /// they contribute no bytes (not even filter bytes) to the image data.
    pub fn passes(&self) -> Vec<Pass> {
        if !self.interlaced {
            return vec![Pass {
                row_bytes: self.row_bytes(self.width),
                rows: self.height,
            }];
        }
        ADAM7
            .iter()
            .filter_map(|&(x0, y0, dx, dy)| {
                let w = reduced(self.width, x0, dx);
                let h = reduced(self.height, y0, dy);
                (w > 0 && h > 0).then(|| Pass {
                    row_bytes: self.row_bytes(w),
                    rows: h,
                })
            })
            .collect()
    }
}

fn reduced(full: u32, start: u32, step: u32) -> u32 {
    if full > start {
        (full - start).div_ceil(step)
    } else {
        0
    }
}
