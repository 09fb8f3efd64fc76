//! Streaming PNG inspection.
//!
//! [`chunk`] frames a byte stream into chunks, [`scanline`] inflates and
//! unfilters image data incrementally, and [`classify`] turns the resulting
//! events into a transparency verdict.

pub mod chunk;
pub mod classify;
pub mod header;
pub mod scanline;
pub mod synth;

pub use chunk::{ChunkEvent, ChunkReader, ChunkType, PngChunk};
pub use classify::{
    AlphaRange, ClassifierLimits, ClassifierState, SizeBounds, TransparencyClassifier, Verdict,
};
pub use header::{ColorType, ImageHeader, PNG_SIGNATURE};
