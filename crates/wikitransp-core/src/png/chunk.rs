//! Incremental PNG chunk framing over a [`ByteStream`].
//!
//! Non-IDAT chunks are buffered whole and surfaced as [`ChunkEvent::Chunk`].
//! IDAT payloads are surfaced as they arrive, in [`ChunkEvent::Data`] slices,
//! so the classifier can reach a verdict before the chunk is complete.

use std::fmt;

use crate::error::ChunkError;
use crate::png::header::PNG_SIGNATURE;
use crate::source::ByteStream;

/// Largest chunk length the format permits.
const MAX_CHUNK_LENGTH: u32 = i32::MAX as u32;

/// A four-letter chunk type tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkType(pub [u8; 4]);

impl ChunkType {
    pub const IHDR: Self = Self(*b"IHDR");
    pub const TRNS: Self = Self(*b"tRNS");
    pub const IDAT: Self = Self(*b"IDAT");
    pub const IEND: Self = Self(*b"IEND");

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("????")
    }

    fn is_valid(&self) -> bool {
        self.0.iter().all(u8::is_ascii_alphabetic)
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkType({})", self.as_str())
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully buffered chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PngChunk {
    pub kind: ChunkType,
    pub payload: Vec<u8>,
    pub crc: u32,
    /// Whether `crc` matched the type and payload (always true when unchecked)
    pub crc_ok: bool,
}

/// One step of the chunk stream.
#[derive(Debug, PartialEq, Eq)]
pub enum ChunkEvent<'a> {
    Chunk(PngChunk),
    /// A slice of an IDAT payload. Zero-length IDAT chunks yield one empty slice.
    Data {
        chunk_length: u32,
        bytes: &'a [u8],
    },
    /// IEND has been read; nothing follows.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Signature,
    Boundary,
    Data { length: u32, remaining: u32, announced: bool },
    Done,
}

/// Streaming chunk parser.
pub struct ChunkReader {
    stream: Box<dyn ByteStream>,
    buf: Vec<u8>,
    pos: usize,
    /// Bytes consumed by the parser
    offset: u64,
    /// Bytes pulled from the stream
    received: u64,
    state: ReadState,
    data_crc: crc32fast::Hasher,
    verify_crc: bool,
    max_slice: usize,
    crc_mismatches: u32,
}

impl ChunkReader {
    /// `max_slice` caps the size of each [`ChunkEvent::Data`] slice.
    pub fn new(stream: Box<dyn ByteStream>, verify_crc: bool, max_slice: usize) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            pos: 0,
            offset: 0,
            received: 0,
            state: ReadState::Signature,
            data_crc: crc32fast::Hasher::new(),
            verify_crc,
            max_slice: max_slice.max(1),
            crc_mismatches: 0,
        }
    }

    /// Bytes of the body parsed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn crc_mismatches(&self) -> u32 {
        self.crc_mismatches
    }

    /// Stop reading and release the stream. Returns the bytes received.
    pub fn abandon(self) -> u64 {
        tracing::trace!(
            offset = self.offset,
            received = self.received,
            "Abandoning image stream"
        );
        self.received
    }

    fn available(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Ensure at least `n` unconsumed bytes are buffered.
    async fn fill(&mut self, n: usize) -> Result<(), ChunkError> {
        while self.available() < n {
            if self.pos > 0 {
                self.buf.drain(..self.pos);
                self.pos = 0;
            }
            match self.stream.next_bytes().await? {
                Some(bytes) => {
                    self.received += bytes.len() as u64;
                    self.buf.extend_from_slice(&bytes);
                }
                None => {
                    return Err(ChunkError::Truncated {
                        offset: self.offset + self.available() as u64,
                        needed: n - self.available(),
                    })
                }
            }
        }
        Ok(())
    }

    fn consume(&mut self, n: usize) -> std::ops::Range<usize> {
        let start = self.pos;
        self.pos += n;
        self.offset += n as u64;
        start..self.pos
    }

    fn read_u32(&mut self) -> u32 {
        let range = self.consume(4);
        let b = &self.buf[range];
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn malformed(&self, message: impl Into<String>) -> ChunkError {
        ChunkError::Malformed {
            offset: self.offset,
            message: message.into(),
        }
    }

    fn note_crc(&mut self, kind: ChunkType, expected: u32, actual: u32) -> bool {
        if !self.verify_crc || expected == actual {
            return true;
        }
        self.crc_mismatches += 1;
        tracing::warn!(
            chunk = %kind,
            offset = self.offset,
            expected = format_args!("{expected:08x}"),
            actual = format_args!("{actual:08x}"),
            "Chunk CRC mismatch"
        );
        false
    }

    /// Advance to the next event.
    pub async fn next_event(&mut self) -> Result<ChunkEvent<'_>, ChunkError> {
        loop {
            match self.state {
                ReadState::Signature => {
                    if let Err(err) = self.fill(PNG_SIGNATURE.len()).await {
                        let got = &self.buf[self.pos..];
                        return Err(match err {
                            ChunkError::Truncated { .. }
                                if got.is_empty() || !PNG_SIGNATURE.starts_with(got) =>
                            {
                                ChunkError::NotPng
                            }
                            other => other,
                        });
                    }
                    let range = self.consume(PNG_SIGNATURE.len());
                    if self.buf[range] != PNG_SIGNATURE {
                        return Err(ChunkError::NotPng);
                    }
                    self.state = ReadState::Boundary;
                }
                ReadState::Boundary => {
                    self.fill(8).await?;
                    let length = self.read_u32();
                    let range = self.consume(4);
                    let kind = ChunkType([
                        self.buf[range.start],
                        self.buf[range.start + 1],
                        self.buf[range.start + 2],
                        self.buf[range.start + 3],
                    ]);
                    if length > MAX_CHUNK_LENGTH {
                        return Err(self.malformed(format!("chunk length {length} too large")));
                    }
                    if !kind.is_valid() {
                        return Err(self.malformed(format!("invalid chunk type {:?}", kind.0)));
                    }

                    if kind == ChunkType::IDAT {
                        self.data_crc = crc32fast::Hasher::new();
                        self.data_crc.update(&kind.0);
                        self.state = ReadState::Data {
                            length,
                            remaining: length,
                            announced: false,
                        };
                        continue;
                    }

                    self.fill(length as usize + 4).await?;
                    let range = self.consume(length as usize);
                    let payload = self.buf[range].to_vec();
                    let crc = self.read_u32();
                    let mut hasher = crc32fast::Hasher::new();
                    hasher.update(&kind.0);
                    hasher.update(&payload);
                    let crc_ok = self.note_crc(kind, crc, hasher.finalize());

                    if kind == ChunkType::IEND {
                        self.state = ReadState::Done;
                    }
                    return Ok(ChunkEvent::Chunk(PngChunk {
                        kind,
                        payload,
                        crc,
                        crc_ok,
                    }));
                }
                ReadState::Data {
                    length,
                    remaining,
                    announced,
                } => {
                    if remaining == 0 {
                        self.fill(4).await?;
                        let crc = self.read_u32();
                        let actual = std::mem::take(&mut self.data_crc).finalize();
                        self.note_crc(ChunkType::IDAT, crc, actual);
                        self.state = ReadState::Boundary;
                        if !announced {
                            return Ok(ChunkEvent::Data {
                                chunk_length: length,
                                bytes: &[],
                            });
                        }
                        continue;
                    }
                    if self.available() == 0 {
                        self.fill(1).await?;
                    }
                    let n = self
                        .available()
                        .min(remaining as usize)
                        .min(self.max_slice);
                    let range = self.consume(n);
                    self.data_crc.update(&self.buf[range.clone()]);
                    self.state = ReadState::Data {
                        length,
                        remaining: remaining - n as u32,
                        announced: true,
                    };
                    return Ok(ChunkEvent::Data {
                        chunk_length: length,
                        bytes: &self.buf[range],
                    });
                }
                ReadState::Done => return Ok(ChunkEvent::End),
            }
        }
    }
}
