//! Byte sources for remote images.
//!
//! A source opens a URL and hands back a [`ByteStream`] that yields the body
//! incrementally. Dropping the stream closes the underlying connection, which
//! is how the classifier stops a download early once it has a verdict.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SourceError;

/// An open response body, read slice by slice.
#[async_trait]
pub trait ByteStream: Send {
    /// Next slice of the body, or `None` once the body is exhausted.
    async fn next_bytes(&mut self) -> Result<Option<Vec<u8>>, SourceError>;
}

/// Opens URLs as byte streams.
///
/// Uses `async_trait` so the scheduler can hold an `Arc<dyn ImageSource>`.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, SourceError>;
}

/// HTTP(S) source backed by a shared `reqwest` client.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new(user_agent: &str, connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageSource for HttpSource {
    async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, SourceError> {
        let response = self.client.get(url).send().await.map_err(source_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::Status(status.as_u16()));
        }
        Ok(Box::new(HttpStream { response }))
    }
}

struct HttpStream {
    response: reqwest::Response,
}

#[async_trait]
impl ByteStream for HttpStream {
    async fn next_bytes(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        match self.response.chunk().await {
            Ok(chunk) => Ok(chunk.map(|bytes| bytes.to_vec())),
            Err(e) => Err(source_error(e)),
        }
    }
}

fn source_error(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else if let Some(status) = err.status() {
        SourceError::Status(status.as_u16())
    } else {
        SourceError::Connection(err.to_string())
    }
}

/// What a [`MemorySource`] serves for one open of a URL.
#[derive(Debug, Clone)]
pub enum CannedResponse {
    /// A 2xx response with this body
    Body(Vec<u8>),
    /// A non-2xx response
    Status(u16),
    /// The connection fails before any response
    ConnectionFailure,
    /// The body never produces a byte
    Stall,
    /// The open call panics
    Panic,
}

/// Counters shared between a [`MemorySource`] and the streams it opens.
#[derive(Debug, Default)]
pub struct SourceStats {
    opens: AtomicU64,
    bytes_delivered: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SourceStats {
    /// Total calls to `open`.
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Body bytes handed out across all streams.
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered.load(Ordering::SeqCst)
    }

    /// Opens and streams currently alive.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// High-water mark of [`in_flight`](Self::in_flight).
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<SourceStats>);

impl InFlight {
    fn enter(stats: &Arc<SourceStats>) -> Self {
        let now = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(stats.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory source serving canned responses, for tests and benchmarks.
///
/// Responses queued for a URL are served in order; the last one repeats.
/// Unknown URLs answer 404.
pub struct MemorySource {
    responses: Mutex<HashMap<String, VecDeque<CannedResponse>>>,
    slice_size: usize,
    open_delay: Duration,
    slice_delay: Duration,
    stats: Arc<SourceStats>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            slice_size: 4096,
            open_delay: Duration::ZERO,
            slice_delay: Duration::ZERO,
            stats: Arc::new(SourceStats::default()),
        }
    }

    /// Bytes per `next_bytes` slice.
    pub fn with_slice_size(mut self, slice_size: usize) -> Self {
        self.slice_size = slice_size.max(1);
        self
    }

    /// Latency before each open resolves.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Latency before each body slice.
    pub fn with_slice_delay(mut self, delay: Duration) -> Self {
        self.slice_delay = delay;
        self
    }

    /// Queue a response for `url`.
    pub fn respond(&self, url: impl Into<String>, response: CannedResponse) {
        self.responses
            .lock()
            .entry(url.into())
            .or_default()
            .push_back(response);
    }

    pub fn insert_body(&self, url: impl Into<String>, body: Vec<u8>) {
        self.respond(url, CannedResponse::Body(body));
    }

    pub fn stats(&self) -> Arc<SourceStats> {
        self.stats.clone()
    }

    fn next_response(&self, url: &str) -> CannedResponse {
        let mut responses = self.responses.lock();
        match responses.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or(CannedResponse::Status(404))
    }
}

#[async_trait]
impl ImageSource for MemorySource {
    async fn open(&self, url: &str) -> Result<Box<dyn ByteStream>, SourceError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        let guard = InFlight::enter(&self.stats);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        match self.next_response(url) {
            CannedResponse::Body(body) => Ok(Box::new(MemoryStream {
                body,
                pos: 0,
                slice_size: self.slice_size,
                slice_delay: self.slice_delay,
                stalled: false,
                stats: self.stats.clone(),
                _guard: guard,
            })),
            CannedResponse::Stall => Ok(Box::new(MemoryStream {
                body: Vec::new(),
                pos: 0,
                slice_size: self.slice_size,
                slice_delay: self.slice_delay,
                stalled: true,
                stats: self.stats.clone(),
                _guard: guard,
            })),
            CannedResponse::Status(code) => Err(SourceError::Status(code)),
            CannedResponse::ConnectionFailure => {
                Err(SourceError::Connection("connection refused".to_string()))
            }
            CannedResponse::Panic => panic!("canned panic opening {url}"),
        }
    }
}

struct MemoryStream {
    body: Vec<u8>,
    pos: usize,
    slice_size: usize,
    slice_delay: Duration,
    stalled: bool,
    stats: Arc<SourceStats>,
    _guard: InFlight,
}

#[async_trait]
impl ByteStream for MemoryStream {
    async fn next_bytes(&mut self) -> Result<Option<Vec<u8>>, SourceError> {
        if self.stalled {
            std::future::pending::<()>().await;
        }
        if !self.slice_delay.is_zero() {
            tokio::time::sleep(self.slice_delay).await;
        }
        if self.pos >= self.body.len() {
            return Ok(None);
        }
        let end = (self.pos + self.slice_size).min(self.body.len());
        let slice = self.body[self.pos..end].to_vec();
        self.pos = end;
        self.stats
            .bytes_delivered
            .fetch_add(slice.len() as u64, Ordering::SeqCst);
        Ok(Some(slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(mut stream: Box<dyn ByteStream>) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(bytes) = stream.next_bytes().await.unwrap() {
            out.extend_from_slice(&bytes);
        }
        out
    }

    #[tokio::test]
    async fn test_memory_source_serves_body_in_slices() {
        let source = MemorySource::new().with_slice_size(3);
        source.insert_body("a", b"abcdefgh".to_vec());

        let mut stream = source.open("a").await.unwrap();
        assert_eq!(stream.next_bytes().await.unwrap(), Some(b"abc".to_vec()));
        assert_eq!(source.stats().bytes_delivered(), 3);
        assert_eq!(source.stats().in_flight(), 1);
        drop(stream);
        assert_eq!(source.stats().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_memory_source_unknown_url_is_404() {
        let source = MemorySource::new();
        let err = source.open("missing").await.err().unwrap();
        assert_eq!(err, SourceError::Status(404));
        assert_eq!(source.stats().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_memory_source_queued_responses_then_repeat() {
        let source = MemorySource::new();
        source.respond("u", CannedResponse::ConnectionFailure);
        source.insert_body("u", b"ok".to_vec());

        assert!(matches!(
            source.open("u").await.err(),
            Some(SourceError::Connection(_))
        ));
        assert_eq!(drain(source.open("u").await.unwrap()).await, b"ok");
        assert_eq!(drain(source.open("u").await.unwrap()).await, b"ok");
        assert_eq!(source.stats().opens(), 3);
    }
}
