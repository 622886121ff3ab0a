//! Line source abstraction for detector data ingestion.
//!
//! Provides a unified trait for reading raw detector lines from different
//! sources: a recorded file (replay), stdin (piped serial output), and TCP
//! (serial-to-network bridge). Parsing happens downstream in the ingest task.

use crate::config::defaults::{
    TCP_CONNECT_TIMEOUT_SECS, TCP_INITIAL_RECONNECT_DELAY_SECS, TCP_MAX_RECONNECT_DELAY_SECS,
    TCP_STALE_CONNECTION_SECS,
};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tracing::{info, warn};

/// Events produced by a line source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// One raw line, without the trailing newline.
    Line(String),
    /// Source reached end of data.
    Eof,
}

/// Source errors
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("cannot open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read error on {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Trait abstracting where detector lines come from.
///
/// Implementations handle pacing and reconnection internally. The ingest
/// task calls [`next_line`](EventSource::next_line) in a `select!` with
/// cancellation; a cancelled read loses at most the partial line.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Read the next raw line.
    ///
    /// Returns `SourceEvent::Eof` when no more data is available and `Err`
    /// on unrecoverable errors.
    async fn next_line(&mut self) -> Result<SourceEvent, SourceError>;

    /// Human-readable name for logging (e.g. "file", "stdin", "tcp").
    fn source_name(&self) -> &str;
}

// ============================================================================
// Reader Source (file replay / stdin)
// ============================================================================

/// Reads lines from any buffered async reader, optionally pacing them.
pub struct ReaderSource<R> {
    reader: R,
    name: String,
    delay: Duration,
    yielded_first: bool,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin + Send + 'static> ReaderSource<R> {
    pub fn new(reader: R, name: impl Into<String>, delay: Duration) -> Self {
        Self {
            reader,
            name: name.into(),
            delay,
            yielded_first: false,
            buf: Vec::with_capacity(256),
        }
    }
}

impl ReaderSource<BufReader<tokio::io::Stdin>> {
    /// Lines piped in from the detector's serial port,
    /// e.g. `cat /dev/ttyUSB0 | muon-watch --stdin`.
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin", Duration::ZERO)
    }
}

impl ReaderSource<BufReader<tokio::fs::File>> {
    /// Replay a recorded detector log with `delay` between lines.
    pub async fn open_file(path: &Path, delay: Duration) -> Result<Self, SourceError> {
        let file = tokio::fs::File::open(path).await.map_err(|e| SourceError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(Self::new(BufReader::new(file), "file", delay))
    }
}

/// Per-line delay for a replay speed multiplier (0 = no delay).
pub fn replay_delay(base_delay_ms: u64, speed: u64) -> Duration {
    if speed == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(base_delay_ms / speed)
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send + 'static> EventSource for ReaderSource<R> {
    async fn next_line(&mut self) -> Result<SourceEvent, SourceError> {
        if self.yielded_first && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.buf.clear();
        let bytes = self
            .reader
            .read_until(b'\n', &mut self.buf)
            .await
            .map_err(|e| SourceError::Read {
                name: self.name.clone(),
                source: e,
            })?;
        if bytes == 0 {
            return Ok(SourceEvent::Eof);
        }

        self.yielded_first = true;
        let line = String::from_utf8_lossy(&self.buf);
        Ok(SourceEvent::Line(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn source_name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// TCP Source (serial-to-network bridge)
// ============================================================================

/// Reads detector lines from a TCP connection.
///
/// A dropped or silent connection is re-established with exponential
/// backoff, indefinitely; ingestion simply pauses until the detector is
/// back. The parser and ring buffer are not reset across reconnects.
pub struct TcpSource {
    address: String,
    stream: Option<BufReader<TcpStream>>,
    reconnect_attempts: u32,
    reconnections: u64,
    stale_after: Duration,
    buf: Vec<u8>,
}

impl TcpSource {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            stream: None,
            reconnect_attempts: 0,
            reconnections: 0,
            stale_after: Duration::from_secs(TCP_STALE_CONNECTION_SECS),
            buf: Vec::with_capacity(256),
        }
    }

    /// Override the silence threshold after which the connection is dropped.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    async fn connect_once(&self) -> std::io::Result<TcpStream> {
        let connect_timeout = Duration::from_secs(TCP_CONNECT_TIMEOUT_SECS);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&self.address))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

        // Enable TCP keepalive to detect dead connections
        let sock_ref = socket2::SockRef::from(&stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        let _ = sock_ref.set_tcp_keepalive(&keepalive);

        Ok(stream)
    }

    /// Connect, retrying with a capped doubling delay until it succeeds.
    async fn ensure_connected(&mut self) {
        while self.stream.is_none() {
            if self.reconnect_attempts > 0 {
                let exponent = (self.reconnect_attempts - 1).min(16);
                let delay_secs = TCP_INITIAL_RECONNECT_DELAY_SECS
                    .saturating_mul(1u64 << exponent)
                    .min(TCP_MAX_RECONNECT_DELAY_SECS);
                warn!(
                    address = %self.address,
                    attempt = self.reconnect_attempts,
                    delay_secs,
                    "Detector connection lost, reconnecting"
                );
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            }

            match self.connect_once().await {
                Ok(stream) => {
                    if self.reconnect_attempts > 0 {
                        self.reconnections += 1;
                        info!(
                            address = %self.address,
                            total_reconnections = self.reconnections,
                            "Detector reconnected"
                        );
                    } else {
                        info!(address = %self.address, "Detector connection established");
                    }
                    self.stream = Some(BufReader::new(stream));
                    self.reconnect_attempts = 0;
                }
                Err(e) => {
                    self.reconnect_attempts = self.reconnect_attempts.saturating_add(1);
                    warn!(address = %self.address, error = %e, "Detector connection failed");
                }
            }
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        warn!(address = %self.address, reason, "Dropping detector connection");
        self.stream = None;
        self.reconnect_attempts = 1;
    }
}

#[async_trait]
impl EventSource for TcpSource {
    async fn next_line(&mut self) -> Result<SourceEvent, SourceError> {
        loop {
            self.ensure_connected().await;
            let Some(reader) = self.stream.as_mut() else {
                continue;
            };

            self.buf.clear();
            match tokio::time::timeout(self.stale_after, reader.read_until(b'\n', &mut self.buf)).await {
                Ok(Ok(0)) => self.drop_connection("closed by peer"),
                Ok(Ok(_)) => {
                    let line = String::from_utf8_lossy(&self.buf);
                    return Ok(SourceEvent::Line(line.trim_end_matches(['\r', '\n']).to_string()));
                }
                Ok(Err(e)) => self.drop_connection(&e.to_string()),
                Err(_) => self.drop_connection("no data before stale timeout"),
            }
        }
    }

    fn source_name(&self) -> &str {
        "tcp"
    }
}
