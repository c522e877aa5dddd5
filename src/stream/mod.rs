//! Event-driven paired byte streams
//!
//! A paired stream is one readable and one writable byte stream co-managed
//! as a single resource. Transport events (readability, writability, end,
//! error) are injected at the raw TCP bottom of a layer stack; each layer
//! consumes the events of the layer it wraps and returns the events it
//! wants delivered to the layer above. Ownership runs strictly downward
//! (a TLS layer owns the stream it wraps), so no delegate back-references
//! exist to clear.

pub mod raw;
pub mod tls;

pub use raw::RawStream;
pub use tls::TlsLayer;

use crate::MAX_CHUNK_SIZE;
use bytes::BytesMut;
use std::io;
use thiserror::Error;

/// Stream-level errors carried inside events and completions
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("TLS handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Reading failed after {processed} bytes: {reason}")]
    ReadingFailed { reason: String, processed: usize },

    #[error("Writing failed after {processed} bytes: {reason}")]
    WritingFailed { reason: String, processed: usize },

    #[error("Closing failed: {reason}")]
    ClosingFailed { reason: String },
}

/// Events a layer reports to the layer above it
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream finished opening (for a TLS layer: handshake complete)
    OpenCompleted,
    /// Decrypted bytes are ready to read
    HasBytesAvailable,
    /// The stream can accept writes again
    HasSpaceAvailable,
    /// The peer ended the stream; remaining buffered bytes were already
    /// announced through `HasBytesAvailable`
    EndEncountered,
    /// A fatal stream error
    ErrorOccurred(StreamError),
}

/// Two co-owned unidirectional byte streams with event-driven scheduling.
///
/// `read` and `write` move up to the requested number of bytes and never
/// block: exhausted capacity surfaces as `WouldBlock`, end-of-stream as
/// `Ok(0)` on read.
pub trait PairedStream {
    /// Feed a transport event into this stream and collect the events to
    /// deliver to the layer above
    fn handle_event(&mut self, event: StreamEvent) -> Vec<StreamEvent>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Non-blocking probe: a read would move at least one byte
    fn has_bytes_available(&self) -> bool;

    /// Non-blocking probe: a write would be accepted
    fn has_space_available(&self) -> bool;

    /// Whether this stream (or anything it wraps) has output waiting for
    /// transport writability
    fn wants_write(&self) -> bool;

    /// Close, releasing the wrapped resources. Idempotent.
    fn close(&mut self);

    /// Drain everything currently readable, in chunks of at most 1 MiB,
    /// while bytes remain available and the last read filled its chunk.
    /// `None` when not a single byte moved.
    fn read_all(&mut self) -> Option<BytesMut> {
        let mut out = BytesMut::new();
        let mut chunk = vec![0u8; MAX_CHUNK_SIZE];
        while self.has_bytes_available() {
            match self.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Write until all bytes are accepted, space runs out, or a write
    /// makes no progress. Returns the number of bytes accepted.
    fn write_all(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while written < buf.len() {
            if !self.has_space_available() {
                break;
            }
            match self.write(&buf[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// One element of the layer stack: the raw transport or a TLS wrap of the
/// layer beneath it
pub enum Layer {
    Raw(RawStream),
    Tls(Box<TlsLayer>),
}

impl Layer {
    /// Number of layers in this stack, the raw transport included
    pub fn depth(&self) -> usize {
        match self {
            Layer::Raw(_) => 1,
            Layer::Tls(tls) => 1 + tls.inner().depth(),
        }
    }

    /// The TCP socket at the bottom of the stack
    pub fn raw_socket(&self) -> &tokio::net::TcpStream {
        match self {
            Layer::Raw(raw) => raw.socket(),
            Layer::Tls(tls) => tls.inner().raw_socket(),
        }
    }
}

impl PairedStream for Layer {
    fn handle_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        match self {
            Layer::Raw(raw) => raw.handle_event(event),
            Layer::Tls(tls) => tls.handle_event(event),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Layer::Raw(raw) => raw.read(buf),
            Layer::Tls(tls) => tls.read(buf),
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Layer::Raw(raw) => raw.write(buf),
            Layer::Tls(tls) => tls.write(buf),
        }
    }

    fn has_bytes_available(&self) -> bool {
        match self {
            Layer::Raw(raw) => raw.has_bytes_available(),
            Layer::Tls(tls) => tls.has_bytes_available(),
        }
    }

    fn has_space_available(&self) -> bool {
        match self {
            Layer::Raw(raw) => raw.has_space_available(),
            Layer::Tls(tls) => tls.has_space_available(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            Layer::Raw(raw) => raw.wants_write(),
            Layer::Tls(tls) => tls.wants_write(),
        }
    }

    fn close(&mut self) {
        match self {
            Layer::Raw(raw) => raw.close(),
            Layer::Tls(tls) => tls.close(),
        }
    }
}
