//! TLS layer over a paired stream
//!
//! One client-side TLS session per layer. The session reads and writes its
//! ciphertext through the wrapped [`Layer`] instead of a socket, so layers
//! nest: the ciphertext of layer *k* is the plaintext of layer *k-1*.
//! Built on rustls's buffered connection API
//! (`read_tls`/`write_tls`/`process_new_packets`).
//!
//! Two documented pitfalls of this construction are handled explicitly:
//!
//! - **Half-close drain**: once any peer-close condition is observed, the
//!   layer serves only the plaintext rustls still holds (its pending-bytes
//!   counter) and never consults the wrapped stream again, so a half-closed
//!   peer cannot spin the read loop.
//! - **Write back-pressure**: submitted plaintext lands in an explicit
//!   output buffer that is flushed on every space event; a would-block from
//!   below pauses the flush instead of busy-looping zero-byte writes.

use super::{Layer, PairedStream, StreamError, StreamEvent};
use crate::pinning::{PinStore, PinnedServerVerifier};
use crate::MAX_CHUNK_SIZE;
use bytes::{Buf, BytesMut};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::ring as ring_provider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};
use std::io::{self, Read, Write};
use std::sync::Arc;
use tracing::{debug, trace};

/// Shared TLS material for every layer of a connection: trust roots and
/// the pinned-leaf table
#[derive(Clone)]
pub struct TlsSettings {
    roots: Arc<RootCertStore>,
    pins: Arc<PinStore>,
}

impl TlsSettings {
    /// Settings backed by the bundled WebPKI roots
    pub fn new(pins: PinStore) -> Self {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Self {
            roots: Arc::new(roots),
            pins: Arc::new(pins),
        }
    }

    /// Settings with a caller-provided root store
    pub fn with_roots(roots: RootCertStore, pins: PinStore) -> Self {
        Self {
            roots: Arc::new(roots),
            pins: Arc::new(pins),
        }
    }

    /// Build the client configuration for one expected host. Hosts with a
    /// pinned leaf get the pinning verifier; everything else uses plain
    /// WebPKI evaluation against the root store.
    pub fn client_config(&self, host: &str) -> Result<Arc<ClientConfig>, StreamError> {
        let provider = Arc::new(ring_provider::default_provider());

        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| StreamError::HandshakeFailed {
                reason: format!("protocol configuration: {}", e),
            })?;

        let mut config = match self.pins.pinned_for(bare_host(host)) {
            Some(pinned) => {
                let webpki =
                    WebPkiServerVerifier::builder_with_provider(self.roots.clone(), provider)
                        .build()
                        .map_err(|e| StreamError::HandshakeFailed {
                            reason: format!("trust configuration: {}", e),
                        })?;
                let verifier = PinnedServerVerifier::new(webpki, pinned.clone());
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier))
                    .with_no_client_auth()
            }
            None => builder
                .with_root_certificates(self.roots.clone())
                .with_no_client_auth(),
        };

        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

/// `idle → handshake → connected → {closed | aborted}`, driven purely by
/// events from the wrapped stream
pub struct TlsLayer {
    session: ClientConnection,
    inner: Layer,
    host: String,
    /// Decrypted plaintext waiting for the layer above
    in_buf: BytesMut,
    /// Plaintext submitted from above, not yet handed to the session
    out_buf: BytesMut,
    /// Plaintext bytes accepted into the session so far
    wrote: usize,
    peer_closed: bool,
    end_emitted: bool,
    open_emitted: bool,
    failed: bool,
    closed: bool,
}

impl TlsLayer {
    /// Create a session for `host` over `inner`. SNI is the host with any
    /// IPv6 brackets stripped.
    pub fn new(config: Arc<ClientConfig>, host: &str, inner: Layer) -> Result<Self, StreamError> {
        let name = ServerName::try_from(bare_host(host).to_string()).map_err(|e| {
            StreamError::HandshakeFailed {
                reason: format!("invalid server name {}: {}", host, e),
            }
        })?;
        let session =
            ClientConnection::new(config, name).map_err(|e| StreamError::HandshakeFailed {
                reason: e.to_string(),
            })?;

        debug!("tls layer created for {}", host);

        Ok(Self {
            session,
            inner,
            host: host.to_string(),
            in_buf: BytesMut::new(),
            out_buf: BytesMut::new(),
            wrote: 0,
            peer_closed: false,
            end_emitted: false,
            open_emitted: false,
            failed: false,
            closed: false,
        })
    }

    /// The layer this session encrypts into
    pub fn inner(&self) -> &Layer {
        &self.inner
    }

    /// Process one event already translated by the wrapped stream
    fn process_inner_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        // An interrupted session ignores further triggers
        if self.failed || self.closed {
            return Vec::new();
        }
        match event {
            StreamEvent::HasBytesAvailable => self.advance(true),
            StreamEvent::OpenCompleted | StreamEvent::HasSpaceAvailable => self.advance(false),
            StreamEvent::EndEncountered => self.on_inner_end(),
            StreamEvent::ErrorOccurred(error) => {
                self.failed = true;
                vec![StreamEvent::ErrorOccurred(error)]
            }
        }
    }

    /// Drive the session as far as the wrapped stream allows and collect
    /// the resulting events for the layer above
    fn advance(&mut self, readable: bool) -> Vec<StreamEvent> {
        let was_handshaking = self.session.is_handshaking();
        let mut events = Vec::new();

        let gained = if readable {
            match self.pump_read() {
                Ok(gained) => gained,
                Err(error) => return self.fail(error),
            }
        } else {
            false
        };

        if let Err(error) = self.pump_write() {
            return self.fail(error);
        }

        if self.peer_closed && self.session.is_handshaking() {
            return self.fail(StreamError::HandshakeFailed {
                reason: "connection closed during handshake".into(),
            });
        }

        if was_handshaking && !self.session.is_handshaking() {
            debug!("tls handshake complete for {}", self.host);
            if !self.open_emitted {
                self.open_emitted = true;
                events.push(StreamEvent::OpenCompleted);
            }
            // Plaintext queued before completion can flow now
            if let Err(error) = self.pump_write() {
                return self.fail(error);
            }
        }

        if gained {
            trace!(
                "tls layer for {} buffered {} plaintext bytes",
                self.host,
                self.in_buf.len()
            );
            events.push(StreamEvent::HasBytesAvailable);
        }

        if self.peer_closed && !self.end_emitted {
            self.end_emitted = true;
            events.push(StreamEvent::EndEncountered);
        }

        if !readable
            && !self.session.is_handshaking()
            && self.out_buf.is_empty()
            && !self.session.wants_write()
            && self.inner.has_space_available()
        {
            events.push(StreamEvent::HasSpaceAvailable);
        }

        events
    }

    /// Pull ciphertext from the wrapped stream and decrypt. After a peer
    /// close only the session's own pending plaintext is served.
    fn pump_read(&mut self) -> Result<bool, StreamError> {
        let mut gained = false;

        while !self.peer_closed {
            let read = match self.session.read_tls(&mut InnerRead(&mut self.inner)) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    return Err(StreamError::ReadingFailed {
                        reason: e.to_string(),
                        processed: self.in_buf.len(),
                    })
                }
            };
            if read == 0 {
                self.peer_closed = true;
            }
            gained |= self.drain_plaintext()?;
        }

        if self.peer_closed {
            gained |= self.drain_plaintext()?;
        }

        Ok(gained)
    }

    /// Process buffered records and move all pending plaintext into
    /// `in_buf`, at most 1 MiB per read
    fn drain_plaintext(&mut self) -> Result<bool, StreamError> {
        let state = self
            .session
            .process_new_packets()
            .map_err(|e| self.classify(e))?;
        if state.peer_has_closed() {
            self.peer_closed = true;
        }

        let mut pending = state.plaintext_bytes_to_read();
        let mut gained = false;
        while pending > 0 {
            let take = pending.min(MAX_CHUNK_SIZE);
            let mut chunk = vec![0u8; take];
            let n = self
                .session
                .reader()
                .read(&mut chunk)
                .map_err(|e| StreamError::ReadingFailed {
                    reason: e.to_string(),
                    processed: self.in_buf.len(),
                })?;
            if n == 0 {
                break;
            }
            self.in_buf.extend_from_slice(&chunk[..n]);
            pending -= n;
            gained = true;
        }

        Ok(gained)
    }

    /// Flush: move buffered plaintext into the session and the session's
    /// records into the wrapped stream, until a would-block boundary
    fn pump_write(&mut self) -> Result<(), StreamError> {
        loop {
            if self.session.wants_write() {
                match self.session.write_tls(&mut InnerWrite(&mut self.inner)) {
                    Ok(0) => return Ok(()),
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => {
                        return Err(StreamError::WritingFailed {
                            reason: e.to_string(),
                            processed: self.wrote,
                        })
                    }
                }
            }

            if self.out_buf.is_empty() || self.session.is_handshaking() {
                return Ok(());
            }

            let take = self.out_buf.len().min(MAX_CHUNK_SIZE);
            let n = self
                .session
                .writer()
                .write(&self.out_buf[..take])
                .map_err(|e| StreamError::WritingFailed {
                    reason: e.to_string(),
                    processed: self.wrote,
                })?;
            if n == 0 {
                return Ok(());
            }
            self.wrote += n;
            self.out_buf.advance(n);
        }
    }

    /// The wrapped stream ended
    fn on_inner_end(&mut self) -> Vec<StreamEvent> {
        if self.session.is_handshaking() {
            return self.fail(StreamError::HandshakeFailed {
                reason: "connection closed during handshake".into(),
            });
        }

        self.peer_closed = true;
        let mut events = Vec::new();
        match self.drain_plaintext() {
            Ok(true) => events.push(StreamEvent::HasBytesAvailable),
            Ok(false) => {}
            Err(error) => return self.fail(error),
        }
        if !self.end_emitted {
            self.end_emitted = true;
            events.push(StreamEvent::EndEncountered);
        }
        events
    }

    fn fail(&mut self, error: StreamError) -> Vec<StreamEvent> {
        self.failed = true;
        // Best effort: let a queued alert reach the peer
        let _ = self.session.write_tls(&mut InnerWrite(&mut self.inner));
        vec![StreamEvent::ErrorOccurred(error)]
    }

    /// Map a rustls processing error by session phase
    fn classify(&self, error: rustls::Error) -> StreamError {
        if self.session.is_handshaking() {
            StreamError::HandshakeFailed {
                reason: error.to_string(),
            }
        } else {
            StreamError::ReadingFailed {
                reason: error.to_string(),
                processed: self.in_buf.len(),
            }
        }
    }
}

impl PairedStream for TlsLayer {
    fn handle_event(&mut self, event: StreamEvent) -> Vec<StreamEvent> {
        let inner_events = self.inner.handle_event(event);
        let mut out = Vec::new();
        for inner_event in inner_events {
            out.extend(self.process_inner_event(inner_event));
        }
        out
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.in_buf.is_empty() {
            if self.peer_closed {
                return Ok(0);
            }
            return Err(io::Error::new(io::ErrorKind::WouldBlock, "no plaintext"));
        }
        let n = buf.len().min(self.in_buf.len());
        buf[..n].copy_from_slice(&self.in_buf[..n]);
        self.in_buf.advance(n);
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed || self.failed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls layer closed"));
        }
        self.out_buf.extend_from_slice(buf);
        match self.pump_write() {
            Ok(()) => Ok(buf.len()),
            Err(error) => {
                self.failed = true;
                Err(io::Error::new(io::ErrorKind::Other, error.to_string()))
            }
        }
    }

    fn has_bytes_available(&self) -> bool {
        !self.in_buf.is_empty()
    }

    fn has_space_available(&self) -> bool {
        !self.closed
            && !self.failed
            && !self.session.is_handshaking()
            && self.out_buf.is_empty()
            && self.inner.has_space_available()
    }

    fn wants_write(&self) -> bool {
        self.session.wants_write() || !self.out_buf.is_empty() || self.inner.wants_write()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.failed && !self.peer_closed {
            // A peer that never answers the close-notify is acceptable
            self.session.send_close_notify();
            let _ = self.pump_write();
        }
        self.inner.close();
        debug!("tls layer for {} closed", self.host);
    }
}

/// Strip IPv6 brackets for SNI and pin lookups
fn bare_host(host: &str) -> &str {
    if host.starts_with('[') && host.ends_with(']') {
        &host[1..host.len() - 1]
    } else {
        host
    }
}

struct InnerRead<'a>(&'a mut Layer);

impl Read for InnerRead<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

struct InnerWrite<'a>(&'a mut Layer);

impl Write for InnerWrite<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_host() {
        assert_eq!(bare_host("example.com"), "example.com");
        assert_eq!(bare_host("[::1]"), "::1");
        assert_eq!(bare_host("[2001:db8::1]"), "2001:db8::1");
    }

    #[test]
    fn test_client_config_for_unpinned_host() {
        let settings = TlsSettings::new(PinStore::new());
        let config = settings.client_config("example.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }
}
