//! Leaf certificate pinning
//!
//! A pin table maps an expected host to the DER encoding of the leaf
//! certificate it must present. Trust evaluation runs the normal WebPKI
//! checks first; only a chain that passes them *and* whose leaf is
//! byte-identical to the pinned one is accepted. Hosts without a pin fall
//! back to plain WebPKI evaluation.
//!
//! The table is immutable once built and shared read-only across layers.

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, SignatureScheme};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Host → pinned leaf certificate (DER)
#[derive(Debug, Clone, Default)]
pub struct PinStore {
    pins: HashMap<String, CertificateDer<'static>>,
}

impl PinStore {
    /// An empty table: every host uses platform defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a leaf for a host. Host matching is case-insensitive.
    pub fn insert(&mut self, host: impl Into<String>, leaf: CertificateDer<'static>) {
        self.pins.insert(host.into().to_ascii_lowercase(), leaf);
    }

    /// The pinned leaf for a host, if any
    pub fn pinned_for(&self, host: &str) -> Option<&CertificateDer<'static>> {
        self.pins.get(&host.to_ascii_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pins.len()
    }
}

/// WebPKI evaluation first, then a byte-for-byte leaf comparison
pub struct PinnedServerVerifier {
    webpki: Arc<WebPkiServerVerifier>,
    pinned: CertificateDer<'static>,
}

impl PinnedServerVerifier {
    pub fn new(webpki: Arc<WebPkiServerVerifier>, pinned: CertificateDer<'static>) -> Self {
        Self { webpki, pinned }
    }
}

impl fmt::Debug for PinnedServerVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinnedServerVerifier")
            .field("pinned_len", &self.pinned.as_ref().len())
            .finish()
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        self.webpki
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;

        if end_entity.as_ref() != self.pinned.as_ref() {
            warn!("presented leaf for {:?} does not match the pinned one", server_name);
            return Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ));
        }

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn der(bytes: &[u8]) -> CertificateDer<'static> {
        CertificateDer::from(bytes.to_vec())
    }

    #[test]
    fn test_pin_lookup_is_case_insensitive() {
        let mut store = PinStore::new();
        store.insert("Proxy.Example", der(b"leaf-bytes"));

        assert!(store.pinned_for("proxy.example").is_some());
        assert!(store.pinned_for("PROXY.EXAMPLE").is_some());
        assert!(store.pinned_for("other.example").is_none());
    }

    #[test]
    fn test_empty_store() {
        let store = PinStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        assert!(store.pinned_for("example.com").is_none());
    }
}
