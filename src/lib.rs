//! # Nested Tunnel
//!
//! A client library that issues HTTPS requests through a chain of HTTPS
//! forward proxies, where every hop is individually TLS-encrypted and the
//! link to hop *k* is tunneled inside the TLS session of hop *k-1*.
//!
//! ## Features
//!
//! - **Layered CONNECT tunnels**: one `CONNECT host:port` per intermediate
//!   hop, each answered inside the previous hop's TLS session
//! - **TLS-in-TLS record processing** built on rustls's buffered connection
//!   API, so layer *k* encrypts into layer *k-1* instead of a socket
//! - **Synthetic URL schemes** (`httpss`, `httpsss`, `httpssss`) encoding
//!   the proxy-chain length in the number of trailing `s` characters
//! - **Leaf certificate pinning** per expected host, on top of normal
//!   WebPKI evaluation
//! - **Single-threaded cooperative core** driven by socket readability and
//!   writability events
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Request-issue API                    │
//! │            (issue request → response)                │
//! ├─────────────────────────────────────────────────────┤
//! │                Tunnel Orchestrator                   │
//! │      (CONNECT per hop, layer growth, 5-state FSM)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   TLS Layers                         │
//! │   (one client session per hop, nested encryption)    │
//! ├─────────────────────────────────────────────────────┤
//! │                  Paired Streams                      │
//! │        (event-driven read/write byte streams)        │
//! ├─────────────────────────────────────────────────────┤
//! │                    Raw TCP                           │
//! │          (non-blocking, readiness-driven)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod chain;
pub mod config;
pub mod http;
pub mod pinning;
pub mod stream;
pub mod tunnel;

pub use chain::{parse_chain, Endpoint, ParsedChain};
pub use config::Config;
pub use http::{Method, Request, Response, StatusCategory};
pub use pinning::PinStore;
pub use stream::tls::TlsSettings;
pub use tunnel::{TunnelConnection, TunnelState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default port for proxies and origins when the URL omits one
pub const DEFAULT_PORT: u16 = 443;

/// Maximum chunk moved per read or write call (1 MiB)
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chain error: {0}")]
    Chain(#[from] chain::ChainError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] chain::EndpointError),

    #[error("HTTP error: {0}")]
    Http(#[from] http::HttpError),

    #[error("Stream error: {0}")]
    Stream(#[from] stream::StreamError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection closed")]
    ConnectionClosed,
}
