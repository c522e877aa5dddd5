//! Tunnel orchestration
//!
//! Grows a stack of TLS layers hop by hop: wait until the current layer is
//! writable, send a `CONNECT` for the next target, require a 200, wrap a
//! fresh TLS session on top, repeat; once the final layer is up, send the
//! user's request and parse the response.

mod connection;

pub use connection::TunnelConnection;

use thiserror::Error;

/// Orchestrator states, one request at a time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// No request in flight
    #[default]
    Inactive,
    /// Next write readiness triggers a CONNECT send
    ShouldEstablishTunnelConnection,
    /// Waiting for the CONNECT response on the current layer
    ExpectTunnelConnectionEstablished,
    /// Next write readiness triggers the user's request send
    ShouldSendHttpRequest,
    /// Waiting for the final response
    ExpectHttpResponse,
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("No targets configured")]
    NoTargets,

    #[error("Unexpected response: {status} {reason}")]
    UnexpectedResponse { status: u16, reason: String },
}
