//! Minimal HTTP/1.1 codec
//!
//! Composes one request and parses one response; chunked transfer,
//! pipelining and persistent connections are out of scope. The same codec
//! serves the user's final request and the `CONNECT` exchanges that
//! establish intermediate hops.

mod request;
mod response;

pub use request::Request;
pub use response::{Response, StatusCategory};

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// HTTP codec errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Supported request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Connect,
    Delete,
    Get,
    Head,
    Options,
    Post,
    Put,
    Trace,
}

impl Method {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Connect => "CONNECT",
            Method::Delete => "DELETE",
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Trace => "TRACE",
        }
    }

    /// Whether this method must carry an empty body
    pub fn forbids_body(&self) -> bool {
        matches!(self, Method::Connect | Method::Head)
    }

    /// Whether this method requires an explicit request-target
    pub fn requires_target(&self) -> bool {
        matches!(self, Method::Connect | Method::Options)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = HttpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CONNECT" => Ok(Method::Connect),
            "DELETE" => Ok(Method::Delete),
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "OPTIONS" => Ok(Method::Options),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "TRACE" => Ok(Method::Trace),
            other => Err(HttpError::InvalidRequest(format!(
                "unsupported method: {}",
                other
            ))),
        }
    }
}
