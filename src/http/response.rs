//! Response parsing and status classification

use super::HttpError;
use bytes::Bytes;

/// An HTTP/1.x response: status line, header block, optional body
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code, always in 100..=599 and registered
    pub status: u16,
    /// Reason phrase exactly as sent (may be empty)
    pub reason: String,
    /// Headers in wire order
    pub headers: Vec<(String, String)>,
    /// Raw entity body, `None` when the response carried no bytes past the
    /// header block
    pub body: Option<Bytes>,
}

/// Coarse classification of a status code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCategory {
    Informational,
    Success,
    Redirection,
    ClientError,
    ServerError,
}

impl StatusCategory {
    /// Classify a status code; the caller guarantees 100..=599
    pub fn of(status: u16) -> Self {
        match status {
            100..=199 => StatusCategory::Informational,
            200..=299 => StatusCategory::Success,
            300..=399 => StatusCategory::Redirection,
            400..=499 => StatusCategory::ClientError,
            _ => StatusCategory::ServerError,
        }
    }
}

impl Response {
    /// Parse a response from raw bytes.
    ///
    /// Returns `Ok(None)` while the header block is still incomplete (no
    /// terminating blank line yet), so callers can accumulate and retry.
    /// Anything structurally wrong is an error: a status line that is not
    /// `HTTP/<v> <code> <reason>`, a non-numeric code, or a code outside
    /// the registered 100..=599 set. Chunked bodies are never decoded; the
    /// body is the raw remainder.
    pub fn parse(bytes: &[u8]) -> Result<Option<Self>, HttpError> {
        let Some(header_end) = find_header_end(bytes) else {
            return Ok(None);
        };

        let head = std::str::from_utf8(&bytes[..header_end])
            .map_err(|_| HttpError::InvalidResponse("header block is not UTF-8".into()))?;
        let mut lines = head.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| HttpError::InvalidResponse("missing status line".into()))?;
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| HttpError::InvalidResponse(format!("malformed header: {}", line)))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let rest = &bytes[header_end + 4..];
        let body = if rest.is_empty() {
            None
        } else {
            Some(Bytes::copy_from_slice(rest))
        };

        Ok(Some(Self {
            status,
            reason,
            headers,
            body,
        }))
    }

    /// Coarse status classification
    pub fn category(&self) -> StatusCategory {
        StatusCategory::of(self.status)
    }

    /// Reason phrase, falling back to the registered text for the code
    pub fn description(&self) -> String {
        if self.reason.is_empty() {
            canonical_reason(self.status).to_string()
        } else {
            self.reason.clone()
        }
    }

    /// First header value matching `name`, case-insensitively
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn find_header_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<(u16, String), HttpError> {
    let mut parts = line.splitn(3, ' ');

    let version = parts
        .next()
        .ok_or_else(|| HttpError::InvalidResponse("empty status line".into()))?;
    if !version.starts_with("HTTP/") {
        return Err(HttpError::InvalidResponse(format!(
            "not an HTTP status line: {}",
            line
        )));
    }

    let code_token = parts
        .next()
        .ok_or_else(|| HttpError::InvalidResponse("missing status code".into()))?;
    if code_token.is_empty() || !code_token.chars().all(|c| c.is_ascii_digit()) {
        return Err(HttpError::InvalidResponse(format!(
            "non-numeric status code: {}",
            code_token
        )));
    }
    let status: u16 = code_token
        .parse()
        .map_err(|_| HttpError::InvalidResponse(format!("status code overflow: {}", code_token)))?;

    if !(100..=599).contains(&status) || !is_registered_status(status) {
        return Err(HttpError::InvalidResponse(format!(
            "unknown status code: {}",
            status
        )));
    }

    let reason = parts.next().unwrap_or("").to_string();
    Ok((status, reason))
}

/// Registered status codes (IANA). Everything else inside 100..=599 is
/// still rejected.
fn is_registered_status(status: u16) -> bool {
    matches!(
        status,
        100..=103
            | 200..=208
            | 226
            | 300..=308
            | 400..=418
            | 421..=426
            | 428
            | 429
            | 431
            | 451
            | 500..=508
            | 510
            | 511
    )
}

/// Registered reason phrase for the common codes, empty otherwise
fn canonical_reason(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "",
    }
}
