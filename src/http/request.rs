//! Request composition

use super::{HttpError, Method};
use crate::chain::Endpoint;
use bytes::{BufMut, Bytes, BytesMut};
use url::Url;

/// An HTTP/1.1 request described as plain data.
///
/// Headers are an insertion-ordered list of case-sensitive pairs. `compose`
/// injects `Host` and `Content-Length` when the caller did not supply them:
/// `Host` lands right behind the first caller header, `Content-Length` at
/// the end of the block.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Explicit request-target, overriding the URL path on the request line.
    /// Required for CONNECT (`host:port`) and OPTIONS (`*` or a path).
    pub target: Option<String>,
}

impl Request {
    /// Create a request with no headers and no body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: Vec::new(),
            body: Bytes::new(),
            target: None,
        }
    }

    /// Create a GET request
    pub fn get(url: Url) -> Self {
        Self::new(Method::Get, url)
    }

    /// Create a POST request with a body
    pub fn post(url: Url, body: Bytes) -> Self {
        let mut request = Self::new(Method::Post, url);
        request.body = body;
        request
    }

    /// Create the CONNECT request that asks `proxy` for a tunnel to
    /// `target`. The synthesized URL points at the proxy so that `Host`
    /// is injected as the proxy's host.
    pub fn connect(
        target: &Endpoint,
        proxy: &Endpoint,
        headers: Vec<(String, String)>,
    ) -> Result<Self, HttpError> {
        let url = Url::parse(&format!("https://{}/", proxy))
            .map_err(|e| HttpError::InvalidRequest(format!("proxy authority: {}", e)))?;

        Ok(Self {
            method: Method::Connect,
            url,
            headers,
            body: Bytes::new(),
            target: Some(target.to_string()),
        })
    }

    /// Append a header, preserving insertion order
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The headers in insertion order
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Check the method/URL/body invariants
    pub fn validate(&self) -> Result<(), HttpError> {
        if self.url.scheme() == "file" {
            return Err(HttpError::InvalidRequest("file URLs are not allowed".into()));
        }
        if self.method.requires_target() && self.target.is_none() {
            return Err(HttpError::InvalidRequest(format!(
                "{} requires an explicit request-target",
                self.method
            )));
        }
        if self.method.forbids_body() && !self.body.is_empty() {
            return Err(HttpError::InvalidRequest(format!(
                "{} must not carry a body",
                self.method
            )));
        }
        Ok(())
    }

    /// Serialize to wire bytes: request line, header block, blank line, body
    pub fn compose(&self) -> Result<Bytes, HttpError> {
        self.validate()?;

        let target = match &self.target {
            Some(target) => target.clone(),
            None => self.url.path().to_string(),
        };

        let mut headers = self.headers.clone();
        if !self.has_header("Host") {
            // Injected right behind the first caller header
            let host = self.url.host_str().unwrap_or_default().to_string();
            let at = headers.len().min(1);
            headers.insert(at, ("Host".to_string(), host));
        }
        if !self.body.is_empty() && !self.has_header("Content-Length") {
            headers.push(("Content-Length".to_string(), self.body.len().to_string()));
        }

        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(target.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        for (name, value) in &headers {
            put_header(&mut buf, name, value);
        }

        buf.put_slice(b"\r\n");
        buf.put_slice(&self.body);

        Ok(buf.freeze())
    }
}

fn put_header(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value.as_bytes());
    buf.put_slice(b"\r\n");
}
