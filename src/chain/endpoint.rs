//! Validated host:port endpoint values

use super::EndpointError;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// A validated `(host, port)` pair.
///
/// The host is a DNS name, a dotted-quad IPv4 literal, or an IPv6 literal
/// wrapped in brackets. Equality is structural and the formatted form is
/// `host:port` with IPv6 brackets kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    /// Create an endpoint, validating host and port
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, EndpointError> {
        let host = host.into();

        if host.is_empty() || port == 0 {
            return Err(EndpointError::InvalidEndpoint(format!("{}:{}", host, port)));
        }

        if host.starts_with('[') && host.ends_with(']') {
            let inner = &host[1..host.len() - 1];
            if inner.parse::<Ipv6Addr>().is_err() {
                return Err(EndpointError::InvalidEndpoint(host));
            }
        } else if host.parse::<Ipv6Addr>().is_ok() {
            // Bare IPv6 would be ambiguous next to the port separator
            return Err(EndpointError::InvalidEndpoint(host));
        } else if host.parse::<Ipv4Addr>().is_err() && !is_valid_dns_host(&host) {
            return Err(EndpointError::InvalidEndpoint(host));
        }

        Ok(Self { host, port })
    }

    /// The host exactly as parsed (IPv6 literals keep their brackets)
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port (always non-zero)
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host with IPv6 brackets stripped, suitable for SNI and
    /// certificate matching
    pub fn bare_host(&self) -> &str {
        if self.host.starts_with('[') && self.host.ends_with(']') {
            &self.host[1..self.host.len() - 1]
        } else {
            &self.host
        }
    }
}

/// A DNS host must survive a URL authority round trip
fn is_valid_dns_host(host: &str) -> bool {
    let candidate = format!("https://{}/", host);
    match url::Url::parse(&candidate) {
        Ok(parsed) => parsed
            .host_str()
            .is_some_and(|h| h.eq_ignore_ascii_case(host)),
        Err(_) => false,
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    /// Parse `host:port`, keeping IPv6 brackets intact
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| EndpointError::InvalidEndpoint(s.to_string()))?;

        if !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit()) {
            let port: u16 = port_str
                .parse()
                .map_err(|_| EndpointError::InvalidEndpoint(s.to_string()))?;
            Endpoint::new(host, port)
        } else {
            Err(EndpointError::InvalidEndpoint(s.to_string()))
        }
    }
}
