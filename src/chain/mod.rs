//! Synthetic-scheme URL decoding
//!
//! A chain URL replicates the trailing `s` of `https` once per proxy hop:
//!
//! ```text
//! httpss://proxy[:port]/origin[:port]/path              1 proxy
//! httpsss://p1[:port]/p2[:port]/origin[:port]/path      2 proxies
//! httpssss://p1[:port]/p2[:port]/p3[:port]/origin/path  3 proxies
//! ```
//!
//! Ports default to 443. IPv6 hosts must be bracketed. Plain `http` and
//! `https` URLs are not chain URLs and decode to `None` so adapters can
//! pass them through untouched.

mod endpoint;

pub use endpoint::Endpoint;

use crate::DEFAULT_PORT;
use thiserror::Error;
use url::Url;

/// Chain decoding errors
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("URL names fewer authorities than the scheme requires")]
    TooFewProxies,

    #[error("Invalid proxy specification: {0}")]
    IncorrectProxySpecification(String),

    #[error("Invalid inner URL: {0}")]
    InvalidInnerUrl(#[from] url::ParseError),
}

/// Endpoint validation errors
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// A decoded proxy chain: proxies in connect order plus the inner request URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedChain {
    /// Proxy endpoints, outermost hop first
    pub proxies: Vec<Endpoint>,
    /// The request URL behind the chain, always `https` with a non-empty path
    pub inner_url: Url,
}

impl ParsedChain {
    /// The origin endpoint derived from the inner URL (port defaults to 443)
    pub fn origin(&self) -> Result<Endpoint, EndpointError> {
        let host = self
            .inner_url
            .host_str()
            .ok_or_else(|| EndpointError::InvalidEndpoint(self.inner_url.to_string()))?;
        let port = self.inner_url.port().unwrap_or(DEFAULT_PORT);
        Endpoint::new(host, port)
    }

    /// The full connect-order target list: proxies followed by the origin
    pub fn targets(&self) -> Result<Vec<Endpoint>, EndpointError> {
        let mut targets = self.proxies.clone();
        targets.push(self.origin()?);
        Ok(targets)
    }
}

/// Decode a synthetic-scheme URL into a proxy chain.
///
/// Returns `Ok(None)` when the input is not a chain URL at all: a plain
/// `http`/`https` scheme, a scheme with more than three extra `s`
/// characters, or something that is not an absolute URL.
pub fn parse_chain(raw: &str) -> Result<Option<ParsedChain>, ChainError> {
    let Some((scheme, rest)) = raw.split_once("://") else {
        return Ok(None);
    };

    let Some(proxy_count) = chain_length(scheme) else {
        return Ok(None);
    };

    let parts: Vec<&str> = rest.split('/').collect();
    if parts.len() < proxy_count + 1 {
        return Err(ChainError::TooFewProxies);
    }

    let proxies = parts[..proxy_count]
        .iter()
        .map(|authority| parse_authority(authority))
        .collect::<Result<Vec<_>, _>>()?;

    let inner = parts[proxy_count..].join("/");
    let inner_url = Url::parse(&format!("https://{}", inner))?;
    // The url crate normalizes an empty https path to "/", which is the
    // shape the rest of the pipeline requires.

    Ok(Some(ParsedChain { proxies, inner_url }))
}

/// Number of proxies encoded by the scheme, or `None` when it is not ours.
///
/// `httpss` is one proxy, each further `s` adds one, up to three.
fn chain_length(scheme: &str) -> Option<usize> {
    let scheme = scheme.to_ascii_lowercase();
    let tail = scheme.strip_prefix("http")?;
    let s_count = tail.len();
    if s_count < 2 || s_count > 4 || !tail.bytes().all(|b| b == b's') {
        return None;
    }
    Some(s_count - 1)
}

/// Parse one proxy authority: `host`, `host:port`, or a bracketed IPv6
/// literal with either shape. A trailing token that is not a pure integer
/// in 1..=65535 belongs to the host.
fn parse_authority(authority: &str) -> Result<Endpoint, ChainError> {
    let reject = || ChainError::IncorrectProxySpecification(authority.to_string());

    if authority.is_empty() {
        return Err(reject());
    }

    let (host, port) = if authority.ends_with(']') {
        (authority, DEFAULT_PORT)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port_str))
                if !port_str.is_empty() && port_str.chars().all(|c| c.is_ascii_digit()) =>
            {
                match port_str.parse::<u16>() {
                    Ok(port) if port >= 1 => (host, port),
                    _ => (authority, DEFAULT_PORT),
                }
            }
            _ => (authority, DEFAULT_PORT),
        }
    };

    Endpoint::new(host, port).map_err(|_| reject())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(host: &str, port: u16) -> Endpoint {
        Endpoint::new(host, port).unwrap()
    }

    #[test]
    fn test_single_proxy_chain() {
        let chain = parse_chain("httpss://shalon1.jondonym.de:443/www.google.com")
            .unwrap()
            .unwrap();
        assert_eq!(chain.proxies, vec![ep("shalon1.jondonym.de", 443)]);
        assert_eq!(chain.inner_url.as_str(), "https://www.google.com/");
    }

    #[test]
    fn test_two_proxy_chain_with_inner_port() {
        let chain = parse_chain("httpsss://shalon1.jondonym.de:443/test.g.de:778/www.google.com")
            .unwrap()
            .unwrap();
        assert_eq!(
            chain.proxies,
            vec![ep("shalon1.jondonym.de", 443), ep("test.g.de", 778)]
        );
        assert_eq!(chain.inner_url.as_str(), "https://www.google.com/");
    }

    #[test]
    fn test_three_proxy_chain() {
        let chain = parse_chain("httpssss://a.example/b.example:8443/c.example/origin.example/x/y")
            .unwrap()
            .unwrap();
        assert_eq!(
            chain.proxies,
            vec![
                ep("a.example", 443),
                ep("b.example", 8443),
                ep("c.example", 443)
            ]
        );
        assert_eq!(chain.inner_url.as_str(), "https://origin.example/x/y");
    }

    #[test]
    fn test_too_few_proxies() {
        let err = parse_chain("httpsss://shalon1.jondonym.de:80/www.google.com").unwrap_err();
        assert!(matches!(err, ChainError::TooFewProxies));
    }

    #[test]
    fn test_incorrect_proxy_specification() {
        let err =
            parse_chain("httpsss://shalon1.jondonym.de:8080/shalon2.jondonym.de:/www.google.com")
                .unwrap_err();
        assert!(matches!(err, ChainError::IncorrectProxySpecification(_)));
    }

    #[test]
    fn test_bracketed_ipv6_proxy() {
        let chain = parse_chain("httpss://[2001:db8:85a3::8a2e:370:7334]:443/www.google.com")
            .unwrap()
            .unwrap();
        assert_eq!(
            chain.proxies,
            vec![ep("[2001:db8:85a3::8a2e:370:7334]", 443)]
        );
    }

    #[test]
    fn test_not_ours() {
        assert!(parse_chain("https://example.com/").unwrap().is_none());
        assert!(parse_chain("http://example.com/").unwrap().is_none());
        assert!(parse_chain("httpsssss://p/t").unwrap().is_none());
        assert!(parse_chain("ftp://example.com/").unwrap().is_none());
        assert!(parse_chain("not a url").unwrap().is_none());
    }

    #[test]
    fn test_scheme_case_insensitive() {
        let chain = parse_chain("HTTPSS://proxy.example:8080/origin.example")
            .unwrap()
            .unwrap();
        assert_eq!(chain.proxies, vec![ep("proxy.example", 8080)]);
    }

    #[test]
    fn test_port_zero_folds_into_host_and_fails() {
        let err = parse_chain("httpss://proxy.example:0/origin.example").unwrap_err();
        assert!(matches!(err, ChainError::IncorrectProxySpecification(_)));
    }

    #[test]
    fn test_targets_include_origin() {
        let chain = parse_chain("httpss://proxy.example/origin.example:8443/path")
            .unwrap()
            .unwrap();
        let targets = chain.targets().unwrap();
        assert_eq!(targets, vec![ep("proxy.example", 443), ep("origin.example", 8443)]);
    }

    #[test]
    fn test_origin_port_defaults() {
        let chain = parse_chain("httpss://proxy.example/origin.example")
            .unwrap()
            .unwrap();
        assert_eq!(chain.origin().unwrap(), ep("origin.example", 443));
    }
}
