//! Nested Tunnel client
//!
//! Issues a single request through a proxy chain described by a synthetic
//! scheme URL (`httpss://`, `httpsss://`, `httpssss://`) and prints the
//! response. Intended as a thin adapter over the library; flags override
//! config-file values.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use nested_tunnel::{config::Config, parse_chain, Method, Request, TlsSettings, TunnelConnection};
use std::time::Duration;
use tracing::{debug, info};

/// Nested Tunnel client - HTTPS through chained HTTPS proxies
#[derive(Parser, Debug)]
#[command(name = "nested-client")]
#[command(about = "Issue an HTTPS request through a chain of CONNECT proxies")]
#[command(version)]
struct Args {
    /// Chain URL: httpss://proxy[:port]/origin[:port]/path (one extra 's'
    /// per additional proxy, up to three)
    url: String,

    /// Request method
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,

    /// Additional header, as "Name: value" (repeatable)
    #[arg(short = 'H', long = "header")]
    headers: Vec<String>,

    /// Request body
    #[arg(short = 'd', long)]
    data: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Per-request timeout in seconds (overrides config)
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'v', long, default_value = "warn")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(&args.log_level)
        .with_writer(std::io::stderr)
        .init();

    // Load configuration when given, defaults otherwise
    let config = match &args.config {
        Some(path) => Config::load(path).context("Failed to load configuration")?,
        None => Config::default(),
    };

    let chain = parse_chain(&args.url)
        .context("Invalid chain URL")?
        .ok_or_else(|| anyhow!("Not a chain URL (expected an httpss/httpsss/httpssss scheme)"))?;

    debug!(
        "chain decoded: {} proxies, origin {}",
        chain.proxies.len(),
        chain.inner_url
    );

    let method: Method = args.method.parse().context("Unsupported method")?;

    let mut request = Request::new(method, chain.inner_url.clone());
    for header in &args.headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| anyhow!("Header must be \"Name: value\": {}", header))?;
        request = request.with_header(name.trim(), value.trim());
    }
    if let Some(data) = args.data {
        request.body = data.into_bytes().into();
    }

    let pins = config
        .pin_store()
        .context("Failed to decode pinned certificates")?;
    if !pins.is_empty() {
        info!("{} pinned certificate(s) loaded", pins.len());
    }

    let mut connection = TunnelConnection::from_chain(&chain, TlsSettings::new(pins))
        .context("Failed to build tunnel")?;

    let timeout = Duration::from_secs(args.timeout.unwrap_or(config.client.request_timeout));
    let response = tokio::time::timeout(timeout, connection.issue(request))
        .await
        .map_err(|_| anyhow!("Request timed out after {:?}", timeout))?
        .context("Request failed")?;

    println!("HTTP {} {}", response.status, response.description());
    for (name, value) in &response.headers {
        println!("{}: {}", name, value);
    }
    if let Some(body) = &response.body {
        println!();
        match std::str::from_utf8(body) {
            Ok(text) => println!("{}", text),
            Err(_) => println!("<{} binary bytes>", body.len()),
        }
    }

    if response.status >= 400 {
        bail!("Server answered {}", response.status);
    }
    Ok(())
}
