// src/fetch/mod.rs
pub mod cisa;
pub mod epss;
pub mod geoip;
pub mod misp;
pub mod vt;

use anyhow::{Context, Result};
use reqwest::Client;
use std::time::Duration;

/// Shared HTTP client for every feed. Timeouts here are per request;
/// retry policy is deliberately left to the caller's scheduler.
pub fn build_client() -> Result<Client> {
    Client::builder()
        .user_agent(concat!("intelscraper/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .gzip(true)
        .build()
        .context("building HTTP client")
}

/// GET a URL and return the response body as text, failing on any
/// non-success status.
pub async fn fetch_text(client: &Client, url: &str) -> Result<String> {
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("requesting {}", url))?
        .error_for_status()
        .with_context(|| format!("fetching {}", url))?;
    resp.text().await.context("reading response body")
}
