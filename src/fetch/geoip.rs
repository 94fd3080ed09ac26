// src/fetch/geoip.rs
//! IP geolocation enrichment via findip.net: rows whose `attribute_value`
//! contains an IPv4 address get country/latitude/longitude columns filled.

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::process::baseline::columns;
use crate::process::table::FlatTable;

static IP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("IPv4 regex is valid"));

#[derive(Debug, Clone, Deserialize)]
pub struct IpInfo {
    #[serde(default)]
    country: Option<CountryInfo>,
    #[serde(default)]
    location: Option<LocationInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct CountryInfo {
    #[serde(default)]
    names: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LocationInfo {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

/// (country name, latitude, longitude) if the response carried all three.
/// Incomplete answers are treated as a miss, matching the feed's habit of
/// returning partial records for reserved ranges.
fn geo_fields(info: &IpInfo) -> Option<(String, f64, f64)> {
    let country = info.country.as_ref()?.names.get("en")?.clone();
    let loc = info.location.as_ref()?;
    Some((country, loc.latitude?, loc.longitude?))
}

/// First IPv4 address in a string, if any.
pub fn extract_ip(text: &str) -> Option<&str> {
    IP_RE.find(text).map(|m| m.as_str())
}

/// `<base>/<ip>/?token=<token>`, the shape findip.net expects.
fn lookup_url(base_url: &str, ip: &str, token: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).context("invalid findip base URL")?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("findip base URL cannot be a base"))?
        .pop_if_empty()
        .push(ip)
        .push("");
    url.query_pairs_mut().append_pair("token", token);
    Ok(url)
}

pub async fn fetch_ip_info(client: &Client, base_url: &str, token: &str, ip: &str) -> Result<IpInfo> {
    let url = lookup_url(base_url, ip, token)?;
    let resp = client
        .get(url)
        .send()
        .await
        .with_context(|| format!("querying geolocation for {}", ip))?
        .error_for_status()
        .with_context(|| format!("geolocation lookup for {}", ip))?;
    resp.json().await.context("parsing geolocation response")
}

/// Fill `Country Name` / `Latitude` / `Longitude` for rows that still lack
/// them. Lookups are cached per address within the pass. Returns the number
/// of rows updated.
#[instrument(level = "info", skip(client, table, base_url, token), fields(rows = table.len()))]
pub async fn enrich(
    client: &Client,
    base_url: &str,
    token: &str,
    table: &mut FlatTable,
) -> Result<usize> {
    let Some(value_col) = table.column_index(columns::ATTRIBUTE_VALUE) else {
        warn!("table has no attribute_value column, skipping geolocation");
        return Ok(0);
    };
    let country_col = table.ensure_column(columns::COUNTRY_NAME);
    let lat_col = table.ensure_column(columns::LATITUDE);
    let lon_col = table.ensure_column(columns::LONGITUDE);

    let mut cache: HashMap<String, Option<(String, f64, f64)>> = HashMap::new();
    let mut updated = 0;

    for idx in 0..table.len() {
        if table.cell(idx, country_col).is_some()
            && table.cell(idx, lat_col).is_some()
            && table.cell(idx, lon_col).is_some()
        {
            continue;
        }
        let Some(ip) = table.cell(idx, value_col).and_then(extract_ip).map(String::from) else {
            continue;
        };

        let geo = match cache.get(&ip) {
            Some(hit) => hit.clone(),
            None => {
                let fields = match fetch_ip_info(client, base_url, token, &ip).await {
                    Ok(info) => geo_fields(&info),
                    Err(err) => {
                        warn!(ip = %ip, error = %err, "geolocation lookup failed, skipping");
                        None
                    }
                };
                cache.insert(ip.clone(), fields.clone());
                fields
            }
        };

        if let Some((country, lat, lon)) = geo {
            table.set_cell(idx, country_col, country);
            table.set_cell(idx, lat_col, lat.to_string());
            table.set_cell(idx, lon_col, lon.to_string());
            updated += 1;
        } else {
            debug!(ip = %ip, "no usable geolocation data");
        }
    }

    info!(updated, "geolocation enrichment done");
    Ok(updated)
}
