// src/fetch/epss.rs
//! EPSS score enrichment: scan rows for CVE identifiers, query the FIRST.org
//! EPSS API in batches, and append `<cve>:<score>` entries to the score
//! columns of every row mentioning the CVE.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{info, instrument, warn};

use crate::process::table::FlatTable;

pub const SCORES_COLUMN: &str = "EPSS Scores";
pub const PERCENTILES_COLUMN: &str = "Percentiles";
pub const DATES_COLUMN: &str = "Dates";

static CVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"CVE-\d{4}-\d{4,7}").expect("CVE regex is valid"));

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EpssScore {
    #[serde(default)]
    pub epss: String,
    #[serde(default)]
    pub percentile: String,
    #[serde(default)]
    pub date: String,
}

#[derive(Debug, Deserialize)]
struct EpssEntry {
    cve: String,
    #[serde(flatten)]
    score: EpssScore,
}

#[derive(Debug, Deserialize)]
struct EpssResponse {
    #[serde(default)]
    data: Vec<EpssEntry>,
}

fn cves_in_row(row: &[Option<String>]) -> Vec<&str> {
    row.iter()
        .flatten()
        .flat_map(|cell| CVE_RE.find_iter(cell).map(|m| m.as_str()))
        .collect()
}

/// CVEs mentioned anywhere in the table and not yet present in that row's
/// score column. Sorted for deterministic batching.
pub fn collect_unscored_cves(table: &FlatTable) -> Vec<String> {
    let scores_col = table.column_index(SCORES_COLUMN);
    let mut cves = BTreeSet::new();
    for row in &table.rows {
        let existing = scores_col
            .and_then(|c| row.get(c))
            .and_then(|c| c.as_deref())
            .unwrap_or("");
        for cve in cves_in_row(row) {
            if !existing.contains(cve) {
                cves.insert(cve.to_string());
            }
        }
    }
    cves.into_iter().collect()
}

/// Query EPSS scores for `cves` in batches. Failed batches are logged and
/// skipped; the rest of the run continues.
pub async fn query_scores(
    client: &Client,
    url: &str,
    cves: &[String],
    batch_size: usize,
) -> Result<HashMap<String, EpssScore>> {
    let mut scores = HashMap::new();
    for batch in cves.chunks(batch_size.max(1)) {
        let resp = client
            .get(url)
            .query(&[("cve", batch.join(","))])
            .send()
            .await
            .with_context(|| format!("querying EPSS for {} CVEs", batch.len()))?;
        if !resp.status().is_success() {
            warn!(status = %resp.status(), batch = batch.len(), "EPSS batch failed, skipping");
            continue;
        }
        let body: EpssResponse = resp.json().await.context("parsing EPSS response")?;
        for entry in body.data {
            scores.insert(entry.cve, entry.score);
        }
    }
    info!(queried = cves.len(), scored = scores.len(), "EPSS lookup done");
    Ok(scores)
}

/// EPSS dates are ISO; the export's convention is `DD/MM/YYYY`.
fn format_date(date: &str) -> String {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|_| date.to_string())
}

fn append_entry(cell: &mut Option<String>, entry: String) {
    match cell {
        Some(existing) => {
            existing.push_str(", ");
            existing.push_str(&entry);
        }
        None => *cell = Some(entry),
    }
}

/// Write `<cve>:<value>` entries into the three score columns of every row
/// that mentions a scored CVE. Columns are created on first use. Returns the
/// number of rows touched.
pub fn apply_scores(table: &mut FlatTable, scores: &HashMap<String, EpssScore>) -> usize {
    let scores_col = table.ensure_column(SCORES_COLUMN);
    let pct_col = table.ensure_column(PERCENTILES_COLUMN);
    let dates_col = table.ensure_column(DATES_COLUMN);

    let mut touched = 0;
    for row in &mut table.rows {
        let cves: Vec<String> = cves_in_row(row).into_iter().map(String::from).collect();
        let mut hit = false;
        for cve in cves {
            let Some(score) = scores.get(&cve) else {
                continue;
            };
            let existing = row
                .get(scores_col)
                .and_then(|c| c.as_deref())
                .unwrap_or("");
            if existing.contains(&cve) {
                continue;
            }
            row.resize(table.headers.len().max(row.len()), None);
            append_entry(&mut row[scores_col], format!("{}:{}", cve, score.epss));
            append_entry(&mut row[pct_col], format!("{}:{}", cve, score.percentile));
            append_entry(&mut row[dates_col], format!("{}:{}", cve, format_date(&score.date)));
            hit = true;
        }
        if hit {
            touched += 1;
        }
    }
    touched
}

/// Full enrichment pass over a table.
#[instrument(level = "info", skip(client, table, url), fields(rows = table.len()))]
pub async fn enrich(
    client: &Client,
    url: &str,
    batch_size: usize,
    table: &mut FlatTable,
) -> Result<usize> {
    let cves = collect_unscored_cves(table);
    if cves.is_empty() {
        info!("no new CVEs to score");
        return Ok(0);
    }
    let scores = query_scores(client, url, &cves, batch_size).await?;
    let touched = apply_scores(table, &scores);
    info!(touched, "applied EPSS scores");
    Ok(touched)
}
