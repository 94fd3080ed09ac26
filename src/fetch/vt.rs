// src/fetch/vt.rs
//! VirusTotal behavioural enrichment: for hash-typed attributes, pull the
//! MITRE behaviour tree and record tactic/technique/signature summaries.
//! The free tier is heavily rate limited, so the pass stops cleanly on HTTP
//! 429 and resumes from the last enriched row next run.

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, instrument, warn};
use url::Url;

use crate::process::baseline::columns;
use crate::process::table::FlatTable;

pub const TACTIC_COLUMN: &str = "Tactic_Info";
pub const TECHNIQUE_COLUMN: &str = "Technique_Info";
pub const SIGNATURE_COLUMN: &str = "Signature_Info";

const HASH_TYPES: &[&str] = &["sha256", "sha1", "md5"];
const REQUEST_GAP: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Default, Deserialize)]
struct BehaviourResponse {
    #[serde(default)]
    data: BehaviourData,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct BehaviourData {
    #[serde(rename = "CAPA", default)]
    capa: Option<CapaTree>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CapaTree {
    #[serde(default)]
    tactics: Vec<Tactic>,
}

#[derive(Debug, Clone, Deserialize)]
struct Tactic {
    id: String,
    name: String,
    #[serde(default)]
    techniques: Vec<Technique>,
}

#[derive(Debug, Clone, Deserialize)]
struct Technique {
    id: String,
    name: String,
    #[serde(default)]
    signatures: Vec<Signature>,
}

#[derive(Debug, Clone, Deserialize)]
struct Signature {
    severity: String,
    description: String,
}

/// Flattened `; `-joined summaries of a behaviour tree.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviourSummary {
    pub tactics: String,
    pub techniques: String,
    pub signatures: String,
}

fn summarize(tree: &CapaTree) -> BehaviourSummary {
    let mut tactics = Vec::new();
    let mut techniques = Vec::new();
    let mut signatures = Vec::new();
    for tactic in &tree.tactics {
        tactics.push(format!("{}: {}", tactic.id, tactic.name));
        for technique in &tactic.techniques {
            techniques.push(format!("{}: {}", technique.id, technique.name));
            for sig in &technique.signatures {
                signatures.push(format!("{}: {}", sig.severity, sig.description));
            }
        }
    }
    BehaviourSummary {
        tactics: tactics.join("; "),
        techniques: techniques.join("; "),
        signatures: signatures.join("; "),
    }
}

/// Outcome of a VirusTotal lookup for one hash.
enum Lookup {
    Found(BehaviourSummary),
    NotFound,
    QuotaExceeded,
}

/// `<base>/files/<hash>/behaviour_mitre_trees`.
fn behaviour_url(base_url: &str, hash: &str) -> Result<Url> {
    let mut url = Url::parse(base_url).context("invalid VirusTotal base URL")?;
    url.path_segments_mut()
        .map_err(|_| anyhow!("VirusTotal base URL cannot be a base"))?
        .pop_if_empty()
        .extend(["files", hash, "behaviour_mitre_trees"]);
    Ok(url)
}

async fn query_behaviour(
    client: &Client,
    base_url: &str,
    api_key: &str,
    hash: &str,
) -> Result<Lookup> {
    let url = behaviour_url(base_url, hash)?;
    let resp = client
        .get(url)
        .header("accept", "application/json")
        .header("x-apikey", api_key)
        .send()
        .await
        .with_context(|| format!("querying VirusTotal for {}", hash))?;

    match resp.status() {
        StatusCode::TOO_MANY_REQUESTS => Ok(Lookup::QuotaExceeded),
        StatusCode::NOT_FOUND => Ok(Lookup::NotFound),
        status if status.is_success() => {
            let body: BehaviourResponse =
                resp.json().await.context("parsing VirusTotal response")?;
            match body.data.capa {
                Some(tree) => Ok(Lookup::Found(summarize(&tree))),
                None => Ok(Lookup::NotFound),
            }
        }
        status => {
            warn!(hash = %hash, status = %status, "VirusTotal lookup failed, skipping");
            Ok(Lookup::NotFound)
        }
    }
}

fn is_hash_type(attr_type: &str) -> bool {
    let lower = attr_type.to_lowercase();
    HASH_TYPES.iter().any(|h| lower.contains(h))
}

/// Enrich hash attributes with behaviour summaries, resuming after the last
/// row that already has one. Returns (rows updated, quota exhausted).
#[instrument(level = "info", skip(client, table, base_url, api_key), fields(rows = table.len()))]
pub async fn enrich(
    client: &Client,
    base_url: &str,
    api_key: &str,
    table: &mut FlatTable,
) -> Result<(usize, bool)> {
    let Some(type_col) = table.column_index(columns::ATTRIBUTE_TYPE) else {
        warn!("table has no attribute_type column, skipping VirusTotal pass");
        return Ok((0, false));
    };
    let Some(value_col) = table.column_index(columns::ATTRIBUTE_VALUE) else {
        warn!("table has no attribute_value column, skipping VirusTotal pass");
        return Ok((0, false));
    };
    let tactic_col = table.ensure_column(TACTIC_COLUMN);
    let technique_col = table.ensure_column(TECHNIQUE_COLUMN);
    let signature_col = table.ensure_column(SIGNATURE_COLUMN);

    // resume point: one past the last row with behaviour data
    let start = table
        .rows
        .iter()
        .rposition(|r| r.get(tactic_col).and_then(|c| c.as_deref()).is_some())
        .map(|i| i + 1)
        .unwrap_or(0);

    let mut updated = 0;
    for idx in start..table.len() {
        if table.cell(idx, tactic_col).is_some() {
            continue;
        }
        let is_hash = table
            .cell(idx, type_col)
            .map(is_hash_type)
            .unwrap_or(false);
        if !is_hash {
            continue;
        }
        let Some(hash) = table.cell(idx, value_col).map(|v| v.trim().to_string()) else {
            continue;
        };

        match query_behaviour(client, base_url, api_key, &hash).await? {
            Lookup::QuotaExceeded => {
                warn!(row = idx, "VirusTotal quota exceeded, stopping pass");
                return Ok((updated, true));
            }
            Lookup::NotFound => {}
            Lookup::Found(summary) => {
                table.set_cell(idx, tactic_col, summary.tactics);
                table.set_cell(idx, technique_col, summary.techniques);
                table.set_cell(idx, signature_col, summary.signatures);
                updated += 1;
            }
        }
        sleep(REQUEST_GAP).await;
    }

    info!(updated, "VirusTotal enrichment done");
    Ok((updated, false))
}
