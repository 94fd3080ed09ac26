// src/fetch/cisa.rs
//! Incremental merge of the CISA ICS advisory master CSV into a local copy,
//! keyed on `icsad_ID`.

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::Path;
use tracing::{info, instrument};

use crate::fetch::fetch_text;
use crate::process::table::FlatTable;

pub const ADVISORY_ID_COLUMN: &str = "icsad_ID";

/// Fetch the master advisory CSV and parse it.
pub async fn fetch_master(client: &Client, url: &str) -> Result<FlatTable> {
    let body = fetch_text(client, url).await?;
    FlatTable::from_csv_reader(body.as_bytes()).context("parsing CISA master CSV")
}

/// First advisory id not yet present locally. An absent id column means
/// nothing was pulled before.
pub fn next_advisory_id(local: &FlatTable) -> u64 {
    let Some(col) = local.column_index(ADVISORY_ID_COLUMN) else {
        return 0;
    };
    local
        .rows
        .iter()
        .filter_map(|r| r.get(col).and_then(|c| c.as_deref()))
        .filter_map(|v| v.parse::<u64>().ok())
        .max()
        .map(|max| max + 1)
        .unwrap_or(0)
}

fn row_id(row: &[Option<String>], col: Option<usize>) -> Option<u64> {
    col.and_then(|c| row.get(c)).and_then(|c| c.as_deref())?.parse().ok()
}

/// Append master rows with id >= `from_id` onto the local table and keep it
/// sorted by advisory id. Rows without a parseable id sort first, matching
/// a numeric sort over a column that should always be numeric.
pub fn merge_advisories(mut local: FlatTable, master: &FlatTable, from_id: u64) -> FlatTable {
    if local.headers.is_empty() {
        local.headers = master.headers.clone();
    }
    let master_col = master.column_index(ADVISORY_ID_COLUMN);
    let new_rows: Vec<_> = master
        .rows
        .iter()
        .filter(|row| row_id(row, master_col).is_some_and(|id| id >= from_id))
        .cloned()
        .collect();
    local.rows.extend(new_rows);

    let local_col = local.column_index(ADVISORY_ID_COLUMN);
    local
        .rows
        .sort_by_key(|row| row_id(row, local_col).unwrap_or(0));
    local
}

/// Fetch the master CSV and bring `local_path` up to date with it.
#[instrument(level = "info", skip(client, url, local_path), fields(path = %local_path.as_ref().display()))]
pub async fn sync_advisories(
    client: &Client,
    url: &str,
    local_path: impl AsRef<Path>,
) -> Result<FlatTable> {
    let local_path = local_path.as_ref();
    let master = fetch_master(client, url).await?;

    let local = if local_path.exists() {
        FlatTable::from_csv_path(local_path)?
    } else {
        info!("no local advisory file, creating one");
        FlatTable::default()
    };

    let from_id = next_advisory_id(&local);
    let before = local.len();
    let merged = merge_advisories(local, &master, from_id);
    info!(
        new_rows = merged.len() - before,
        from_id, "merged CISA advisories"
    );

    merged.write_csv_path(local_path)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advisory_table(ids: &[&str]) -> FlatTable {
        let mut t = FlatTable::new(vec![ADVISORY_ID_COLUMN.into(), "Vendor".into()]);
        for id in ids {
            t.rows
                .push(vec![Some(id.to_string()), Some(format!("vendor-{id}"))]);
        }
        t
    }

    #[test]
    fn next_id_is_one_past_local_max() {
        assert_eq!(next_advisory_id(&advisory_table(&["3", "7", "5"])), 8);
        assert_eq!(next_advisory_id(&advisory_table(&[])), 0);
        assert_eq!(next_advisory_id(&FlatTable::default()), 0);
    }

    #[test]
    fn merge_appends_only_new_rows_sorted() {
        let local = advisory_table(&["1", "2"]);
        let master = advisory_table(&["1", "2", "3", "4"]);
        let merged = merge_advisories(local, &master, 3);
        let ids: Vec<_> = merged
            .rows
            .iter()
            .map(|r| r[0].clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2", "3", "4"]);
    }

    #[test]
    fn merge_into_empty_local_takes_master_headers() {
        let merged = merge_advisories(FlatTable::default(), &advisory_table(&["2", "1"]), 0);
        assert_eq!(merged.headers[0], ADVISORY_ID_COLUMN);
        let ids: Vec<_> = merged
            .rows
            .iter()
            .map(|r| r[0].clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
    }
}
