// src/process/combine.rs
use anyhow::{bail, Context, Result};
use glob::glob;
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

use crate::process::table::FlatTable;

/// Numeric suffix of a part file name like `official_part_12.csv`.
/// Files without a numeric suffix are not part files.
pub(crate) fn part_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let suffix = stem.rsplit('_').next()?;
    suffix.parse().ok()
}

/// Discover `<prefix>_<n>.csv` files under `dir`, sorted by `n`.
pub fn find_part_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/{}_*.csv", dir.display(), prefix);
    let mut parts: Vec<(u64, PathBuf)> = Vec::new();
    for entry in glob(&pattern).context("invalid glob pattern for part files")? {
        let path = entry?;
        match part_number(&path) {
            Some(n) => parts.push((n, path)),
            None => debug!(path = %path.display(), "skipping non-numeric part file"),
        }
    }
    parts.sort_by_key(|(n, _)| *n);
    Ok(parts.into_iter().map(|(_, p)| p).collect())
}

/// Load every part file under `dir` and concatenate them, in numeric order,
/// into one flat table. Parts are parsed in parallel; order is restored on
/// collect. Later parts may carry extra columns (enrichment passes append
/// them), so rows are realigned by column name against the union header.
#[instrument(level = "info", skip(dir), fields(dir = %dir.display(), prefix))]
pub fn combine_parts(dir: &Path, prefix: &str) -> Result<FlatTable> {
    let files = find_part_files(dir, prefix)?;
    if files.is_empty() {
        bail!("no part files matching {}_<n>.csv in {}", prefix, dir.display());
    }
    info!(parts = files.len(), "combining part files");

    let tables: Vec<FlatTable> = files
        .par_iter()
        .map(|path| FlatTable::from_csv_path(path))
        .collect::<Result<_>>()?;

    let mut combined = FlatTable::new(Vec::new());
    for (table, path) in tables.into_iter().zip(&files) {
        debug!(path = %path.display(), rows = table.len(), "appending part");
        append_aligned(&mut combined, table);
    }

    info!(rows = combined.len(), columns = combined.headers.len(), "combined");
    Ok(combined)
}

/// Append `part` onto `combined`, realigning cells by column name. Columns
/// unknown to `combined` are added; columns absent from `part` stay null.
fn append_aligned(combined: &mut FlatTable, part: FlatTable) {
    if combined.headers.is_empty() || combined.headers == part.headers {
        if combined.headers.is_empty() {
            combined.headers = part.headers.clone();
        }
        combined.extend_from(part);
        return;
    }

    let mapping: Vec<usize> = part
        .headers
        .iter()
        .map(|h| combined.ensure_column(h))
        .collect();
    let width = combined.headers.len();
    for row in part.rows {
        let mut aligned = vec![None; width];
        for (src, cell) in row.into_iter().enumerate() {
            if let Some(&dst) = mapping.get(src) {
                aligned[dst] = cell;
            }
        }
        combined.rows.push(aligned);
    }
}

/// Forward-fill null cells in `column` with the last seen value, optionally
/// seeded with the carry-over from a previous file. Returns the last value
/// seen so a caller walking many files can chain the fill across them.
pub fn fill_down(
    table: &mut FlatTable,
    column: &str,
    initial: Option<String>,
) -> Result<Option<String>> {
    let Some(col) = table.column_index(column) else {
        bail!("fill-down column {:?} not found in table headers", column);
    };

    let mut last = initial;
    for row in &mut table.rows {
        if row.len() <= col {
            row.resize(col + 1, None);
        }
        match &row[col] {
            Some(v) => last = Some(v.clone()),
            None => row[col] = last.clone(),
        }
    }
    Ok(last)
}
