// src/process/split.rs
use anyhow::{bail, Result};
use tracing::{debug, instrument};

use crate::process::table::{Cell, FlatTable};

/// A contiguous run of rows belonging to one event. The first row carries the
/// event-level fields (non-null anchor); the rest carry only attribute-level
/// fields. Borrows the source table, no copying.
#[derive(Debug, Clone, Copy)]
pub struct EventGroup<'a> {
    /// Index of the group's first row in the source table, kept for
    /// diagnostics.
    pub start: usize,
    pub rows: &'a [Vec<Cell>],
}

impl<'a> EventGroup<'a> {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `col` in the group's first row.
    pub fn first_cell(&self, col: usize) -> Option<&'a str> {
        self.rows
            .first()
            .and_then(|r| r.get(col))
            .and_then(|c| c.as_deref())
    }
}

/// Split a flattened export back into per-event row groups.
///
/// Every row where `anchor_column` is non-null starts a new group; rows with
/// a null anchor belong to the group opened above them. Groups partition the
/// table exactly: concatenating the result reproduces the input row for row.
///
/// A missing anchor column is a configuration error, not data to skip.
#[instrument(level = "debug", skip(table), fields(rows = table.len()))]
pub fn reconstruct<'a>(table: &'a FlatTable, anchor_column: &str) -> Result<Vec<EventGroup<'a>>> {
    let Some(anchor) = table.column_index(anchor_column) else {
        bail!("anchor column {:?} not found in table headers", anchor_column);
    };

    // Boundary scan: every non-null anchor cell opens a group.
    let mut starts: Vec<usize> = Vec::new();
    for (idx, row) in table.rows.iter().enumerate() {
        if row.get(anchor).and_then(|c| c.as_deref()).is_some() {
            starts.push(idx);
        }
    }

    // Rows above the first anchor have no group to belong to; a well-formed
    // export has none, but a truncated part file might.
    if let Some(&first) = starts.first() {
        if first != 0 {
            debug!(orphan_rows = first, "rows before first anchor are dropped");
        }
    }

    let mut groups = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(table.rows.len());
        groups.push(EventGroup {
            start,
            rows: &table.rows[start..end],
        });
    }

    debug!(groups = groups.len(), "reconstructed event groups");
    Ok(groups)
}
