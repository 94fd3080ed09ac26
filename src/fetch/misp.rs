// src/fetch/misp.rs
//! Flattening of MISP event JSON into the part-file layout: the first row of
//! each event carries the event-level columns, every attribute gets its own
//! row with the event-level columns left null. This is the producer of the
//! anchor/null structure the reconstructor later undoes.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path};
use tracing::{info, instrument};

use crate::process::baseline::columns;
use crate::process::combine::{find_part_files, part_number};
use crate::process::table::{Cell, FlatTable};

#[derive(Debug, Clone, Deserialize)]
pub struct MispExportItem {
    #[serde(rename = "Event")]
    pub event: MispEvent,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MispEvent {
    pub id: String,
    pub date: Option<String>,
    #[serde(rename = "Org")]
    pub org: Option<MispOrg>,
    #[serde(rename = "Orgc")]
    pub orgc: Option<MispOrg>,
    pub info: Option<String>,
    pub threat_level_id: Option<String>,
    pub timestamp: Option<String>,
    #[serde(rename = "Attributes", default)]
    pub attributes: Vec<MispAttribute>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MispOrg {
    pub id: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MispAttribute {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub attr_type: Option<String>,
    pub category: Option<String>,
    pub value: Option<String>,
    pub timestamp: Option<String>,
}

/// Column order of the flattened export.
pub fn flat_headers() -> Vec<String> {
    [
        columns::EVENT_ID,
        columns::EVENT_DATE,
        columns::ORG_ID,
        columns::ORG_NAME,
        columns::ORGC_ID,
        columns::ORGC_NAME,
        columns::EVENT_INFO,
        columns::THREAT_LEVEL,
        columns::TIMESTAMP,
        columns::ATTRIBUTE_ID,
        columns::ATTRIBUTE_TYPE,
        columns::ATTRIBUTE_CATEGORY,
        columns::ATTRIBUTE_VALUE,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub fn parse_export(json: &str) -> Result<Vec<MispExportItem>> {
    serde_json::from_str(json).context("parsing MISP event export JSON")
}

/// Flatten events into one table. Each event contributes one anchor row plus
/// one row per attribute; an event with no attributes is just its anchor row.
#[instrument(level = "debug", skip(events), fields(events = events.len()))]
pub fn flatten_events(events: &[MispExportItem]) -> FlatTable {
    let mut table = FlatTable::new(flat_headers());

    for item in events {
        let ev = &item.event;
        let org = ev.org.as_ref();
        let orgc = ev.orgc.as_ref();
        let mut anchor: Vec<Cell> = vec![
            Some(ev.id.clone()),
            ev.date.clone(),
            org.and_then(|o| o.id.clone()),
            org.and_then(|o| o.name.clone()),
            orgc.and_then(|o| o.id.clone()),
            orgc.and_then(|o| o.name.clone()),
            ev.info.clone(),
            ev.threat_level_id.clone(),
            ev.timestamp.clone(),
        ];
        anchor.resize(table.headers.len(), None);
        table.rows.push(anchor);

        for attr in &ev.attributes {
            table.rows.push(vec![
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                None,
                attr.timestamp.clone(),
                attr.id.clone(),
                attr.attr_type.clone(),
                attr.category.clone(),
                attr.value.clone(),
            ]);
        }
    }

    info!(rows = table.len(), "flattened MISP events");
    table
}

/// Largest numeric event id present in a flattened table; the resume point
/// for the next incremental pull. Non-numeric ids are ignored.
pub fn latest_event_id(table: &FlatTable) -> Option<u64> {
    let col = table.column_index(columns::EVENT_ID)?;
    table
        .rows
        .iter()
        .filter_map(|r| r.get(col).and_then(|c| c.as_deref()))
        .filter_map(|v| v.parse::<u64>().ok())
        .max()
}

/// Split a table into row chunks of at most `rows_per_part`, preserving
/// order. Chunks cut mid-event on purpose: part files have always been plain
/// row windows, and the combiner glues them back before reconstruction.
pub fn chunk_rows(table: &FlatTable, rows_per_part: usize) -> Vec<FlatTable> {
    table
        .rows
        .chunks(rows_per_part.max(1))
        .map(|chunk| FlatTable {
            headers: table.headers.clone(),
            rows: chunk.to_vec(),
        })
        .collect()
}

/// Import a MISP export JSON into the part-file directory. Only events past
/// the resume point (the largest event id in the newest existing part) are
/// flattened; output parts continue the existing numbering. Returns the
/// number of events imported.
#[instrument(level = "info", skip(export_path, data_dir), fields(export = %export_path.as_ref().display()))]
pub fn import_export(
    export_path: impl AsRef<Path>,
    data_dir: &Path,
    prefix: &str,
    rows_per_part: usize,
) -> Result<usize> {
    let json = fs::read_to_string(&export_path)
        .with_context(|| format!("reading MISP export {:?}", export_path.as_ref()))?;
    let events = parse_export(&json)?;

    let parts = find_part_files(data_dir, prefix)?;
    let resume = match parts.last() {
        Some(last) => latest_event_id(&FlatTable::from_csv_path(last)?),
        None => None,
    };
    let next_part = parts
        .last()
        .and_then(|p| part_number(p))
        .map(|n| n + 1)
        .unwrap_or(1);

    let new_events: Vec<MispExportItem> = events
        .into_iter()
        .filter(|item| match (resume, item.event.id.parse::<u64>()) {
            (Some(max), Ok(id)) => id > max,
            (Some(_), Err(_)) => false,
            (None, _) => true,
        })
        .collect();
    if new_events.is_empty() {
        info!(resume = ?resume, "no events past the resume point");
        return Ok(0);
    }

    let table = flatten_events(&new_events);
    fs::create_dir_all(data_dir)
        .with_context(|| format!("creating part directory {:?}", data_dir))?;
    for (offset, chunk) in chunk_rows(&table, rows_per_part).iter().enumerate() {
        let path = data_dir.join(format!("{}_{}.csv", prefix, next_part + offset as u64));
        chunk.write_csv_path(&path)?;
        info!(path = %path.display(), rows = chunk.len(), "wrote part file");
    }
    info!(events = new_events.len(), resume = ?resume, "imported MISP events");
    Ok(new_events.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"Event": {
            "id": "101",
            "date": "2024-08-01",
            "Org": {"id": "10", "name": "OrgA"},
            "Orgc": {"id": "11", "name": "OrgAC"},
            "info": "phishing wave",
            "threat_level_id": "2",
            "Attributes": [
                {"id": "a1", "type": "ip-src", "category": "Network activity",
                 "value": "10.0.0.1", "timestamp": "1700000000"},
                {"id": "a2", "type": "ip-dst", "category": "Network activity",
                 "value": "10.0.0.2", "timestamp": "1700000001"}
            ]
        }},
        {"Event": {
            "id": "102",
            "date": "2024-08-02",
            "info": "empty event",
            "threat_level_id": "3",
            "Attributes": []
        }}
    ]"#;

    #[test]
    fn flattens_anchor_plus_attribute_rows() -> Result<()> {
        let events = parse_export(SAMPLE)?;
        let table = flatten_events(&events);

        // event 101: anchor + 2 attributes; event 102: anchor only
        assert_eq!(table.len(), 4);
        assert_eq!(table.cell(0, 0), Some("101"));
        assert_eq!(table.cell(0, 6), Some("phishing wave"));
        assert_eq!(table.cell(1, 0), None);
        assert_eq!(table.cell(1, 12), Some("10.0.0.1"));
        assert_eq!(table.cell(2, 12), Some("10.0.0.2"));
        assert_eq!(table.cell(3, 0), Some("102"));
        Ok(())
    }

    #[test]
    fn flattened_output_reconstructs_cleanly() -> Result<()> {
        use crate::process::split::reconstruct;
        let table = flatten_events(&parse_export(SAMPLE)?);
        let groups = reconstruct(&table, columns::EVENT_ID)?;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 3);
        assert_eq!(groups[1].len(), 1);
        Ok(())
    }

    #[test]
    fn resume_point_is_max_numeric_id() -> Result<()> {
        let table = flatten_events(&parse_export(SAMPLE)?);
        assert_eq!(latest_event_id(&table), Some(102));
        Ok(())
    }

    const NEWER: &str = r#"[
        {"Event": {
            "id": "102",
            "date": "2024-08-02",
            "info": "already known",
            "threat_level_id": "3"
        }},
        {"Event": {
            "id": "103",
            "date": "2024-08-10",
            "info": "brand new",
            "threat_level_id": "1",
            "Attributes": [
                {"id": "c1", "type": "ip-src", "category": "Network activity",
                 "value": "198.51.100.3", "timestamp": "1700000100"}
            ]
        }}
    ]"#;

    #[test]
    fn import_skips_known_events_and_continues_numbering() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // existing part already holds events 101 and 102
        flatten_events(&parse_export(SAMPLE)?)
            .write_csv_path(dir.path().join("official_part_1.csv"))?;
        let export = dir.path().join("export.json");
        fs::write(&export, NEWER)?;

        let imported = import_export(&export, dir.path(), "official_part", 10_000)?;
        assert_eq!(imported, 1);

        let part = FlatTable::from_csv_path(dir.path().join("official_part_2.csv"))?;
        // event 103 only: one anchor row plus one attribute row
        assert_eq!(part.len(), 2);
        assert_eq!(part.cell(0, 0), Some("103"));
        assert_eq!(part.cell(1, 12), Some("198.51.100.3"));
        Ok(())
    }

    #[test]
    fn import_into_empty_directory_takes_everything() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let export = dir.path().join("export.json");
        fs::write(&export, SAMPLE)?;

        let imported = import_export(&export, dir.path(), "official_part", 10_000)?;
        assert_eq!(imported, 2);
        let part = FlatTable::from_csv_path(dir.path().join("official_part_1.csv"))?;
        assert_eq!(part.len(), 4);
        Ok(())
    }

    #[test]
    fn import_with_nothing_new_writes_no_parts() -> Result<()> {
        let dir = tempfile::tempdir()?;
        flatten_events(&parse_export(SAMPLE)?)
            .write_csv_path(dir.path().join("official_part_1.csv"))?;
        let export = dir.path().join("export.json");
        fs::write(&export, SAMPLE)?;

        assert_eq!(import_export(&export, dir.path(), "official_part", 10_000)?, 0);
        assert!(!dir.path().join("official_part_2.csv").exists());
        Ok(())
    }

    #[test]
    fn chunks_are_plain_row_windows() -> Result<()> {
        let table = flatten_events(&parse_export(SAMPLE)?);
        let parts = chunk_rows(&table, 3);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].len(), 3);
        assert_eq!(parts[1].len(), 1);
        // second part starts with the next event's anchor here, but a cut
        // mid-event is equally legal
        assert_eq!(parts[1].cell(0, 0), Some("102"));
        Ok(())
    }
}
