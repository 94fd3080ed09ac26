// src/process/baseline.rs
use anyhow::{bail, Context, Result};
use csv::WriterBuilder;
use serde::Serialize;
use std::{collections::HashMap, fs::File, path::Path};
use tracing::{info, instrument};

use crate::process::split::EventGroup;
use crate::process::table::FlatTable;

/// Documented column names of the flattened MISP export. Event-level columns
/// are populated only on each group's first row.
pub mod columns {
    pub const EVENT_ID: &str = "event_id";
    pub const EVENT_DATE: &str = "date";
    pub const ORG_ID: &str = "org_id";
    pub const ORG_NAME: &str = "org_name";
    pub const ORGC_ID: &str = "orgc_id";
    pub const ORGC_NAME: &str = "orgc_name";
    pub const EVENT_INFO: &str = "event_info";
    pub const THREAT_LEVEL: &str = "threat_level_id";
    pub const TIMESTAMP: &str = "attribute_timestamp";
    pub const ATTRIBUTE_ID: &str = "attribute_id";
    pub const ATTRIBUTE_TYPE: &str = "attribute_type";
    pub const ATTRIBUTE_CATEGORY: &str = "attribute_category";
    pub const ATTRIBUTE_VALUE: &str = "attribute_value";
    pub const COUNTRY_NAME: &str = "Country Name";
    pub const LATITUDE: &str = "Latitude";
    pub const LONGITUDE: &str = "Longitude";
}

/// One per-attribute baseline row: event-level fields from the group's first
/// row paired with the attribute-level fields of each row. All access is by
/// column name; column order in the source export does not matter.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BaselineRecord {
    pub eventid: Option<String>,
    pub date: Option<String>,
    pub orgid: Option<String>,
    pub orgname: Option<String>,
    pub orgcid: Option<String>,
    pub orgcname: Option<String>,
    pub eventname: Option<String>,
    pub threatlevel: Option<String>,
    pub time: Option<String>,
    pub attribute_id: Option<String>,
    pub attribute_type: Option<String>,
    pub attribute_category: Option<String>,
    pub attribute_value: Option<String>,
    pub country_name: Option<String>,
    pub latitude: Option<String>,
    pub longitude: Option<String>,
}

/// Resolved column indexes for baseline extraction. Attribute type and value
/// must exist; everything else degrades to null when the column is absent.
struct BaselineSchema {
    event: [Option<usize>; 9],
    attr_id: Option<usize>,
    attr_type: usize,
    attr_category: Option<usize>,
    attr_value: usize,
    country: Option<usize>,
    latitude: Option<usize>,
    longitude: Option<usize>,
}

impl BaselineSchema {
    fn resolve(table: &FlatTable) -> Result<Self> {
        let Some(attr_type) = table.column_index(columns::ATTRIBUTE_TYPE) else {
            bail!("table has no {:?} column", columns::ATTRIBUTE_TYPE);
        };
        let Some(attr_value) = table.column_index(columns::ATTRIBUTE_VALUE) else {
            bail!("table has no {:?} column", columns::ATTRIBUTE_VALUE);
        };
        let event = [
            columns::EVENT_ID,
            columns::EVENT_DATE,
            columns::ORG_ID,
            columns::ORG_NAME,
            columns::ORGC_ID,
            columns::ORGC_NAME,
            columns::EVENT_INFO,
            columns::THREAT_LEVEL,
            columns::TIMESTAMP,
        ]
        .map(|name| table.column_index(name));

        Ok(Self {
            event,
            attr_id: table.column_index(columns::ATTRIBUTE_ID),
            attr_type,
            attr_category: table.column_index(columns::ATTRIBUTE_CATEGORY),
            attr_value,
            country: table.column_index(columns::COUNTRY_NAME),
            latitude: table.column_index(columns::LATITUDE),
            longitude: table.column_index(columns::LONGITUDE),
        })
    }
}

fn get(row: &[Option<String>], col: Option<usize>) -> Option<String> {
    col.and_then(|c| row.get(c)).and_then(|c| c.clone())
}

/// Project every attribute row of the given groups into `BaselineRecord`s,
/// keeping only rows whose `attribute_type` equals `attribute_type_filter`
/// (e.g. `ip-src` or `ip-dst`).
#[instrument(level = "debug", skip(groups, table), fields(groups = groups.len()))]
pub fn extract_baseline(
    groups: &[EventGroup<'_>],
    table: &FlatTable,
    attribute_type_filter: &str,
) -> Result<Vec<BaselineRecord>> {
    let schema = BaselineSchema::resolve(table)?;
    let mut records = Vec::new();

    for group in groups {
        let Some(first) = group.rows.first() else {
            continue;
        };
        let [eventid, date, orgid, orgname, orgcid, orgcname, eventname, threatlevel, time] =
            schema.event.map(|col| get(first, col));

        for row in group.rows {
            let attr_type = get(row, Some(schema.attr_type));
            if attr_type.as_deref() != Some(attribute_type_filter) {
                continue;
            }
            records.push(BaselineRecord {
                eventid: eventid.clone(),
                date: date.clone(),
                orgid: orgid.clone(),
                orgname: orgname.clone(),
                orgcid: orgcid.clone(),
                orgcname: orgcname.clone(),
                eventname: eventname.clone(),
                threatlevel: threatlevel.clone(),
                time: time.clone(),
                attribute_id: get(row, schema.attr_id),
                attribute_type: attr_type,
                attribute_category: get(row, schema.attr_category),
                attribute_value: get(row, Some(schema.attr_value)),
                country_name: get(row, schema.country),
                latitude: get(row, schema.latitude),
                longitude: get(row, schema.longitude),
            });
        }
    }

    info!(
        records = records.len(),
        attribute_type = attribute_type_filter,
        "extracted baseline records"
    );
    Ok(records)
}

/// Write baseline records to CSV for the downstream anomaly tooling.
pub fn write_baseline_csv<P: AsRef<Path>>(records: &[BaselineRecord], path: P) -> Result<()> {
    let file = File::create(&path)
        .with_context(|| format!("creating baseline file {:?}", path.as_ref()))?;
    let mut wtr = WriterBuilder::new().from_writer(file);
    for record in records {
        wtr.serialize(record)?;
    }
    wtr.flush()?;
    info!(path = %path.as_ref().display(), rows = records.len(), "wrote baseline CSV");
    Ok(())
}

/// Serialize groups back to one flat CSV by concatenating their rows in
/// order under the source header row.
pub fn write_combined_csv<P: AsRef<Path>>(
    groups: &[EventGroup<'_>],
    table: &FlatTable,
    path: P,
) -> Result<()> {
    let mut out = FlatTable::new(table.headers.clone());
    out.rows = groups
        .iter()
        .flat_map(|g| g.rows.iter().cloned())
        .collect();
    out.write_csv_path(&path)?;
    info!(path = %path.as_ref().display(), rows = out.len(), "wrote combined CSV");
    Ok(())
}

/// Count occurrences of each `attribute_value` across all groups for one
/// `attribute_type`, most frequent first (ties by value for determinism).
pub fn count_iocs(
    groups: &[EventGroup<'_>],
    table: &FlatTable,
    attribute_type_filter: &str,
) -> Result<Vec<(String, u64)>> {
    let schema = BaselineSchema::resolve(table)?;
    let mut counts: HashMap<String, u64> = HashMap::new();

    for group in groups {
        for row in group.rows {
            if get(row, Some(schema.attr_type)).as_deref() != Some(attribute_type_filter) {
                continue;
            }
            if let Some(value) = get(row, Some(schema.attr_value)) {
                *counts.entry(value).or_insert(0) += 1;
            }
        }
    }

    let mut sorted: Vec<(String, u64)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    Ok(sorted)
}
