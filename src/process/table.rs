// src/process/table.rs
use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use std::{
    fs::File,
    io::{Read, Write},
    path::Path,
};
use tracing::warn;

/// A single cell: `None` means the field was empty in the source CSV.
pub type Cell = Option<String>;

/// An ordered table of nullable string cells with a fixed header row.
/// This is the shape every part file, advisory export and baseline CSV
/// shares: event-level columns are populated only on the first row of an
/// event, attribute-level columns on every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlatTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Cell>>,
}

impl FlatTable {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Cell value at (row, column index); `None` for null cells or
    /// short rows (flexible CSV input may yield ragged records).
    pub fn cell(&self, row: usize, col: usize) -> Option<&str> {
        self.rows
            .get(row)
            .and_then(|r| r.get(col))
            .and_then(|c| c.as_deref())
    }

    /// Append a column filled with nulls if no column of that name exists.
    /// Returns the column's index either way.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(idx) = self.column_index(name) {
            return idx;
        }
        self.headers.push(name.to_string());
        for row in &mut self.rows {
            row.resize(self.headers.len(), None);
        }
        self.headers.len() - 1
    }

    pub fn set_cell(&mut self, row: usize, col: usize, value: String) {
        if let Some(r) = self.rows.get_mut(row) {
            if r.len() <= col {
                r.resize(col + 1, None);
            }
            r[col] = Some(value);
        }
    }

    /// Append all rows of `other`. Headers must already agree; callers that
    /// combine part files check this up front.
    pub fn extend_from(&mut self, other: FlatTable) {
        self.rows.extend(other.rows);
    }

    /// Parse a CSV blob. The first record is the header row; empty fields
    /// become `None`. `flexible` so ragged exports still load.
    pub fn from_csv_reader<R: Read>(rdr: R) -> Result<Self> {
        let mut csv = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(rdr);

        let mut headers: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Cell>> = Vec::new();

        for (idx, result) in csv.records().enumerate() {
            let record = result.with_context(|| format!("CSV parse error at record {}", idx))?;
            if idx == 0 {
                headers = record.iter().map(|s| s.trim().to_string()).collect();
                continue;
            }
            let row: Vec<Cell> = record
                .iter()
                .map(|s| {
                    let t = s.trim();
                    if t.is_empty() {
                        None
                    } else {
                        Some(t.to_string())
                    }
                })
                .collect();
            rows.push(row);
        }

        Ok(Self { headers, rows })
    }

    pub fn from_csv_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file =
            File::open(&path).with_context(|| format!("opening CSV file {:?}", path.as_ref()))?;
        Self::from_csv_reader(file)
            .with_context(|| format!("parsing CSV file {:?}", path.as_ref()))
    }

    /// Serialize back to CSV; null cells become empty fields. Short rows are
    /// padded out to the header width; rows wider than the header are written
    /// in full, since a flexible source file can legitimately carry them.
    pub fn write_csv<W: Write>(&self, wtr: W) -> Result<()> {
        let mut csv = WriterBuilder::new().flexible(true).from_writer(wtr);
        csv.write_record(&self.headers)?;
        let mut wide = 0usize;
        for row in &self.rows {
            let mut record: Vec<&str> = row.iter().map(|c| c.as_deref().unwrap_or("")).collect();
            if record.len() > self.headers.len() {
                wide += 1;
            } else {
                record.resize(self.headers.len(), "");
            }
            csv.write_record(&record)?;
        }
        if wide > 0 {
            warn!(rows = wide, "rows wider than the header row were written unpadded");
        }
        csv.flush()?;
        Ok(())
    }

    pub fn write_csv_path<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(&path)
            .with_context(|| format!("creating CSV file {:?}", path.as_ref()))?;
        self.write_csv(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell(s: &str) -> Cell {
        if s.is_empty() {
            None
        } else {
            Some(s.to_string())
        }
    }

    #[test]
    fn parses_empty_fields_as_null() -> Result<()> {
        let data = "event_id,date,attribute_value\n1,01/01/2024,10.0.0.1\n,,10.0.0.2\n";
        let table = FlatTable::from_csv_reader(data.as_bytes())?;
        assert_eq!(table.headers, vec!["event_id", "date", "attribute_value"]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.cell(0, 0), Some("1"));
        assert_eq!(table.cell(1, 0), None);
        assert_eq!(table.cell(1, 2), Some("10.0.0.2"));
        Ok(())
    }

    #[test]
    fn round_trips_through_csv() -> Result<()> {
        let mut table = FlatTable::new(vec!["a".into(), "b".into()]);
        table.rows.push(vec![cell("1"), cell("x")]);
        table.rows.push(vec![None, cell("y")]);

        let mut buf = Vec::new();
        table.write_csv(&mut buf)?;
        let again = FlatTable::from_csv_reader(buf.as_slice())?;
        assert_eq!(again, table);
        Ok(())
    }

    #[test]
    fn wide_rows_are_not_truncated() -> Result<()> {
        let mut table = FlatTable::new(vec!["a".into()]);
        table.rows.push(vec![cell("1"), cell("extra")]);

        let mut buf = Vec::new();
        table.write_csv(&mut buf)?;
        let again = FlatTable::from_csv_reader(buf.as_slice())?;
        assert_eq!(again.cell(0, 1), Some("extra"));
        Ok(())
    }

    #[test]
    fn ensure_column_pads_existing_rows() {
        let mut table = FlatTable::new(vec!["a".into()]);
        table.rows.push(vec![cell("1")]);
        let idx = table.ensure_column("EPSS Scores");
        assert_eq!(idx, 1);
        assert_eq!(table.rows[0].len(), 2);
        assert_eq!(table.cell(0, 1), None);
        // second call is a no-op
        assert_eq!(table.ensure_column("EPSS Scores"), 1);
    }

    #[test]
    fn missing_column_lookup() {
        let table = FlatTable::new(vec!["event_id".into()]);
        assert_eq!(table.column_index("event_id"), Some(0));
        assert_eq!(table.column_index("date"), None);
    }
}
