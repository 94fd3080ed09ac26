// src/process/dates.rs
use anyhow::{bail, Result};
use chrono::{Datelike, NaiveDate};
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::process::split::EventGroup;
use crate::process::table::FlatTable;

/// What to do with a group whose first row has no date at all. The original
/// export pipeline dropped such groups as a side effect of control flow; this
/// makes the choice explicit and configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingDatePolicy {
    /// Exclude undated groups (matches the historical behaviour).
    #[default]
    Drop,
    /// Treat undated groups as "not old" and retain them.
    Keep,
}

/// Parse an event date in either accepted textual format, `DD/MM/YYYY`
/// first, falling back to `YYYY-MM-DD`.
pub fn parse_event_date(s: &str) -> Option<NaiveDate> {
    let s = s.trim();
    NaiveDate::parse_from_str(s, "%d/%m/%Y")
        .or_else(|_| NaiveDate::parse_from_str(s, "%Y-%m-%d"))
        .ok()
}

/// Whole calendar months elapsed from `date` to `reference`, computed from
/// the calendar components (`years*12 + months`), not days/30. A month is
/// only counted once the day-of-month has been reached, so 2024-03-16 to
/// 2024-09-15 is 5 months, not 6. Future dates mirror past ones: the result
/// is the negation of the elapsed months measured in the other direction,
/// so a date later in the same month as `reference` is still 0.
pub fn elapsed_months(reference: NaiveDate, date: NaiveDate) -> i32 {
    if date > reference {
        return -elapsed_months(date, reference);
    }
    let mut months = (reference.year() - date.year()) * 12
        + (reference.month() as i32 - date.month() as i32);
    if reference.day() < date.day() {
        months -= 1;
    }
    months
}

/// Keep only groups whose event date is strictly newer than
/// `max_age_months` whole months before `reference`. The date is read from
/// `date_column` of each group's first row. Unparseable dates are logged
/// with the group's row index and the group excluded; missing dates follow
/// `policy`. Input order is preserved.
#[instrument(level = "debug", skip(groups, table), fields(groups = groups.len()))]
pub fn filter_recent<'a>(
    groups: Vec<EventGroup<'a>>,
    table: &FlatTable,
    date_column: &str,
    max_age_months: i32,
    reference: NaiveDate,
    policy: MissingDatePolicy,
) -> Result<Vec<EventGroup<'a>>> {
    let Some(date_col) = table.column_index(date_column) else {
        bail!("date column {:?} not found in table headers", date_column);
    };

    let total = groups.len();
    let mut kept = Vec::new();

    for group in groups {
        let Some(raw) = group.first_cell(date_col) else {
            if policy == MissingDatePolicy::Keep {
                kept.push(group);
            }
            continue;
        };
        let Some(date) = parse_event_date(raw) else {
            warn!(row = group.start, value = raw, "unparseable event date, group excluded");
            continue;
        };
        if elapsed_months(reference, date) < max_age_months {
            kept.push(group);
        }
    }

    info!(kept = kept.len(), total, "filtered event groups by date");
    Ok(kept)
}
