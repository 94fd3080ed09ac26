// src/pipeline.rs
//! The offline half of the run: reconstruct event groups from the combined
//! table, filter them by recency, and export the combined and baseline CSVs.

use anyhow::Result;
use chrono::NaiveDate;
use tracing::{debug, info, instrument};

use crate::config::PipelineConfig;
use crate::process::baseline::{count_iocs, extract_baseline, write_baseline_csv, write_combined_csv};
use crate::process::dates::filter_recent;
use crate::process::split::reconstruct;
use crate::process::table::FlatTable;

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    /// Event groups reconstructed from the combined table.
    pub events: usize,
    /// Groups inside the recency window.
    pub recent_events: usize,
    /// Baseline rows written per attribute type.
    pub baseline_rows: Vec<(String, usize)>,
}

/// Reconstruct, filter and export. The full (unfiltered) group set goes to
/// `combined_final.csv` for the dashboards; baselines are built from the
/// recent groups only.
#[instrument(level = "info", skip(cfg, table), fields(rows = table.len()))]
pub fn run(cfg: &PipelineConfig, table: &FlatTable, reference: NaiveDate) -> Result<RunSummary> {
    let groups = reconstruct(table, &cfg.anchor_column)?;
    let recent = filter_recent(
        groups.clone(),
        table,
        &cfg.date_column,
        cfg.window_months,
        reference,
        cfg.missing_date_policy,
    )?;
    info!(events = groups.len(), recent = recent.len(), "event groups ready");

    write_combined_csv(&groups, table, cfg.out_dir.join("combined_final.csv"))?;

    let mut baseline_rows = Vec::with_capacity(cfg.baseline_types.len());
    for attr_type in &cfg.baseline_types {
        let records = extract_baseline(&recent, table, attr_type)?;
        let path = cfg.out_dir.join(format!("preprocess-{attr_type}.csv"));
        write_baseline_csv(&records, &path)?;

        for (value, count) in count_iocs(&recent, table, attr_type)?.into_iter().take(5) {
            debug!(attr_type = %attr_type, value = %value, count, "frequent IOC");
        }
        baseline_rows.push((attr_type.clone(), records.len()));
    }

    Ok(RunSummary {
        events: groups.len(),
        recent_events: recent.len(),
        baseline_rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use tempfile::tempdir;

    fn sample_table() -> FlatTable {
        FlatTable::from_csv_reader(
            "\
event_id,date,org_id,org_name,orgc_id,orgc_name,event_info,threat_level_id,attribute_timestamp,attribute_id,attribute_type,attribute_category,attribute_value
E1,01/01/2024,10,OrgA,11,OrgAC,old event,2,1,a1,ip-src,Network activity,10.0.0.1
,,,,,,,,2,a2,ip-src,Network activity,10.0.0.2
E2,2024-08-01,20,OrgB,21,OrgBC,recent event,3,3,b1,ip-src,Network activity,10.0.0.9
,,,,,,,,4,b2,ip-dst,Network activity,10.0.0.10
"
            .as_bytes(),
        )
        .unwrap()
    }

    #[test]
    fn exports_combined_and_recent_baselines() -> Result<()> {
        let dir = tempdir()?;
        let cfg = PipelineConfig {
            out_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let table = sample_table();
        let reference = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();

        let summary = run(&cfg, &table, reference)?;
        assert_eq!(summary.events, 2);
        assert_eq!(summary.recent_events, 1);
        // E1 is outside the 6-month window, so only E2's rows reach baselines
        assert_eq!(
            summary.baseline_rows,
            vec![("ip-src".to_string(), 1), ("ip-dst".to_string(), 1)]
        );

        // combined export carries every row of every group
        let combined = FlatTable::from_csv_path(dir.path().join("combined_final.csv"))?;
        assert_eq!(combined.len(), table.len());

        let baseline = FlatTable::from_csv_path(dir.path().join("preprocess-ip-src.csv"))?;
        assert_eq!(baseline.len(), 1);
        Ok(())
    }
}
