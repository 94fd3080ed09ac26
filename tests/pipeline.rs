use anyhow::Result;
use chrono::NaiveDate;
use intelscraper::{
    config::PipelineConfig,
    pipeline,
    process::{
        combine::{combine_parts, fill_down},
        dates::MissingDatePolicy,
        table::FlatTable,
    },
};
use std::fs;
use tempfile::tempdir;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

fn init_test_logging() {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,intelscraper=debug")),
        )
        .with_test_writer()
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

const HEADER: &str = "event_id,date,org_id,org_name,orgc_id,orgc_name,event_info,threat_level_id,attribute_timestamp,attribute_id,attribute_type,attribute_category,attribute_value";

#[test]
fn combine_reconstruct_filter_baseline_end_to_end() -> Result<()> {
    init_test_logging();

    let data_dir = tempdir()?;
    let out_dir = tempdir()?;

    // Two part files; the second one cuts event E2 in half, which the
    // combiner must stitch back together before reconstruction.
    fs::write(
        data_dir.path().join("official_part_1.csv"),
        format!(
            "{HEADER}\n\
             E1,01/01/2023,10,OrgA,11,OrgAC,stale campaign,2,100,a1,ip-src,Network activity,203.0.113.5\n\
             ,,,,,,,,,a2,ip-dst,Network activity,203.0.113.6\n\
             E2,2024-08-01,20,OrgB,21,OrgBC,fresh campaign,3,200,b1,ip-src,Network activity,198.51.100.7\n"
        ),
    )?;
    fs::write(
        data_dir.path().join("official_part_2.csv"),
        format!(
            "{HEADER}\n\
             ,,,,,,,,,b2,ip-src,Network activity,198.51.100.8\n\
             E3,,30,OrgC,31,OrgCC,undated event,1,,c1,ip-src,Network activity,192.0.2.9\n"
        ),
    )?;

    let cfg = PipelineConfig {
        data_dir: data_dir.path().to_path_buf(),
        out_dir: out_dir.path().to_path_buf(),
        ..PipelineConfig::default()
    };

    let mut table = combine_parts(&cfg.data_dir, &cfg.part_prefix)?;
    assert_eq!(table.len(), 5);
    fill_down(&mut table, "attribute_timestamp", None)?;
    // E2's attribute row inherited the last timestamp before the file cut
    assert_eq!(table.cell(3, 8), Some("200"));

    let reference = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
    let summary = pipeline::run(&cfg, &table, reference)?;

    // E1 is 20 months old, E2 is 1 month old, E3 has no date (dropped)
    assert_eq!(summary.events, 3);
    assert_eq!(summary.recent_events, 1);

    // combined export reproduces the full table (partition property)
    let combined = FlatTable::from_csv_path(out_dir.path().join("combined_final.csv"))?;
    assert_eq!(combined.len(), 5);

    // only E2's ip-src rows reach the baseline
    let ip_src = FlatTable::from_csv_path(out_dir.path().join("preprocess-ip-src.csv"))?;
    assert_eq!(ip_src.len(), 2);
    let value_col = ip_src.column_index("attribute_value").unwrap();
    let event_col = ip_src.column_index("eventid").unwrap();
    assert_eq!(ip_src.cell(0, value_col), Some("198.51.100.7"));
    assert_eq!(ip_src.cell(1, value_col), Some("198.51.100.8"));
    assert_eq!(ip_src.cell(1, event_col), Some("E2"));

    let ip_dst = FlatTable::from_csv_path(out_dir.path().join("preprocess-ip-dst.csv"))?;
    assert!(ip_dst.is_empty());
    Ok(())
}

#[test]
fn keep_policy_retains_undated_events() -> Result<()> {
    init_test_logging();

    let data_dir = tempdir()?;
    let out_dir = tempdir()?;
    fs::write(
        data_dir.path().join("official_part_1.csv"),
        format!(
            "{HEADER}\n\
             E1,,10,OrgA,11,OrgAC,undated,2,100,a1,ip-src,Network activity,203.0.113.5\n"
        ),
    )?;

    let cfg = PipelineConfig {
        data_dir: data_dir.path().to_path_buf(),
        out_dir: out_dir.path().to_path_buf(),
        missing_date_policy: MissingDatePolicy::Keep,
        ..PipelineConfig::default()
    };

    let table = combine_parts(&cfg.data_dir, &cfg.part_prefix)?;
    let reference = NaiveDate::from_ymd_opt(2024, 9, 1).unwrap();
    let summary = pipeline::run(&cfg, &table, reference)?;
    assert_eq!(summary.recent_events, 1);
    assert_eq!(summary.baseline_rows[0], ("ip-src".to_string(), 1));
    Ok(())
}
