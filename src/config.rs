// src/config.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::process::dates::MissingDatePolicy;

/// Pipeline configuration, loaded from a YAML file. Everything the original
/// scripts kept as module-level globals (directories, column names, window
/// sizes, endpoints) lives here; API keys stay in the environment
/// (`FINDIP_TOKEN`, `VT_API_KEY`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Directory holding the flattened MISP part files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Part file prefix; files are `<prefix>_<n>.csv`.
    #[serde(default = "default_part_prefix")]
    pub part_prefix: String,
    /// MISP export JSON to flatten into new part files; None disables the pass.
    #[serde(default)]
    pub misp_export_path: Option<PathBuf>,
    /// Maximum data rows per part file written during import.
    #[serde(default = "default_rows_per_part")]
    pub rows_per_part: usize,
    /// Directory for combined and baseline outputs.
    #[serde(default = "default_out_dir")]
    pub out_dir: PathBuf,
    /// Column whose non-null value marks the first row of an event group.
    #[serde(default = "default_anchor_column")]
    pub anchor_column: String,
    /// Column holding the event date on each group's first row.
    #[serde(default = "default_date_column")]
    pub date_column: String,
    /// Recency window in whole calendar months.
    #[serde(default = "default_window_months")]
    pub window_months: i32,
    #[serde(default)]
    pub missing_date_policy: MissingDatePolicy,
    /// Attribute types to project into baseline CSVs.
    #[serde(default = "default_baseline_types")]
    pub baseline_types: Vec<String>,
    /// Columns to forward-fill after combining parts.
    #[serde(default = "default_fill_down_columns")]
    pub fill_down_columns: Vec<String>,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentConfig {
    /// Master CISA ICS advisory CSV (ICS-Advisory-Project mirror).
    #[serde(default = "default_cisa_url")]
    pub cisa_master_url: String,
    /// Local advisory CSV to merge new rows into; None disables the pass.
    #[serde(default)]
    pub cisa_local_path: Option<PathBuf>,
    #[serde(default = "default_epss_url")]
    pub epss_url: String,
    #[serde(default = "default_epss_batch")]
    pub epss_batch_size: usize,
    #[serde(default = "default_findip_url")]
    pub findip_base_url: String,
    #[serde(default = "default_vt_url")]
    pub virustotal_base_url: String,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            cisa_master_url: default_cisa_url(),
            cisa_local_path: None,
            epss_url: default_epss_url(),
            epss_batch_size: default_epss_batch(),
            findip_base_url: default_findip_url(),
            virustotal_base_url: default_vt_url(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            part_prefix: default_part_prefix(),
            misp_export_path: None,
            rows_per_part: default_rows_per_part(),
            out_dir: default_out_dir(),
            anchor_column: default_anchor_column(),
            date_column: default_date_column(),
            window_months: default_window_months(),
            missing_date_policy: MissingDatePolicy::default(),
            baseline_types: default_baseline_types(),
            fill_down_columns: default_fill_down_columns(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {:?}", path))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config file {:?}", path))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("official")
}
fn default_part_prefix() -> String {
    "official_part".to_string()
}
fn default_rows_per_part() -> usize {
    10_000
}
fn default_out_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_anchor_column() -> String {
    "event_id".to_string()
}
fn default_date_column() -> String {
    "date".to_string()
}
fn default_window_months() -> i32 {
    6
}
fn default_baseline_types() -> Vec<String> {
    vec!["ip-src".to_string(), "ip-dst".to_string()]
}
fn default_fill_down_columns() -> Vec<String> {
    vec!["attribute_timestamp".to_string()]
}
fn default_cisa_url() -> String {
    "https://raw.githubusercontent.com/icsadvprj/ICS-Advisory-Project/main/ICS-CERT_ADV/CISA_ICS_ADV_Master.csv".to_string()
}
fn default_epss_url() -> String {
    "https://api.first.org/data/v1/epss".to_string()
}
fn default_epss_batch() -> usize {
    50
}
fn default_findip_url() -> String {
    "https://api.findip.net".to_string()
}
fn default_vt_url() -> String {
    "https://www.virustotal.com/api/v3".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_file_falls_back_to_defaults() -> Result<()> {
        let cfg = PipelineConfig::load("does/not/exist.yaml")?;
        assert_eq!(cfg.anchor_column, "event_id");
        assert_eq!(cfg.window_months, 6);
        assert_eq!(cfg.missing_date_policy, MissingDatePolicy::Drop);
        Ok(())
    }

    #[test]
    fn partial_yaml_overrides_defaults() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(
            file,
            "window_months: 12\nmissing_date_policy: keep\npart_prefix: feed_part"
        )?;
        let cfg = PipelineConfig::load(file.path())?;
        assert_eq!(cfg.window_months, 12);
        assert_eq!(cfg.missing_date_policy, MissingDatePolicy::Keep);
        assert_eq!(cfg.part_prefix, "feed_part");
        // untouched fields keep defaults
        assert_eq!(cfg.date_column, "date");
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "window_month: 12")?;
        assert!(PipelineConfig::load(file.path()).is_err());
        Ok(())
    }
}
