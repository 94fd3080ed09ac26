use anyhow::Result;
use chrono::Utc;
use intelscraper::{
    config::PipelineConfig,
    fetch::{self, cisa, epss, geoip, misp, vt},
    pipeline,
    process::combine::{combine_parts, fill_down},
};
use std::{env, fs};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,intelscraper=info"));
    fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();
    info!("startup");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("panic: {:?}", info);
    }));

    // ─── 2) load config ──────────────────────────────────────────────
    let cfg_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "intelscraper.yaml".to_string());
    let cfg = PipelineConfig::load(&cfg_path)?;
    fs::create_dir_all(&cfg.out_dir)?;
    info!(config = %cfg_path, data_dir = %cfg.data_dir.display(), "config loaded");

    let client = fetch::build_client()?;

    // ─── 3) sync CISA advisories ─────────────────────────────────────
    if let Some(path) = &cfg.enrichment.cisa_local_path {
        match cisa::sync_advisories(&client, &cfg.enrichment.cisa_master_url, path).await {
            Ok(table) => info!(rows = table.len(), "CISA advisories up to date"),
            Err(e) => error!("CISA sync failed: {:#}", e),
        }
    }

    // ─── 4) import MISP export into part files ───────────────────────
    if let Some(export) = cfg.misp_export_path.clone() {
        let cfg = cfg.clone();
        let imported = tokio::task::spawn_blocking(move || {
            misp::import_export(&export, &cfg.data_dir, &cfg.part_prefix, cfg.rows_per_part)
        })
        .await?;
        match imported {
            Ok(n) => info!(events = n, "MISP export imported"),
            Err(e) => error!("MISP import failed: {:#}", e),
        }
    }

    // ─── 5) combine part files ───────────────────────────────────────
    let mut table = {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || {
            let mut table = combine_parts(&cfg.data_dir, &cfg.part_prefix)?;
            for column in &cfg.fill_down_columns {
                if table.column_index(column).is_some() {
                    fill_down(&mut table, column, None)?;
                } else {
                    warn!(column = %column, "fill-down column missing, skipping");
                }
            }
            Ok::<_, anyhow::Error>(table)
        })
        .await??
    };

    // ─── 6) enrichment passes ────────────────────────────────────────
    if let Err(e) = epss::enrich(
        &client,
        &cfg.enrichment.epss_url,
        cfg.enrichment.epss_batch_size,
        &mut table,
    )
    .await
    {
        error!("EPSS enrichment failed: {:#}", e);
    }

    match env::var("FINDIP_TOKEN") {
        Ok(token) => {
            if let Err(e) =
                geoip::enrich(&client, &cfg.enrichment.findip_base_url, &token, &mut table).await
            {
                error!("geolocation enrichment failed: {:#}", e);
            }
        }
        Err(_) => info!("FINDIP_TOKEN not set; skipping geolocation"),
    }

    match env::var("VT_API_KEY") {
        Ok(key) => {
            match vt::enrich(&client, &cfg.enrichment.virustotal_base_url, &key, &mut table).await
            {
                Ok((updated, true)) => {
                    warn!(updated, "VirusTotal pass stopped early on quota")
                }
                Ok((updated, false)) => info!(updated, "VirusTotal pass complete"),
                Err(e) => error!("VirusTotal enrichment failed: {:#}", e),
            }
        }
        Err(_) => info!("VT_API_KEY not set; skipping VirusTotal"),
    }

    // ─── 7) reconstruct, filter, export ──────────────────────────────
    let reference = Utc::now().date_naive();
    let summary = {
        let cfg = cfg.clone();
        tokio::task::spawn_blocking(move || pipeline::run(&cfg, &table, reference)).await??
    };

    // ─── 8) report ───────────────────────────────────────────────────
    info!(
        events = summary.events,
        recent = summary.recent_events,
        "pipeline done"
    );
    for (attr_type, rows) in &summary.baseline_rows {
        info!(attr_type = %attr_type, rows, "baseline written");
    }

    Ok(())
}
