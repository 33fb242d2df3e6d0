use anyhow::{anyhow, bail, Result};
use hems_service::{
    batch::{self, DataClass},
    config::AppConfig,
    observability,
};
use std::{env, path::PathBuf};
use time::OffsetDateTime;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!("usage: backfill_energy <consumption|generation|market_price> [csv_file_path]");
    }
    let class: DataClass = args[1].parse().map_err(|e: String| anyhow!(e))?;

    // Load configuration (can point HEMS_CONFIG to a backfill-specific file).
    let cfg = AppConfig::load()?;
    let path = args
        .get(2)
        .map(PathBuf::from)
        .unwrap_or_else(|| class.config(&cfg.batch).path.clone());

    let store = cfg.store.connect()?;
    let report = batch::load_class(store, &cfg.batch, class, &path, OffsetDateTime::now_utc()).await?;

    println!("{}", serde_json::json!({
        "class": class.name(),
        "path": path.display().to_string(),
        "written": report.written,
        "skipped": report.skipped,
        "failed_points": report.failed_points,
        "out_of_window_batches": report.out_of_window_batches,
    }));

    Ok(())
}
