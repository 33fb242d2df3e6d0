use anyhow::Result;
use hems_service::{config::AppConfig, observability, ForecastEngine};
use time::OffsetDateTime;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;
    let store = cfg.store.connect()?;

    let engine = ForecastEngine::new(store, cfg.forecast)?;
    let profile = engine.generate(OffsetDateTime::now_utc()).await;

    println!("{}", serde_json::to_string_pretty(&profile.response())?);

    Ok(())
}
