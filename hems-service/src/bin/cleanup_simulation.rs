use anyhow::{bail, Context, Result};
use hems_client::{
    domain::{ENERGY_FLOW, TAG_SOURCE},
    store::{TagPredicate, TimeRange},
};
use hems_service::{config::AppConfig, observability, sources::parse_timestamp};
use std::env;
use time::macros::datetime;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Optional: cleanup_simulation [start] [stop]
    let args: Vec<String> = env::args().collect();
    let start = match args.get(1) {
        Some(raw) => parse_timestamp(raw).with_context(|| format!("invalid start '{raw}'"))?,
        None => datetime!(2023-01-01 00:00:00 UTC),
    };
    let stop = match args.get(2) {
        Some(raw) => parse_timestamp(raw).with_context(|| format!("invalid stop '{raw}'"))?,
        None => datetime!(2030-01-01 00:00:00 UTC),
    };
    if start >= stop {
        bail!("usage: cleanup_simulation [start] [stop] (start must be before stop)");
    }

    let cfg = AppConfig::load()?;
    let store = cfg.store.connect()?;

    let predicate = TagPredicate::eq(TAG_SOURCE, cfg.stream.source_tag.as_str());
    store
        .delete_range(ENERGY_FLOW, &predicate, TimeRange::new(start, stop))
        .await?;

    tracing::info!(
        measurement = ENERGY_FLOW,
        source = %cfg.stream.source_tag,
        %start,
        %stop,
        "simulation data deleted"
    );

    Ok(())
}
