use anyhow::{bail, Context, Result};
use hems_client::{
    db::{self, energy_queries::FLOW_LOOKBACK},
    domain::{ENERGY_FLOW, MARKET_PRICES},
};
use hems_service::{config::AppConfig, observability};
use std::env;
use time::{macros::format_description, Date, Duration, OffsetDateTime};

const USAGE: &str = "usage: query_energy <status|flow|prices|soc> [lookback_hours] | query_energy count [YYYY-MM-DD] [days]";

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        bail!(USAGE);
    }
    let lookback = || -> Result<Duration> {
        match args.get(2) {
            Some(raw) => Ok(Duration::hours(raw.parse()?)),
            None => Ok(FLOW_LOOKBACK),
        }
    };

    let cfg = AppConfig::load()?;
    let store = cfg.store.connect()?;
    let now = OffsetDateTime::now_utc();

    let output = match args[1].as_str() {
        "status" => serde_json::to_value(db::latest_status(store.as_ref(), now).await?)?,
        "flow" => serde_json::to_value(db::flow_timeseries(store.as_ref(), now, lookback()?).await?)?,
        "prices" => serde_json::to_value(db::price_timeseries(store.as_ref(), now, lookback()?).await?)?,
        "soc" => serde_json::to_value(db::soc_forecast(store.as_ref(), now).await?)?,
        "count" => {
            // Defaults to yesterday, the last complete UTC day.
            let day = match args.get(2) {
                Some(raw) => Date::parse(raw, format_description!("[year]-[month]-[day]"))
                    .with_context(|| format!("invalid day '{raw}'"))?,
                None => (now - Duration::days(1)).date(),
            };
            let days: u16 = match args.get(3) {
                Some(raw) => raw.parse().with_context(|| format!("invalid day count '{raw}'"))?,
                None => 1,
            };

            let mut counts = serde_json::Map::new();
            for measurement in [ENERGY_FLOW, MARKET_PRICES] {
                let rows = db::daily_counts(store.as_ref(), measurement, day, days).await?;
                if rows.is_empty() {
                    tracing::warn!(measurement, %day, days, "no points stored");
                }
                counts.insert(measurement.to_string(), serde_json::to_value(rows)?);
            }
            serde_json::Value::Object(counts)
        }
        _ => bail!(USAGE),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
