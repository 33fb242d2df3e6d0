pub mod forecast;
pub mod point;
pub mod record;

pub use forecast::ForecastSample;
pub use point::MeasurementPoint;
pub use record::{pivot, NarrowRow, SeriesRecord};

/// PV generation and household consumption, batch and synthetic.
pub const ENERGY_FLOW: &str = "energy_flow";
/// Day-ahead market prices.
pub const MARKET_PRICES: &str = "market_prices";
/// Materialized SoC forecast trajectories.
pub const FORECAST_SOC: &str = "forecast_soc";

pub const PV_POWER_KW: &str = "pv_power_kw";
pub const CONSUMPTION_POWER_KW: &str = "consumption_power_kw";
pub const PRICE_EUR_MWH: &str = "price_eur_mwh";
pub const SOC_PERCENT: &str = "soc_percent";
pub const PV_FORECAST_KW: &str = "pv_forecast_kw";
pub const LOAD_FORECAST_KW: &str = "load_forecast_kw";
/// Unix seconds at which a forecast run was generated.
pub const GENERATED_AT: &str = "generated_at";

pub const TAG_SOURCE: &str = "source";
pub const TAG_ALGORITHM: &str = "algorithm";
pub const TAG_RUN_ID: &str = "run_id";

/// `source` tag value of points loaded from historical files.
pub const SOURCE_BATCH: &str = "csv_init";
/// `source` tag value of points produced by the streaming generator.
pub const SOURCE_SIMULATION: &str = "simulation";
