pub mod energy_queries;

pub use energy_queries::{clean_record, daily_counts, flow_timeseries, latest_status, price_timeseries, soc_forecast, JsonRecord};
