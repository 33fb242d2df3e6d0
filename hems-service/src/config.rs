use std::{collections::BTreeMap, fs, io, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use hems_client::{
    domain::{
        CONSUMPTION_POWER_KW, ENERGY_FLOW, MARKET_PRICES, PRICE_EUR_MWH, PV_POWER_KW, SOURCE_BATCH,
        SOURCE_SIMULATION, TAG_SOURCE,
    },
    store::{InfluxConfig, InfluxStore, MemoryStore},
    SharedStore,
};
use serde::Deserialize;

use crate::sources::CsvMapping;

pub const DEFAULT_CONFIG_PATH: &str = "hems-config.toml";

pub const DEFAULT_INFLUX_URL: &str = "http://localhost:8086";
pub const DEFAULT_INFLUX_TOKEN: &str = "my-super-secret-auth-token";
pub const DEFAULT_INFLUX_ORG: &str = "myorg";
pub const DEFAULT_INFLUX_BUCKET: &str = "hems_data";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Influx,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    pub url: String,
    pub token: String,
    pub org: String,
    pub bucket: String,
    pub request_timeout_secs: Option<u64>,
    /// Retention window of the in-memory store.
    pub retention_hours: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::Influx,
            url: DEFAULT_INFLUX_URL.to_string(),
            token: DEFAULT_INFLUX_TOKEN.to_string(),
            org: DEFAULT_INFLUX_ORG.to_string(),
            bucket: DEFAULT_INFLUX_BUCKET.to_string(),
            request_timeout_secs: None,
            retention_hours: None,
        }
    }
}

impl StoreConfig {
    /// Overlay `INFLUX_URL`, `INFLUX_TOKEN`, `INFLUX_ORG` and `INFLUX_BUCKET`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (var, slot) in [
            ("INFLUX_URL", &mut self.url),
            ("INFLUX_TOKEN", &mut self.token),
            ("INFLUX_ORG", &mut self.org),
            ("INFLUX_BUCKET", &mut self.bucket),
        ] {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                *slot = value;
            }
        }
    }

    /// Build the single store client shared by every component.
    pub fn connect(&self) -> anyhow::Result<SharedStore> {
        match self.kind {
            StoreKind::Influx => {
                let store = InfluxStore::new(InfluxConfig {
                    url: self.url.clone(),
                    token: self.token.clone(),
                    org: self.org.clone(),
                    bucket: self.bucket.clone(),
                    request_timeout: self.request_timeout_secs.map(Duration::from_secs),
                })?;
                tracing::info!(url = %self.url, org = %self.org, bucket = %self.bucket, "using InfluxDB store");
                Ok(Arc::new(store))
            }
            StoreKind::Memory => {
                let store = match self.retention_hours {
                    Some(hours) => MemoryStore::with_retention(time::Duration::hours(hours as i64)),
                    None => MemoryStore::new(),
                };
                tracing::info!(retention_hours = ?self.retention_hours, "using in-memory store");
                Ok(Arc::new(store))
            }
        }
    }
}

/// One historical data class: a CSV file and how its columns map to fields.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CsvClassConfig {
    pub path: PathBuf,
    #[serde(flatten)]
    pub mapping: CsvMapping,
}

impl CsvClassConfig {
    fn new(path: &str, measurement: &str, columns: &[(&str, &str)]) -> Self {
        Self {
            path: PathBuf::from(path),
            mapping: CsvMapping {
                timestamp_column: "timestamp".to_string(),
                measurement: measurement.to_string(),
                tags: BTreeMap::from([(TAG_SOURCE.to_string(), SOURCE_BATCH.to_string())]),
                columns: columns
                    .iter()
                    .map(|(c, f)| ((*c).to_string(), (*f).to_string()))
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Start of the retention-safe landing zone, relative to now.
    pub lookback_hours: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub consumption: CsvClassConfig,
    pub generation: CsvClassConfig,
    pub market_price: CsvClassConfig,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lookback_hours: 24,
            batch_size: 5000,
            max_retries: 3,
            retry_backoff_ms: 500,
            consumption: CsvClassConfig::new(
                "data/consumption.csv",
                ENERGY_FLOW,
                &[("consumption_kwh", CONSUMPTION_POWER_KW)],
            ),
            generation: CsvClassConfig::new(
                "data/generation.csv",
                ENERGY_FLOW,
                &[("generation_kwh", PV_POWER_KW)],
            ),
            market_price: CsvClassConfig::new(
                "data/market_prices.csv",
                MARKET_PRICES,
                &[(PRICE_EUR_MWH, PRICE_EUR_MWH)],
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub source_tag: String,
    pub pv_mean_kw: f64,
    pub pv_std_kw: f64,
    pub consumption_mean_kw: f64,
    pub consumption_std_kw: f64,
    pub seed: Option<u64>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 15,
            source_tag: SOURCE_SIMULATION.to_string(),
            pv_mean_kw: 2.0,
            pv_std_kw: 1.0,
            consumption_mean_kw: 1.5,
            consumption_std_kw: 0.5,
            seed: None,
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_secs == 0 {
            bail!("stream.interval_secs must be positive");
        }
        for (name, mean, std) in [
            ("pv", self.pv_mean_kw, self.pv_std_kw),
            ("consumption", self.consumption_mean_kw, self.consumption_std_kw),
        ] {
            if !mean.is_finite() {
                bail!("stream.{name}_mean_kw must be finite");
            }
            if !(std.is_finite() && std >= 0.0) {
                bail!("stream.{name}_std_kw must be finite and non-negative");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub initial_soc_percent: f64,
    pub capacity_kwh: f64,
    pub pv_peak_kw: f64,
    /// Inclusive daylight window on the hour of day.
    pub daylight_start_hour: u8,
    pub daylight_end_hour: u8,
    pub consumption_min_kw: f64,
    pub consumption_max_kw: f64,
    pub algorithm: String,
    pub seed: Option<u64>,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            initial_soc_percent: 50.0,
            capacity_kwh: 10.0,
            pv_peak_kw: 5.0,
            daylight_start_hour: 6,
            daylight_end_hour: 18,
            consumption_min_kw: 0.5,
            consumption_max_kw: 2.0,
            algorithm: "simple_heuristic".to_string(),
            seed: None,
        }
    }
}

impl ForecastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.capacity_kwh > 0.0) {
            bail!("forecast.capacity_kwh must be positive");
        }
        if !(0.0..=100.0).contains(&self.initial_soc_percent) {
            bail!("forecast.initial_soc_percent must be within [0, 100]");
        }
        if self.daylight_start_hour >= self.daylight_end_hour || self.daylight_end_hour > 23 {
            bail!("forecast daylight window must satisfy start < end <= 23");
        }
        if !(self.consumption_min_kw >= 0.0 && self.consumption_min_kw <= self.consumption_max_kw) {
            bail!("forecast consumption range must satisfy 0 <= min <= max");
        }
        if !(self.pv_peak_kw >= 0.0) {
            bail!("forecast.pv_peak_kw must be non-negative");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub forecast: ForecastConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    /// Load from `HEMS_CONFIG` (default `hems-config.toml`), then apply the
    /// store environment overrides. A missing default file means defaults.
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let explicit = env::var("HEMS_CONFIG").ok();
        let path = explicit.clone().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

        let mut cfg = match fs::read_to_string(&path) {
            Ok(contents) => Self::from_toml(&contents).with_context(|| format!("invalid config file {path}"))?,
            Err(e) if explicit.is_none() && e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %path, "no config file found, using defaults");
                Self::default()
            }
            Err(e) => return Err(e).with_context(|| format!("failed to read config file {path}")),
        };

        cfg.store.apply_env(|var| env::var(var).ok());
        cfg.stream.validate()?;
        cfg.forecast.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        Ok(cfg)
    }
}
