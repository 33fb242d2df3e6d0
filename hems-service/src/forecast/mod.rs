//! Quarter-hour battery state-of-charge forecast.
//!
//! One call runs a single deterministic pass
//! `Idle -> Aligning -> Simulating(0..96) -> Persisted` and returns the whole
//! trajectory, whether or not every sample reached the store.

use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::Context;
use hems_client::{
    domain::{ForecastSample, GENERATED_AT, TAG_ALGORITHM, TAG_RUN_ID},
    SharedStore,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use time::{Duration, OffsetDateTime};

use crate::config::ForecastConfig;

pub const HORIZON_STEPS: usize = 96;
pub const STEP: Duration = Duration::minutes(15);
const STEP_HOURS: f64 = 0.25;

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForecastPhase {
    Idle,
    Aligning,
    Simulating { step: usize },
    Persisted,
}

/// First quarter-hour boundary at or after `now`, seconds dropped.
pub fn align_start(now: OffsetDateTime) -> OffsetDateTime {
    let truncated =
        now - Duration::seconds(i64::from(now.second())) - Duration::nanoseconds(i64::from(now.nanosecond()));
    match truncated.minute() % 15 {
        0 => truncated,
        rem => truncated + Duration::minutes(i64::from(15 - rem)),
    }
}

/// Triangular PV profile on the integer hour: zero outside the daylight
/// window, `pv_peak_kw` at its midpoint, linear in between.
pub fn pv_estimate(hour: u8, cfg: &ForecastConfig) -> f64 {
    let start = f64::from(cfg.daylight_start_hour);
    let end = f64::from(cfg.daylight_end_hour);
    let h = f64::from(hour);

    if h < start || h > end {
        return 0.0;
    }

    let noon = (start + end) / 2.0;
    let half_window = (end - start) / 2.0;
    (cfg.pv_peak_kw * (1.0 - (h - noon).abs() / half_window)).max(0.0)
}

/// Advance SoC by one quarter hour of net power, clamped to [0, 100].
pub fn soc_step(soc_percent: f64, pv_kw: f64, load_kw: f64, capacity_kwh: f64) -> f64 {
    let energy_kwh = (pv_kw - load_kw) * STEP_HOURS;
    (soc_percent + energy_kwh / capacity_kwh * 100.0).clamp(0.0, 100.0)
}

fn run_id(generated_at: OffsetDateTime, algorithm: &str) -> String {
    let mut h = blake3::Hasher::new();
    h.update(&generated_at.unix_timestamp_nanos().to_le_bytes());
    h.update(&RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed).to_le_bytes());
    h.update(&std::process::id().to_le_bytes());
    h.update(algorithm.as_bytes());

    let mut id = h.finalize().to_hex().to_string();
    id.truncate(16);
    id
}

/// A generated trajectory plus how much of it was persisted.
#[derive(Debug, Clone)]
pub struct ForecastProfile {
    pub run_id: String,
    pub generated_at: OffsetDateTime,
    pub start: OffsetDateTime,
    pub samples: Vec<ForecastSample>,
    pub persisted: usize,
    pub failed_writes: usize,
}

#[derive(Debug, Serialize)]
pub struct ForecastResponse<'a> {
    pub message: &'static str,
    pub run_id: &'a str,
    pub data: &'a [ForecastSample],
}

impl ForecastProfile {
    pub fn response(&self) -> ForecastResponse<'_> {
        ForecastResponse {
            message: "Forecast generated and stored",
            run_id: &self.run_id,
            data: &self.samples,
        }
    }
}

pub struct ForecastEngine {
    store: SharedStore,
    cfg: ForecastConfig,
}

impl ForecastEngine {
    pub fn new(store: SharedStore, cfg: ForecastConfig) -> anyhow::Result<Self> {
        cfg.validate().context("invalid forecast configuration")?;
        Ok(Self { store, cfg })
    }

    pub async fn generate(&self, now: OffsetDateTime) -> ForecastProfile {
        let mut rng = match self.cfg.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        self.generate_with_rng(now, &mut rng).await
    }

    pub async fn generate_with_rng(&self, now: OffsetDateTime, rng: &mut StdRng) -> ForecastProfile {
        let mut phase = ForecastPhase::Idle;
        tracing::debug!(?phase, "forecast requested");

        phase = ForecastPhase::Aligning;
        let start = align_start(now);
        let run_id = run_id(now, &self.cfg.algorithm);
        let generated_at = now.unix_timestamp_nanos() as f64 / 1e9;
        tracing::debug!(?phase, %start, %run_id, "forecast horizon aligned");

        let tags = BTreeMap::from([
            (TAG_ALGORITHM.to_string(), self.cfg.algorithm.clone()),
            (TAG_RUN_ID.to_string(), run_id.clone()),
        ]);

        let mut samples = Vec::with_capacity(HORIZON_STEPS);
        let mut soc = self.cfg.initial_soc_percent;
        let mut failed_writes = 0;

        for step in 0..HORIZON_STEPS {
            phase = ForecastPhase::Simulating { step };

            let timestamp = start + STEP * step as i32;
            let pv = pv_estimate(timestamp.hour(), &self.cfg);
            let load = rng.random_range(self.cfg.consumption_min_kw..=self.cfg.consumption_max_kw);
            soc = soc_step(soc, pv, load, self.cfg.capacity_kwh);

            let sample = ForecastSample {
                timestamp,
                soc_percent: soc,
                pv_forecast_kw: pv,
                load_forecast_kw: load,
            };

            let point = sample.to_point(&tags).field(GENERATED_AT, generated_at);
            if let Err(e) = self.store.write(&[point]).await {
                failed_writes += 1;
                metrics::counter!("forecast_write_failures_total").increment(1);
                tracing::warn!(?phase, error = %e, %timestamp, "failed to persist forecast sample");
            }

            samples.push(sample);
        }

        phase = ForecastPhase::Persisted;
        metrics::counter!("forecast_runs_total").increment(1);
        tracing::info!(
            ?phase,
            %run_id,
            %start,
            persisted = HORIZON_STEPS - failed_writes,
            failed_writes,
            "forecast generated"
        );

        ForecastProfile {
            run_id,
            generated_at: now,
            start,
            samples,
            persisted: HORIZON_STEPS - failed_writes,
            failed_writes,
        }
    }
}
