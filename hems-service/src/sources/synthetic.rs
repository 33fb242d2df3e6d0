use std::time::Duration;

use futures::StreamExt;
use hems_client::domain::{MeasurementPoint, CONSUMPTION_POWER_KW, ENERGY_FLOW, PV_POWER_KW, TAG_SOURCE};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::IntervalStream;
use tokio_util::sync::CancellationToken;

use crate::{
    config::StreamConfig,
    pipeline::{Envelope, EnvelopeStream, PipelineError, Source},
};

/// Independent generation and consumption draws, clamped at zero.
#[derive(Debug, Clone, Copy)]
pub struct EnergyDraw {
    pv: Normal<f64>,
    consumption: Normal<f64>,
}

impl EnergyDraw {
    pub fn new(pv_mean: f64, pv_std: f64, consumption_mean: f64, consumption_std: f64) -> Result<Self, PipelineError> {
        let pv = Normal::new(pv_mean, pv_std)
            .map_err(|e| PipelineError::Source(format!("invalid PV distribution: {e}")))?;
        let consumption = Normal::new(consumption_mean, consumption_std)
            .map_err(|e| PipelineError::Source(format!("invalid consumption distribution: {e}")))?;
        Ok(Self { pv, consumption })
    }

    pub fn sample<R: Rng + ?Sized>(&self, ts: OffsetDateTime, source_tag: &str, rng: &mut R) -> MeasurementPoint {
        let pv = self.pv.sample(rng).max(0.0);
        let consumption = self.consumption.sample(rng).max(0.0);

        MeasurementPoint::new(ENERGY_FLOW, ts)
            .tag(TAG_SOURCE, source_tag)
            .field(PV_POWER_KW, pv)
            .field(CONSUMPTION_POWER_KW, consumption)
    }
}

/// One synthetic `energy_flow` point per tick, stamped with the current time,
/// until the token is cancelled.
pub struct SyntheticEnergySource {
    draw: EnergyDraw,
    interval: Duration,
    source_tag: String,
    seed: Option<u64>,
    cancel: CancellationToken,
}

impl SyntheticEnergySource {
    pub fn new(cfg: &StreamConfig, cancel: CancellationToken) -> Result<Self, PipelineError> {
        cfg.validate().map_err(|e| PipelineError::Source(e.to_string()))?;
        Ok(Self {
            draw: EnergyDraw::new(
                cfg.pv_mean_kw,
                cfg.pv_std_kw,
                cfg.consumption_mean_kw,
                cfg.consumption_std_kw,
            )?,
            interval: Duration::from_secs(cfg.interval_secs),
            source_tag: cfg.source_tag.clone(),
            seed: cfg.seed,
            cancel,
        })
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait::async_trait]
impl Source<MeasurementPoint> for SyntheticEnergySource {
    async fn stream(&self) -> EnvelopeStream<MeasurementPoint> {
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let draw = self.draw;
        let source_tag = self.source_tag.clone();

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let ticks = IntervalStream::new(interval).take_until(self.cancel.clone().cancelled_owned());
        let s = ticks.map(move |_| {
            metrics::counter!("stream_ticks_total").increment(1);
            let point = draw.sample(OffsetDateTime::now_utc(), &source_tag, &mut rng);
            Ok(Envelope::new(point))
        });

        Box::pin(s)
    }
}
