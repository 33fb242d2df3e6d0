pub mod batch;
pub mod config;
pub mod forecast;
pub mod metrics_server;
pub mod observability;
pub mod pipeline;
pub mod sinks;
pub mod sources;
pub mod transform;

pub use forecast::{ForecastEngine, ForecastProfile};
pub use pipeline::{Envelope, Pipeline, SinkReport};
