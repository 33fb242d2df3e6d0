pub mod db;
pub mod domain;
pub mod error;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use store::{SharedStore, TimeSeriesStore};
