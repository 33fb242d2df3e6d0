pub mod energy_csv_file;
pub mod reconcile;
pub mod synthetic;

pub use energy_csv_file::{parse_timestamp, CsvMapping, EnergyCsvFileSource};
pub use reconcile::{batch_offset, RetentionAlignedSource};
pub use synthetic::{EnergyDraw, SyntheticEnergySource};
