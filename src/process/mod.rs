// src/process/mod.rs
pub mod baseline;
pub mod combine;
pub mod dates;
pub mod split;
pub mod table;

pub use baseline::{extract_baseline, write_baseline_csv, write_combined_csv, BaselineRecord};
pub use combine::{combine_parts, fill_down};
pub use dates::{filter_recent, MissingDatePolicy};
pub use split::{reconstruct, EventGroup};
pub use table::FlatTable;
