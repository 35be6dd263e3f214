pub mod archive;
pub mod cftime;
pub mod dataset;
pub mod decimate;
pub mod error;
pub mod grid;
pub mod registry;
pub mod request;
pub mod store;
pub mod timespan;

// Re-export the types most callers and tests need
pub use dataset::{AttributeValue, DataArray, GriddedDataset};
pub use error::DecimateError;
pub use store::ZarrStore;
