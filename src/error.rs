use thiserror::Error;

/// Errors raised by the decimation core.
///
/// An empty time-window selection is not represented here; it is the
/// `Ok(None)` outcome of the time filter and callers skip the file.
#[derive(Debug, Error)]
pub enum DecimateError {
    #[error(
        "unsupported grid: expected 1-D 'lat'/'lon' coordinates or 'i'/'j' dimensions, found [{}]",
        .dims.join(", ")
    )]
    UnsupportedGrid { dims: Vec<String> },

    #[error("grid extent too small along '{axis}': {cells} cell(s) retained, need at least 2")]
    InsufficientGridExtent { axis: String, cells: usize },

    #[error("cannot regrid variable '{variable}': {reason}")]
    Regrid { variable: String, reason: String },

    #[error("cannot decode time coordinate: {reason}")]
    TimeDecode { reason: String },

    #[error("invalid dataset: {reason}")]
    InvalidDataset { reason: String },
}
