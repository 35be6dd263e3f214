use serde::Deserialize;

use crate::cftime::{self, YearMonth};
use crate::dataset::GriddedDataset;
use crate::error::DecimateError;
use crate::grid::DIM_TIME;

/// Inclusive calendar window. Bounds are `YYYY` or `YYYY-MM` labels; a
/// bare year expands to January for the start and December for the end.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TimeSpan(pub String, pub String);

impl TimeSpan {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        TimeSpan(start.into(), end.into())
    }

    pub fn start_bound(&self) -> Result<YearMonth, DecimateError> {
        parse_label(&self.0, 1)
    }

    pub fn end_bound(&self) -> Result<YearMonth, DecimateError> {
        parse_label(&self.1, 12)
    }
}

fn parse_label(label: &str, default_month: u32) -> Result<YearMonth, DecimateError> {
    let invalid = || DecimateError::TimeDecode {
        reason: format!("time span bound '{}' is not of the form YYYY or YYYY-MM", label),
    };
    match label.split_once('-') {
        None => {
            let year: i32 = label.trim().parse().map_err(|_| invalid())?;
            Ok(YearMonth::new(year, default_month))
        }
        Some((year, month)) => {
            let year: i32 = year.trim().parse().map_err(|_| invalid())?;
            let month: u32 = month.trim().parse().map_err(|_| invalid())?;
            if !(1..=12).contains(&month) {
                return Err(invalid());
            }
            Ok(YearMonth::new(year, month))
        }
    }
}

/// Restricts a dataset to the time steps whose year-month label falls
/// inside the span. Returns `Ok(None)` when nothing is left, the signal
/// to skip the file entirely. Datasets without a time dimension, and
/// calls without a span, pass through unchanged.
pub fn filter_time_window(
    dataset: &GriddedDataset,
    span: Option<&TimeSpan>,
) -> Result<Option<GriddedDataset>, DecimateError> {
    if !dataset.has_dim(DIM_TIME) {
        return Ok(Some(dataset.clone()));
    }
    let Some(span) = span else {
        return Ok(Some(dataset.clone()));
    };
    let time = dataset.get(DIM_TIME).ok_or_else(|| DecimateError::TimeDecode {
        reason: format!(
            "dataset has a '{}' dimension but no '{}' coordinate variable",
            DIM_TIME, DIM_TIME
        ),
    })?;
    let labels = cftime::decode_labels(time)?;
    let start = span.start_bound()?;
    let end = span.end_bound()?;

    let keep: Vec<usize> = labels
        .iter()
        .enumerate()
        .filter(|(_, label)| (start..=end).contains(*label))
        .map(|(k, _)| k)
        .collect();
    if keep.is_empty() {
        return Ok(None);
    }
    if keep.len() == labels.len() {
        return Ok(Some(dataset.clone()));
    }

    let mut out = GriddedDataset::new();
    out.attributes = dataset.attributes.clone();
    for var in dataset.variables.values() {
        out.insert(var.take(DIM_TIME, &keep));
    }
    Ok(Some(out))
}
