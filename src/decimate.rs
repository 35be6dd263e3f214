use std::collections::HashMap;

use crate::dataset::{increment_index, AttributeValue, DataArray, GriddedDataset};
use crate::error::DecimateError;
use crate::grid::{
    self, GridTopology, BOUNDS_MARKER, DIM_I, DIM_J, DIM_LAT, DIM_LON, DIM_VERTICES,
    FIELD_LATITUDE, FIELD_LONGITUDE, VERTICES_LATITUDE, VERTICES_LONGITUDE,
};

/// Grid step of the coarse rectilinear target, in degrees.
pub const COARSE_STEP_DEGREES: f64 = 10.0;

/// Latitude centers of the coarse target grid, pole to pole inclusive.
pub fn target_latitudes() -> Vec<f64> {
    inclusive_axis(-90.0, 90.0, COARSE_STEP_DEGREES)
}

/// Longitude centers of the coarse target grid, 0 through 360 inclusive.
pub fn target_longitudes() -> Vec<f64> {
    inclusive_axis(0.0, 360.0, COARSE_STEP_DEGREES)
}

fn inclusive_axis(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let count = ((stop - start) / step).round() as usize + 1;
    (0..count).map(|k| start + k as f64 * step).collect()
}

/// Shrinks a dataset's horizontal grid, dispatching on its topology.
pub fn decimate(dataset: &GriddedDataset, factor: usize) -> Result<GriddedDataset, DecimateError> {
    match grid::classify(dataset)? {
        GridTopology::Rectilinear => decimate_rectilinear(dataset),
        GridTopology::Curvilinear => decimate_curvilinear(dataset, factor),
    }
}

/// Regrids every lat/lon variable onto the coarse 10-degree target grid
/// with bilinear interpolation. Bounds variables are dropped; variables
/// without horizontal dimensions pass through unchanged.
pub fn decimate_rectilinear(dataset: &GriddedDataset) -> Result<GriddedDataset, DecimateError> {
    let src_lat = coordinate_values(dataset, DIM_LAT)?;
    let src_lon = coordinate_values(dataset, DIM_LON)?;
    let dst_lat = target_latitudes();
    let dst_lon = target_longitudes();
    let lat_weights = axis_weights(&src_lat, &dst_lat, DIM_LAT)?;
    let lon_weights = axis_weights(&src_lon, &dst_lon, DIM_LON)?;

    let mut out = GriddedDataset::new();
    out.attributes = dataset.attributes.clone();
    for (name, var) in &dataset.variables {
        if name.contains(BOUNDS_MARKER) || name == DIM_LAT || name == DIM_LON {
            continue;
        }
        let lat_count = var.dims.iter().filter(|d| *d == DIM_LAT).count();
        let lon_count = var.dims.iter().filter(|d| *d == DIM_LON).count();
        match (var.dim_position(DIM_LAT), var.dim_position(DIM_LON)) {
            (None, None) => out.insert(var.clone()),
            (Some(lat_axis), Some(lon_axis)) if lat_count == 1 && lon_count == 1 => {
                out.insert(regrid_variable(
                    var,
                    lat_axis,
                    lon_axis,
                    &lat_weights,
                    &lon_weights,
                ));
            }
            _ => {
                return Err(DecimateError::Regrid {
                    variable: name.clone(),
                    reason: format!(
                        "expected exactly one '{}' and one '{}' dimension, found {:?}",
                        DIM_LAT, DIM_LON, var.dims
                    ),
                });
            }
        }
    }
    out.insert(replacement_axis(DIM_LAT, &dst_lat, dataset));
    out.insert(replacement_axis(DIM_LON, &dst_lon, dataset));
    Ok(out)
}

/// Thins a curvilinear grid by striding the full `i` extent and keeping a
/// factor-wide window of `j` rows around the midlatitudes, then renumbers
/// the logical axes and rebuilds the cell-corner variables.
pub fn decimate_curvilinear(
    dataset: &GriddedDataset,
    factor: usize,
) -> Result<GriddedDataset, DecimateError> {
    if factor == 0 {
        return Err(DecimateError::InvalidDataset {
            reason: "decimation factor must be at least 1".to_string(),
        });
    }
    let (Some(ni), Some(nj)) = (dataset.dim_len(DIM_I), dataset.dim_len(DIM_J)) else {
        return Err(DecimateError::UnsupportedGrid {
            dims: dataset.dims().into_keys().collect(),
        });
    };

    let i_indices: Vec<usize> = (0..ni).step_by(factor).collect();
    let width = factor.min(nj);
    let start = (nj / 2).saturating_sub(factor / 2).min(nj - width);
    let j_indices: Vec<usize> = (start..start + width).collect();
    if i_indices.len() < 2 {
        return Err(DecimateError::InsufficientGridExtent {
            axis: DIM_I.to_string(),
            cells: i_indices.len(),
        });
    }
    if j_indices.len() < 2 {
        return Err(DecimateError::InsufficientGridExtent {
            axis: DIM_J.to_string(),
            cells: j_indices.len(),
        });
    }

    let mut out = GriddedDataset::new();
    out.attributes = dataset.attributes.clone();
    for var in dataset.variables.values() {
        out.insert(var.take(DIM_I, &i_indices).take(DIM_J, &j_indices));
    }
    // logical axes restart from zero on the thinned grid
    out.insert(index_axis(DIM_I, i_indices.len(), dataset));
    out.insert(index_axis(DIM_J, j_indices.len(), dataset));

    let vertices_lat = cell_bounds(&out, FIELD_LATITUDE, VERTICES_LATITUDE)?;
    let vertices_lon = cell_bounds(&out, FIELD_LONGITUDE, VERTICES_LONGITUDE)?;
    out.insert(vertices_lat);
    out.insert(vertices_lon);
    Ok(out)
}

struct AxisWeight {
    lower: usize,
    upper: usize,
    frac: f64,
}

/// Precomputes, for each target point, the bracketing source indices and
/// the interpolation fraction. Targets beyond the source extent clamp to
/// the nearest edge.
fn axis_weights(
    source: &[f64],
    targets: &[f64],
    axis_name: &str,
) -> Result<Vec<AxisWeight>, DecimateError> {
    if source.len() < 2 {
        return Err(DecimateError::Regrid {
            variable: axis_name.to_string(),
            reason: format!(
                "axis has {} point(s), need at least 2 to interpolate",
                source.len()
            ),
        });
    }
    let ascending = source[0] <= source[source.len() - 1];
    let monotonic = source.windows(2).all(|w| {
        if ascending {
            w[0] < w[1]
        } else {
            w[0] > w[1]
        }
    });
    if !monotonic {
        return Err(DecimateError::Regrid {
            variable: axis_name.to_string(),
            reason: "axis is not strictly monotonic".to_string(),
        });
    }
    let weights = targets
        .iter()
        .map(|&t| {
            if ascending {
                bracket_ascending(source, t)
            } else {
                bracket_descending(source, t)
            }
        })
        .collect();
    Ok(weights)
}

fn bracket_ascending(source: &[f64], t: f64) -> AxisWeight {
    let n = source.len();
    if t <= source[0] {
        return AxisWeight { lower: 0, upper: 0, frac: 0.0 };
    }
    if t >= source[n - 1] {
        return AxisWeight { lower: n - 1, upper: n - 1, frac: 0.0 };
    }
    let upper = source.partition_point(|&s| s < t).max(1);
    let lower = upper - 1;
    let frac = (t - source[lower]) / (source[upper] - source[lower]);
    AxisWeight { lower, upper, frac }
}

fn bracket_descending(source: &[f64], t: f64) -> AxisWeight {
    let n = source.len();
    if t >= source[0] {
        return AxisWeight { lower: 0, upper: 0, frac: 0.0 };
    }
    if t <= source[n - 1] {
        return AxisWeight { lower: n - 1, upper: n - 1, frac: 0.0 };
    }
    let upper = source.partition_point(|&s| s > t).max(1);
    let lower = upper - 1;
    let frac = (source[lower] - t) / (source[lower] - source[upper]);
    AxisWeight { lower, upper, frac }
}

/// Bilinear interpolation of one variable onto the target axes. All
/// non-horizontal dimensions are preserved.
fn regrid_variable(
    var: &DataArray,
    lat_axis: usize,
    lon_axis: usize,
    lat_weights: &[AxisWeight],
    lon_weights: &[AxisWeight],
) -> DataArray {
    let mut out_shape = var.shape.clone();
    out_shape[lat_axis] = lat_weights.len();
    out_shape[lon_axis] = lon_weights.len();
    let out_len: usize = out_shape.iter().product();

    let mut values = Vec::with_capacity(out_len);
    let mut index = vec![0usize; out_shape.len()];
    let mut src = vec![0usize; out_shape.len()];
    for _ in 0..out_len {
        let wy = &lat_weights[index[lat_axis]];
        let wx = &lon_weights[index[lon_axis]];
        src.copy_from_slice(&index);
        src[lat_axis] = wy.lower;
        src[lon_axis] = wx.lower;
        let v00 = var.get(&src);
        src[lon_axis] = wx.upper;
        let v01 = var.get(&src);
        src[lat_axis] = wy.upper;
        let v11 = var.get(&src);
        src[lon_axis] = wx.lower;
        let v10 = var.get(&src);
        values.push(bilinear(v00, v01, v10, v11, wy.frac, wx.frac));
        increment_index(&mut index, &out_shape);
    }

    DataArray {
        name: var.name.clone(),
        dims: var.dims.clone(),
        shape: out_shape,
        values,
        attributes: var.attributes.clone(),
    }
}

fn bilinear(v00: f64, v01: f64, v10: f64, v11: f64, fy: f64, fx: f64) -> f64 {
    // any non-finite corner poisons the target cell
    if !(v00.is_finite() && v01.is_finite() && v10.is_finite() && v11.is_finite()) {
        return f64::NAN;
    }
    let lower = v00 + (v01 - v00) * fx;
    let upper = v10 + (v11 - v10) * fx;
    lower + (upper - lower) * fy
}

fn coordinate_values(dataset: &GriddedDataset, name: &str) -> Result<Vec<f64>, DecimateError> {
    let var = dataset.get(name).ok_or_else(|| DecimateError::Regrid {
        variable: name.to_string(),
        reason: "missing coordinate variable".to_string(),
    })?;
    if var.ndim() != 1 {
        return Err(DecimateError::Regrid {
            variable: name.to_string(),
            reason: format!("coordinate must be 1-D, found shape {:?}", var.shape),
        });
    }
    Ok(var.values.clone())
}

fn replacement_axis(name: &str, values: &[f64], source: &GriddedDataset) -> DataArray {
    let attributes = source
        .get(name)
        .map(|var| var.attributes.clone())
        .unwrap_or_default();
    DataArray::new(
        name,
        vec![name.to_string()],
        vec![values.len()],
        values.to_vec(),
    )
    .with_attributes(attributes)
}

fn index_axis(name: &str, len: usize, source: &GriddedDataset) -> DataArray {
    let attributes = source
        .get(name)
        .map(|var| var.attributes.clone())
        .unwrap_or_default();
    DataArray::new(
        name,
        vec![name.to_string()],
        vec![len],
        (0..len).map(|v| v as f64).collect(),
    )
    .with_attributes(attributes)
}

/// Rebuilds a cell-corner variable from decimated cell centers. Extents
/// come from first differences of neighboring centers, so corners of
/// adjacent cells coincide even after rows and columns were dropped.
/// Corners wind bottom-left, bottom-right, top-right, top-left.
fn cell_bounds(
    dataset: &GriddedDataset,
    field_name: &str,
    bounds_name: &str,
) -> Result<DataArray, DecimateError> {
    let field = dataset.get(field_name).ok_or_else(|| DecimateError::Regrid {
        variable: field_name.to_string(),
        reason: "curvilinear grid is missing this 2-D coordinate field".to_string(),
    })?;
    if field.dims != [DIM_J.to_string(), DIM_I.to_string()] {
        return Err(DecimateError::Regrid {
            variable: field_name.to_string(),
            reason: format!(
                "expected ('{}', '{}') dimensions, found {:?}",
                DIM_J, DIM_I, field.dims
            ),
        });
    }
    let nj = field.shape[0];
    let ni = field.shape[1];

    let mut values = vec![0.0; nj * ni * 4];
    for j in 0..nj {
        for i in 0..ni {
            let center = field.get(&[j, i]);
            let di = if i == 0 {
                field.get(&[j, i + 1]) - center
            } else {
                center - field.get(&[j, i - 1])
            };
            let dj = if j == 0 {
                field.get(&[j + 1, i]) - center
            } else {
                center - field.get(&[j - 1, i])
            };
            let base = (j * ni + i) * 4;
            values[base] = center - dj / 2.0 - di / 2.0;
            values[base + 1] = center - dj / 2.0 + di / 2.0;
            values[base + 2] = center + dj / 2.0 + di / 2.0;
            values[base + 3] = center + dj / 2.0 - di / 2.0;
        }
    }

    let attributes = dataset
        .get(bounds_name)
        .map(|var| var.attributes.clone())
        .unwrap_or_else(|| units_of(field));
    Ok(DataArray {
        name: bounds_name.to_string(),
        dims: vec![
            DIM_J.to_string(),
            DIM_I.to_string(),
            DIM_VERTICES.to_string(),
        ],
        shape: vec![nj, ni, 4],
        values,
        attributes,
    })
}

fn units_of(field: &DataArray) -> HashMap<String, AttributeValue> {
    let mut attributes = HashMap::new();
    if let Some(units) = field.attr_str("units") {
        attributes.insert(
            "units".to_string(),
            AttributeValue::String(units.to_string()),
        );
    }
    attributes
}
