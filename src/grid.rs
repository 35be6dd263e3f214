use crate::dataset::GriddedDataset;
use crate::error::DecimateError;

/// Dimension names for rectilinear horizontal axes.
pub const DIM_LAT: &str = "lat";
pub const DIM_LON: &str = "lon";
/// Logical dimension names of curvilinear (tripolar ocean) grids.
pub const DIM_I: &str = "i";
pub const DIM_J: &str = "j";
pub const DIM_TIME: &str = "time";
/// Corner count dimension of cell-bounds variables.
pub const DIM_VERTICES: &str = "vertices";

/// 2-D geographic coordinate fields carried by curvilinear grids.
pub const FIELD_LATITUDE: &str = "latitude";
pub const FIELD_LONGITUDE: &str = "longitude";
pub const VERTICES_LATITUDE: &str = "vertices_latitude";
pub const VERTICES_LONGITUDE: &str = "vertices_longitude";

/// Substring marking CF bounds variables such as `lat_bnds`.
pub const BOUNDS_MARKER: &str = "_bnds";

/// Horizontal grid layout of a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridTopology {
    /// 1-D `lat` and `lon` coordinates spanning a regular mesh.
    Rectilinear,
    /// Logical `i`/`j` axes with 2-D latitude and longitude fields.
    Curvilinear,
}

/// Classifies the horizontal grid of a dataset.
///
/// Rectilinear wins when both naming schemes are present: 1-D `lat`/`lon`
/// coordinates describe the grid completely, so the check runs first.
pub fn classify(dataset: &GriddedDataset) -> Result<GridTopology, DecimateError> {
    let dims = dataset.dims();
    if dims.contains_key(DIM_LAT)
        && dims.contains_key(DIM_LON)
        && is_one_dimensional(dataset, DIM_LAT)
        && is_one_dimensional(dataset, DIM_LON)
    {
        return Ok(GridTopology::Rectilinear);
    }
    if dims.contains_key(DIM_I) && dims.contains_key(DIM_J) {
        return Ok(GridTopology::Curvilinear);
    }
    Err(DecimateError::UnsupportedGrid {
        dims: dims.into_keys().collect(),
    })
}

fn is_one_dimensional(dataset: &GriddedDataset, name: &str) -> bool {
    dataset.get(name).is_some_and(|var| var.ndim() == 1)
}
