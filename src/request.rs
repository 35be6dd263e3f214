use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cftime;
use crate::dataset::GriddedDataset;
use crate::decimate;
use crate::error::DecimateError;
use crate::grid::DIM_TIME;
use crate::timespan::{self, TimeSpan};

/// CMIP6 DRS directory facets, in path order. A `v<version>` directory
/// follows them.
const CMIP6_PATH_FACETS: [&str; 9] = [
    "mip_era",
    "activity_drs",
    "institution_id",
    "source_id",
    "experiment_id",
    "member_id",
    "table_id",
    "variable_id",
    "grid_label",
];
const CMIP6_FILENAME_FACETS: [&str; 6] = [
    "variable_id",
    "table_id",
    "source_id",
    "experiment_id",
    "member_id",
    "grid_label",
];

const OBS4MIPS_PATH_FACETS: [&str; 5] = [
    "activity_id",
    "institution_id",
    "source_id",
    "variable_id",
    "grid_label",
];
const OBS4MIPS_FILENAME_FACETS: [&str; 3] = ["variable_id", "source_id", "grid_label"];

const FACET_VERSION: &str = "version";
const FACET_VARIABLE_ID: &str = "variable_id";

/// The archive project a request searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Cmip6,
    Obs4Mips,
}

impl RequestKind {
    fn path_facets(&self) -> &'static [&'static str] {
        match self {
            RequestKind::Cmip6 => &CMIP6_PATH_FACETS,
            RequestKind::Obs4Mips => &OBS4MIPS_PATH_FACETS,
        }
    }

    fn filename_facets(&self) -> &'static [&'static str] {
        match self {
            RequestKind::Cmip6 => &CMIP6_FILENAME_FACETS,
            RequestKind::Obs4Mips => &OBS4MIPS_FILENAME_FACETS,
        }
    }
}

/// A search-facet constraint: one label or a list of alternatives.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum FacetValue {
    One(String),
    Many(Vec<String>),
}

impl FacetValue {
    pub fn matches(&self, candidate: &str) -> bool {
        match self {
            FacetValue::One(value) => value == candidate,
            FacetValue::Many(values) => values.iter().any(|v| v == candidate),
        }
    }

    /// Comma-joined form for archive query strings.
    pub fn query_value(&self) -> String {
        match self {
            FacetValue::One(value) => value.clone(),
            FacetValue::Many(values) => values.join(","),
        }
    }
}

/// One dataset request: which archive to search, the facet constraints,
/// and how to cut the matches down.
#[derive(Debug, Clone, Deserialize)]
pub struct DatasetRequest {
    pub kind: RequestKind,
    pub facets: BTreeMap<String, FacetValue>,
    #[serde(default)]
    pub remove_ensembles: bool,
    #[serde(default)]
    pub time_span: Option<TimeSpan>,
}

impl DatasetRequest {
    /// Shrinks one dataset: spatial decimation (unless disabled) followed
    /// by the request's time window. `Ok(None)` means no time steps fell
    /// inside the window and the file should be skipped.
    pub fn decimate_dataset(
        &self,
        dataset: &GriddedDataset,
        factor: usize,
        spatial: bool,
    ) -> Result<Option<GriddedDataset>, DecimateError> {
        let shrunk = if spatial {
            decimate::decimate(dataset, factor)?
        } else {
            dataset.clone()
        };
        timespan::filter_time_window(&shrunk, self.time_span.as_ref())
    }

    /// Archive-relative output location of a decimated dataset, following
    /// the project's directory reference syntax.
    pub fn output_path(
        &self,
        key: &str,
        facets: &BTreeMap<String, String>,
        dataset: &GriddedDataset,
        source: &Path,
    ) -> Result<PathBuf> {
        let mut path = PathBuf::new();
        for name in self.kind.path_facets() {
            path.push(facet(facets, name, key)?);
        }
        path.push(format!("v{}", facet(facets, FACET_VERSION, key)?));

        let mut filename = self.filename_prefix(key, facets, dataset, source)?;
        if let Some(suffix) = time_suffix(dataset)? {
            filename.push_str(&suffix);
        }
        filename.push_str(".zarr");
        path.push(filename);
        Ok(path)
    }

    /// Underscore-joined filename facets. Obs4MIPs sources sometimes lead
    /// with a label that is not the variable id (CERES-EBAF and friends);
    /// that leading token is kept and the variable facet is dropped so
    /// the output name still matches the source naming.
    fn filename_prefix(
        &self,
        key: &str,
        facets: &BTreeMap<String, String>,
        dataset: &GriddedDataset,
        source: &Path,
    ) -> Result<String> {
        let standard: Result<Vec<&str>> = self
            .kind
            .filename_facets()
            .iter()
            .map(|name| facet(facets, name, key))
            .collect();

        if self.kind == RequestKind::Obs4Mips {
            let stem = source
                .file_stem()
                .and_then(|s| s.to_str())
                .ok_or_else(|| {
                    anyhow::anyhow!("Source path '{}' has no usable file name", source.display())
                })?;
            let lead = stem.split('_').next().unwrap_or(stem);
            if dataset.attr_str(FACET_VARIABLE_ID) != Some(lead) {
                let mut parts = vec![lead];
                for name in self.kind.filename_facets() {
                    if *name != FACET_VARIABLE_ID {
                        parts.push(facet(facets, name, key)?);
                    }
                }
                return Ok(parts.join("_"));
            }
        }
        Ok(standard?.join("_"))
    }
}

fn facet<'a>(facets: &'a BTreeMap<String, String>, name: &str, key: &str) -> Result<&'a str> {
    facets.get(name).map(String::as_str).ok_or_else(|| {
        anyhow::anyhow!(
            "Dataset '{}' is missing facet '{}' required to build its output path",
            key,
            name
        )
    })
}

/// `_YYYYMM-YYYYMM` span of the time coordinate, or None for fixed fields.
fn time_suffix(dataset: &GriddedDataset) -> Result<Option<String>> {
    if !dataset.has_dim(DIM_TIME) {
        return Ok(None);
    }
    let time = dataset.get(DIM_TIME).ok_or_else(|| {
        anyhow::anyhow!("Dataset has a '{}' dimension but no '{}' coordinate variable", DIM_TIME, DIM_TIME)
    })?;
    let labels = cftime::decode_labels(time)?;
    let (Some(first), Some(last)) = (labels.iter().min(), labels.iter().max()) else {
        return Ok(None);
    };
    Ok(Some(format!("_{}-{}", first.compact(), last.compact())))
}

/// The built-in request set: a small ACCESS-ESM1-5 sample covering the
/// variables the downstream test suites read.
pub fn default_requests() -> Vec<DatasetRequest> {
    let mut facets = BTreeMap::new();
    facets.insert(
        "source_id".to_string(),
        FacetValue::One("ACCESS-ESM1-5".to_string()),
    );
    facets.insert(
        "frequency".to_string(),
        FacetValue::Many(vec!["fx".to_string(), "mon".to_string()]),
    );
    facets.insert(
        "variable_id".to_string(),
        FacetValue::Many(
            ["areacella", "tas", "rsut", "rlut", "rsdt"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        ),
    );
    facets.insert(
        "experiment_id".to_string(),
        FacetValue::Many(vec!["ssp126".to_string(), "historical".to_string()]),
    );
    vec![DatasetRequest {
        kind: RequestKind::Cmip6,
        facets,
        remove_ensembles: true,
        time_span: Some(TimeSpan::new("2000", "2025")),
    }]
}

/// Loads a request list from a JSON file.
pub fn load_requests(path: &Path) -> Result<Vec<DatasetRequest>> {
    let data = fs::read(path)
        .with_context(|| format!("Failed to read requests file '{}'", path.display()))?;
    let requests: Vec<DatasetRequest> = serde_json::from_slice(&data).with_context(|| {
        format!(
            "Invalid requests JSON in '{}'. Expected an array of request objects.",
            path.display()
        )
    })?;
    if requests.is_empty() {
        return Err(anyhow::anyhow!(
            "Requests file '{}' contains no requests",
            path.display()
        ));
    }
    Ok(requests)
}
