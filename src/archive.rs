use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::request::FacetValue;

const CATALOG_FILE: &str = "catalog.json";
const FACET_MEMBER_ID: &str = "member_id";

/// One matched dataset: its archive key, the facet metadata the archive
/// published for it, and the local paths of its stores.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub key: String,
    pub facets: BTreeMap<String, String>,
    pub files: Vec<PathBuf>,
}

/// Catalog document shape shared by local archives and the search
/// endpoint of remote ones. Local `files` entries are root-relative store
/// paths; remote entries are URLs of every file making up the stores.
#[derive(Debug, Deserialize)]
struct CatalogDocument {
    datasets: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    key: String,
    facets: BTreeMap<String, String>,
    files: Vec<String>,
}

/// A directory holding a `catalog.json` next to the stores it lists.
pub struct LocalArchive {
    root: PathBuf,
}

impl LocalArchive {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        LocalArchive {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn search(
        &self,
        facets: &BTreeMap<String, FacetValue>,
        remove_ensembles: bool,
    ) -> Result<Vec<DatasetRecord>> {
        let catalog_path = self.root.join(CATALOG_FILE);
        let data = fs::read(&catalog_path).with_context(|| {
            format!(
                "Missing archive catalog at '{}'. A local archive must provide this file listing its datasets.",
                catalog_path.display()
            )
        })?;
        let catalog: CatalogDocument = serde_json::from_slice(&data).with_context(|| {
            format!(
                "Invalid catalog JSON at '{}'. The file exists but contains malformed JSON.",
                catalog_path.display()
            )
        })?;

        let records = catalog
            .datasets
            .into_iter()
            .filter(|entry| matches_facets(&entry.facets, facets))
            .map(|entry| DatasetRecord {
                key: entry.key,
                facets: entry.facets,
                files: entry.files.iter().map(|f| self.root.join(f)).collect(),
            })
            .collect();
        Ok(apply_ensemble_policy(records, remove_ensembles))
    }
}

/// An HTTP archive: `<base>/search` answers facet queries with a catalog
/// document whose file entries are URLs, mirrored locally before use.
pub struct RemoteArchive {
    base_url: String,
    cache_dir: PathBuf,
    client: reqwest::Client,
}

impl RemoteArchive {
    pub fn new(base_url: &str, cache_dir: &Path) -> Self {
        RemoteArchive {
            base_url: base_url.trim_end_matches('/').to_string(),
            cache_dir: cache_dir.to_path_buf(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn search(
        &self,
        facets: &BTreeMap<String, FacetValue>,
        remove_ensembles: bool,
    ) -> Result<Vec<DatasetRecord>> {
        let url = format!("{}/search", self.base_url);
        let params: Vec<(&str, String)> = facets
            .iter()
            .map(|(name, value)| (name.as_str(), value.query_value()))
            .collect();
        let catalog: CatalogDocument = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .with_context(|| format!("Archive search request to '{}' failed", url))?
            .error_for_status()
            .with_context(|| format!("Archive search at '{}' returned an error status", url))?
            .json()
            .await
            .with_context(|| format!("Archive search at '{}' returned malformed JSON", url))?;

        let mut records = Vec::new();
        for entry in catalog.datasets {
            let record = self
                .mirror_entry(entry)
                .await
                .with_context(|| "Failed to mirror a dataset from the archive")?;
            records.push(record);
        }
        Ok(apply_ensemble_policy(records, remove_ensembles))
    }

    /// Downloads every file of a catalog entry into the cache, skipping
    /// files already present, and reports the distinct store roots.
    async fn mirror_entry(&self, entry: CatalogEntry) -> Result<DatasetRecord> {
        let mut files = Vec::new();
        let mut seen = HashSet::new();
        for url in &entry.files {
            let local = self
                .download(url)
                .await
                .with_context(|| format!("Failed to mirror '{}' for dataset '{}'", url, entry.key))?;
            let root = store_root_of(&local);
            if seen.insert(root.clone()) {
                files.push(root);
            }
        }
        Ok(DatasetRecord {
            key: entry.key,
            facets: entry.facets,
            files,
        })
    }

    async fn download(&self, url: &str) -> Result<PathBuf> {
        // Url::parse collapses dot segments, so the check must run on the
        // raw text before parsing.
        let raw_path = url.split(['?', '#']).next().unwrap_or(url);
        if raw_path.split('/').any(|part| part == "..") {
            return Err(anyhow::anyhow!("Refusing to mirror unsafe URL path '{}'", url));
        }
        let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid file URL '{}'", url))?;
        let relative = parsed.path().trim_start_matches('/');
        if relative.is_empty() {
            return Err(anyhow::anyhow!("URL '{}' has no file path to mirror", url));
        }
        let destination = self.cache_dir.join(relative);
        if destination.exists() {
            return Ok(destination);
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory '{}'", parent.display())
            })?;
        }
        let bytes = self
            .client
            .get(parsed)
            .send()
            .await
            .with_context(|| format!("Request for '{}' failed", url))?
            .error_for_status()
            .with_context(|| format!("Download of '{}' returned an error status", url))?
            .bytes()
            .await
            .with_context(|| format!("Failed to read the body of '{}'", url))?;
        fs::write(&destination, &bytes)
            .with_context(|| format!("Failed to write '{}'", destination.display()))?;
        Ok(destination)
    }
}

/// Dispatches searches to a local or remote archive based on the source
/// string.
pub enum ArchiveClient {
    Local(LocalArchive),
    Remote(RemoteArchive),
}

impl ArchiveClient {
    pub fn from_source(source: &str, cache_dir: &Path) -> Self {
        if source.starts_with("http://") || source.starts_with("https://") {
            ArchiveClient::Remote(RemoteArchive::new(source, cache_dir))
        } else {
            ArchiveClient::Local(LocalArchive::new(source))
        }
    }

    pub async fn search(
        &self,
        facets: &BTreeMap<String, FacetValue>,
        remove_ensembles: bool,
    ) -> Result<Vec<DatasetRecord>> {
        match self {
            ArchiveClient::Local(archive) => archive.search(facets, remove_ensembles),
            ArchiveClient::Remote(archive) => archive.search(facets, remove_ensembles).await,
        }
    }
}

/// Every requested facet must be present on the record and match one of
/// the requested values.
fn matches_facets(
    record: &BTreeMap<String, String>,
    requested: &BTreeMap<String, FacetValue>,
) -> bool {
    requested.iter().all(|(name, value)| {
        record
            .get(name)
            .map(|candidate| value.matches(candidate))
            .unwrap_or(false)
    })
}

fn apply_ensemble_policy(records: Vec<DatasetRecord>, remove_ensembles: bool) -> Vec<DatasetRecord> {
    if remove_ensembles {
        remove_ensemble_duplicates(records)
    } else {
        records
    }
}

/// Collapses ensemble members: of records that differ only in their
/// `member_id`, the lowest member wins. Records without a member facet
/// pass through untouched.
fn remove_ensemble_duplicates(records: Vec<DatasetRecord>) -> Vec<DatasetRecord> {
    let mut winners: Vec<DatasetRecord> = Vec::new();
    let mut group_of: BTreeMap<String, usize> = BTreeMap::new();

    for record in records {
        let Some(member) = record.facets.get(FACET_MEMBER_ID).cloned() else {
            winners.push(record);
            continue;
        };
        let group_key: String = record
            .facets
            .iter()
            .filter(|(name, _)| name.as_str() != FACET_MEMBER_ID)
            .map(|(name, value)| format!("{}={};", name, value))
            .collect();
        match group_of.get(&group_key) {
            Some(&slot) => {
                let held = winners[slot]
                    .facets
                    .get(FACET_MEMBER_ID)
                    .cloned()
                    .unwrap_or_default();
                if member_sort_key(&member) < member_sort_key(&held) {
                    winners[slot] = record;
                }
            }
            None => {
                group_of.insert(group_key, winners.len());
                winners.push(record);
            }
        }
    }
    winners
}

/// Orders variant labels like `r1i1p1f1` by their numeric runs so that
/// `r2...` sorts before `r10...`.
fn member_sort_key(member: &str) -> (Vec<u64>, String) {
    let mut numbers = Vec::new();
    let mut current = String::new();
    for c in member.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else if !current.is_empty() {
            numbers.push(current.parse().unwrap_or(u64::MAX));
            current.clear();
        }
    }
    if !current.is_empty() {
        numbers.push(current.parse().unwrap_or(u64::MAX));
    }
    (numbers, member.to_string())
}

/// The store a mirrored file belongs to: the path up to its `.zarr`
/// component, or the file itself when no component carries the suffix.
fn store_root_of(path: &Path) -> PathBuf {
    let mut root = PathBuf::new();
    for component in path.components() {
        root.push(component);
        if component.as_os_str().to_string_lossy().ends_with(".zarr") {
            return root;
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_catalog(dir: &Path, body: &str) {
        let mut file = fs::File::create(dir.join(CATALOG_FILE)).unwrap();
        file.write_all(body.as_bytes()).unwrap();
    }

    fn sample_catalog() -> &'static str {
        r#"{
            "datasets": [
                {
                    "key": "CMIP6.historical.r1i1p1f1.tas",
                    "facets": {
                        "source_id": "ACCESS-ESM1-5",
                        "experiment_id": "historical",
                        "variable_id": "tas",
                        "member_id": "r1i1p1f1"
                    },
                    "files": ["stores/tas_r1.zarr"]
                },
                {
                    "key": "CMIP6.historical.r10i1p1f1.tas",
                    "facets": {
                        "source_id": "ACCESS-ESM1-5",
                        "experiment_id": "historical",
                        "variable_id": "tas",
                        "member_id": "r10i1p1f1"
                    },
                    "files": ["stores/tas_r10.zarr"]
                },
                {
                    "key": "CMIP6.ssp126.r2i1p1f1.tas",
                    "facets": {
                        "source_id": "ACCESS-ESM1-5",
                        "experiment_id": "ssp126",
                        "variable_id": "tas",
                        "member_id": "r2i1p1f1"
                    },
                    "files": ["stores/tas_ssp126.zarr"]
                },
                {
                    "key": "CMIP6.historical.r1i1p1f1.pr",
                    "facets": {
                        "source_id": "ACCESS-ESM1-5",
                        "experiment_id": "historical",
                        "variable_id": "pr",
                        "member_id": "r1i1p1f1"
                    },
                    "files": ["stores/pr_r1.zarr"]
                }
            ]
        }"#
    }

    fn facets(pairs: &[(&str, FacetValue)]) -> BTreeMap<String, FacetValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect()
    }

    #[test]
    fn test_local_search_filters_by_facets() {
        let dir = TempDir::new().unwrap();
        write_catalog(dir.path(), sample_catalog());
        let archive = LocalArchive::new(dir.path());

        let query = facets(&[
            ("variable_id", FacetValue::One("tas".to_string())),
            ("experiment_id", FacetValue::One("historical".to_string())),
        ]);
        let records = archive.search(&query, false).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.facets["variable_id"] == "tas"));
        // relative catalog entries resolve against the archive root
        assert_eq!(
            records[0].files[0],
            dir.path().join("stores/tas_r1.zarr")
        );
    }

    #[test]
    fn test_many_valued_facets_match_any() {
        let dir = TempDir::new().unwrap();
        write_catalog(dir.path(), sample_catalog());
        let archive = LocalArchive::new(dir.path());

        let query = facets(&[(
            "variable_id",
            FacetValue::Many(vec!["tas".to_string(), "pr".to_string()]),
        )]);
        let records = archive.search(&query, false).unwrap();
        assert_eq!(records.len(), 4);
    }

    #[test]
    fn test_records_missing_a_searched_facet_are_excluded() {
        let dir = TempDir::new().unwrap();
        write_catalog(dir.path(), sample_catalog());
        let archive = LocalArchive::new(dir.path());

        let query = facets(&[("grid_label", FacetValue::One("gn".to_string()))]);
        let records = archive.search(&query, false).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_remove_ensembles_keeps_the_lowest_member() {
        let dir = TempDir::new().unwrap();
        write_catalog(dir.path(), sample_catalog());
        let archive = LocalArchive::new(dir.path());

        let query = facets(&[("source_id", FacetValue::One("ACCESS-ESM1-5".to_string()))]);
        let records = archive.search(&query, true).unwrap();
        let keys: Vec<&str> = records.iter().map(|r| r.key.as_str()).collect();
        // r1 beats r10 within the historical tas group; other groups stay
        assert_eq!(
            keys,
            vec![
                "CMIP6.historical.r1i1p1f1.tas",
                "CMIP6.ssp126.r2i1p1f1.tas",
                "CMIP6.historical.r1i1p1f1.pr",
            ]
        );
    }

    #[test]
    fn test_member_ordering_is_numeric() {
        assert!(member_sort_key("r1i1p1f1") < member_sort_key("r2i1p1f1"));
        assert!(member_sort_key("r2i1p1f1") < member_sort_key("r10i1p1f1"));
        assert!(member_sort_key("r1i1p1f1") < member_sort_key("r1i1p1f2"));
    }

    #[test]
    fn test_missing_catalog_is_an_error() {
        let dir = TempDir::new().unwrap();
        let archive = LocalArchive::new(dir.path());
        let err = archive.search(&BTreeMap::new(), false).unwrap_err();
        assert!(err.to_string().contains("catalog"));
    }

    #[test]
    fn test_store_root_detection() {
        assert_eq!(
            store_root_of(Path::new("cache/data/tas_gn.zarr/tas/.zarray")),
            PathBuf::from("cache/data/tas_gn.zarr")
        );
        assert_eq!(
            store_root_of(Path::new("cache/plain/file.txt")),
            PathBuf::from("cache/plain/file.txt")
        );
    }

    #[test]
    fn test_client_source_dispatch() {
        let cache = Path::new(".cache");
        assert!(matches!(
            ArchiveClient::from_source("https://esgf.example.org/api", cache),
            ArchiveClient::Remote(_)
        ));
        assert!(matches!(
            ArchiveClient::from_source("archive", cache),
            ArchiveClient::Local(_)
        ));
    }

    #[tokio::test]
    async fn test_mirror_refuses_urls_with_dot_segments() {
        let cache = TempDir::new().unwrap();
        let remote = RemoteArchive::new("http://127.0.0.1:9", cache.path());

        let err = remote
            .download("http://127.0.0.1:9/stores/../../etc/passwd")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsafe URL path"));
        // refused before anything is created under the cache
        assert!(!cache.path().join("etc").exists());
        assert!(!cache.path().join("stores").exists());
    }

    #[tokio::test]
    async fn test_mirrored_files_are_not_downloaded_again() {
        let cache = TempDir::new().unwrap();
        let cached = cache.path().join("stores/tas_gn.zarr/.zgroup");
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, r#"{"zarr_format":2}"#).unwrap();

        // nothing listens on the base, so any request attempt would error
        let remote = RemoteArchive::new("http://127.0.0.1:9", cache.path());
        let local = remote
            .download("http://127.0.0.1:9/stores/tas_gn.zarr/.zgroup")
            .await
            .unwrap();

        assert_eq!(local, cached);
        assert_eq!(fs::read_to_string(&cached).unwrap(), r#"{"zarr_format":2}"#);
    }
}
