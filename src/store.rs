use anyhow::{Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::dataset::{AttributeValue, DataArray, GriddedDataset};

/// xarray's attribute convention carrying dimension names in Zarr v2.
const ARRAY_DIMENSIONS_ATTR: &str = "_ARRAY_DIMENSIONS";

/// Raw `.zarray` header of one Zarr v2 array.
#[derive(Debug, Serialize, Deserialize)]
struct ZArrayMetadata {
    zarr_format: i32,
    shape: Vec<usize>,
    chunks: Vec<usize>,
    dtype: String,
    compressor: Option<serde_json::Value>,
    fill_value: Option<serde_json::Value>,
    order: String,
    filters: Option<Vec<serde_json::Value>>,
}

/// A single-group Zarr v2 directory store holding one dataset: the root
/// carries `.zgroup`/`.zattrs` and each immediate subdirectory with a
/// `.zarray` file is a variable.
#[derive(Debug)]
pub struct ZarrStore {
    path: PathBuf,
}

impl ZarrStore {
    /// Opens an existing store directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(anyhow::anyhow!("Path does not exist: {}", path.display()));
        }
        if !path.is_dir() {
            return Err(anyhow::anyhow!(
                "Path is not a directory: {}",
                path.display()
            ));
        }
        Ok(Self { path })
    }

    /// Writes a dataset as a fresh store at `path`, replacing whatever was
    /// there. Every variable becomes one uncompressed whole-array chunk of
    /// little-endian f64, so any Zarr v2 reader can open the output.
    pub fn create<P: AsRef<Path>>(path: P, dataset: &GriddedDataset) -> Result<Self> {
        dataset.validate()?;
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            fs::remove_dir_all(&path).with_context(|| {
                format!("Failed to replace existing store at '{}'", path.display())
            })?;
        }
        fs::create_dir_all(&path)
            .with_context(|| format!("Failed to create store directory '{}'", path.display()))?;

        write_json(&path.join(".zgroup"), &serde_json::json!({ "zarr_format": 2 }))?;
        if !dataset.attributes.is_empty() {
            write_json(&path.join(".zattrs"), &dataset.attributes)?;
        }
        for var in dataset.variables.values() {
            Self::write_variable(&path, var)
                .with_context(|| format!("Failed to write variable '{}'", var.name))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the whole store into memory as a dataset.
    pub fn read_dataset(&self) -> Result<GriddedDataset> {
        let mut dataset = GriddedDataset::new();
        dataset.attributes = read_attributes(&self.path.join(".zattrs"));

        let entries = fs::read_dir(&self.path)
            .with_context(|| format!("Failed to read directory: {}", self.path.display()))?;
        for entry in entries.flatten() {
            let entry_path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !entry_path.is_dir() {
                continue;
            }
            if !entry_path.join(".zarray").exists() {
                continue;
            }
            dataset.insert(self.read_variable(&name)?);
        }

        if dataset.variables.is_empty() {
            return Err(anyhow::anyhow!(
                "No Zarr arrays found in '{}'. The directory must contain variable subdirectories with .zarray files to be a valid store.",
                self.path.display()
            ));
        }
        dataset.validate()?;
        Ok(dataset)
    }

    /// Reads one variable: `.zarray` header, `.zattrs` attributes and the
    /// array values, with numeric fill values mapped to NaN.
    fn read_variable(&self, name: &str) -> Result<DataArray> {
        let dir = self.path.join(name);
        let header_path = dir.join(".zarray");
        let header_data = fs::read(&header_path).with_context(|| {
            format!(
                "Missing .zarray file for variable '{}' at '{}'. This file is required to define array metadata (shape, dtype, chunks).",
                name,
                header_path.display()
            )
        })?;
        let header: ZArrayMetadata = serde_json::from_slice(&header_data).with_context(|| {
            format!(
                "Invalid .zarray JSON format for variable '{}' at '{}'. The file exists but contains malformed JSON.",
                name,
                header_path.display()
            )
        })?;

        let mut attributes = read_attributes(&dir.join(".zattrs"));
        let dims = match attributes.remove(ARRAY_DIMENSIONS_ATTR) {
            Some(AttributeValue::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string))
                .collect::<Option<Vec<String>>>()
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "Variable '{}' has a non-string entry in its {} attribute",
                        name,
                        ARRAY_DIMENSIONS_ATTR
                    )
                })?,
            _ => (0..header.shape.len()).map(|i| format!("dim_{}", i)).collect(),
        };
        if dims.len() != header.shape.len() {
            return Err(anyhow::anyhow!(
                "Variable '{}' names {} dimensions but its shape has rank {}",
                name,
                dims.len(),
                header.shape.len()
            ));
        }

        let mut values = self
            .read_values(name, &header)
            .with_context(|| format!("Failed to read data for variable '{}'", name))?;
        if let Some(fill) = header.fill_value.as_ref().and_then(|v| v.as_f64()) {
            for value in values.iter_mut() {
                if *value == fill {
                    *value = f64::NAN;
                }
            }
        }

        Ok(DataArray {
            name: name.to_string(),
            dims,
            shape: header.shape,
            values,
            attributes,
        })
    }

    fn read_values(&self, name: &str, header: &ZArrayMetadata) -> Result<Vec<f64>> {
        let expected: usize = header.shape.iter().product();
        let values = self
            .read_values_with_zarrs(name, &header.dtype)
            .or_else(|_| self.read_single_chunk(name, header))?;
        if values.len() != expected {
            return Err(anyhow::anyhow!(
                "Variable '{}' decoded {} values but its shape {:?} implies {}",
                name,
                values.len(),
                header.shape,
                expected
            ));
        }
        Ok(values)
    }

    /// Reads array values through the zarrs crate, which handles chunk
    /// layouts and compressors we do not decode ourselves.
    fn read_values_with_zarrs(&self, name: &str, dtype: &str) -> Result<Vec<f64>> {
        use zarrs::array::Array;
        use zarrs::array_subset::ArraySubset;
        use zarrs::storage::store::FilesystemStore;

        let store = FilesystemStore::new(&self.path)
            .map_err(|e| anyhow::anyhow!("Failed to open '{}' as a store: {}", self.path.display(), e))?;
        let array_path = format!("/{}", name);
        let array = Array::open(std::sync::Arc::new(store), &array_path)
            .map_err(|e| anyhow::anyhow!("Failed to open array '{}': {}", array_path, e))?;

        let array_subset = ArraySubset::new_with_shape(array.shape().to_vec());
        let array_bytes = array
            .retrieve_array_subset(&array_subset)
            .map_err(|e| anyhow::anyhow!("Failed to read values of '{}': {}", array_path, e))?;

        let bytes: &[u8] = match &array_bytes {
            zarrs::array::ArrayBytes::Fixed(data) => data.as_ref(),
            zarrs::array::ArrayBytes::Variable(data, _offsets) => data.as_ref(),
        };
        decode_values(bytes, dtype)
    }

    /// Fallback for stores the zarrs crate cannot open: a single
    /// uncompressed whole-array chunk read directly from disk.
    fn read_single_chunk(&self, name: &str, header: &ZArrayMetadata) -> Result<Vec<f64>> {
        if header.compressor.is_some() {
            return Err(anyhow::anyhow!(
                "Variable '{}' uses compression; only uncompressed chunks can be read without the zarrs crate",
                name
            ));
        }
        if header.chunks != header.shape {
            return Err(anyhow::anyhow!(
                "Variable '{}' is split into multiple chunks (chunks {:?}, shape {:?}); only whole-array chunks can be read without the zarrs crate",
                name,
                header.chunks,
                header.shape
            ));
        }

        let chunk_path = self.path.join(name).join(chunk_key(header.shape.len()));
        let buffer = fs::read(&chunk_path)
            .with_context(|| format!("Chunk file not found: {}", chunk_path.display()))?;
        decode_values(&buffer, &header.dtype)
    }

    fn write_variable(root: &Path, var: &DataArray) -> Result<()> {
        if var.name.is_empty() || var.name.starts_with('.') || var.name.contains('/') {
            return Err(anyhow::anyhow!(
                "Variable name '{}' cannot be used as a store path",
                var.name
            ));
        }
        let dir = root.join(&var.name);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory '{}'", dir.display()))?;

        let header = ZArrayMetadata {
            zarr_format: 2,
            shape: var.shape.clone(),
            chunks: var.shape.clone(),
            dtype: "<f8".to_string(),
            compressor: None,
            fill_value: None,
            order: "C".to_string(),
            filters: None,
        };
        write_json(&dir.join(".zarray"), &header)?;

        let mut attributes = var.attributes.clone();
        attributes.insert(
            ARRAY_DIMENSIONS_ATTR.to_string(),
            AttributeValue::Array(
                var.dims
                    .iter()
                    .map(|d| AttributeValue::String(d.clone()))
                    .collect(),
            ),
        );
        write_json(&dir.join(".zattrs"), &attributes)?;

        let mut buffer = Vec::with_capacity(var.values.len() * 8);
        for &value in &var.values {
            buffer.write_f64::<LittleEndian>(value)?;
        }
        let chunk_path = dir.join(chunk_key(var.ndim()));
        fs::write(&chunk_path, buffer)
            .with_context(|| format!("Failed to write chunk '{}'", chunk_path.display()))?;
        Ok(())
    }
}

/// Chunk key of the whole-array chunk: one zero per dimension, `"0"` for
/// scalars.
fn chunk_key(ndim: usize) -> String {
    if ndim == 0 {
        "0".to_string()
    } else {
        vec!["0"; ndim].join(".")
    }
}

/// Optional `.zattrs` files load as empty maps; malformed attribute JSON
/// is ignored rather than fatal.
fn read_attributes(path: &Path) -> HashMap<String, AttributeValue> {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .with_context(|| format!("Failed to serialize metadata for '{}'", path.display()))?;
    fs::write(path, data).with_context(|| format!("Failed to write '{}'", path.display()))?;
    Ok(())
}

/// Decodes raw little-endian values into f64 based on the Zarr dtype.
fn decode_values(bytes: &[u8], dtype: &str) -> Result<Vec<f64>> {
    let mut reader = std::io::Cursor::new(bytes);
    let mut data = Vec::new();
    match dtype {
        "<f8" => {
            while let Ok(value) = reader.read_f64::<LittleEndian>() {
                data.push(value);
            }
        }
        "<f4" => {
            while let Ok(value) = reader.read_f32::<LittleEndian>() {
                data.push(value as f64);
            }
        }
        "<i4" => {
            while let Ok(value) = reader.read_i32::<LittleEndian>() {
                data.push(value as f64);
            }
        }
        "<i8" => {
            while let Ok(value) = reader.read_i64::<LittleEndian>() {
                data.push(value as f64);
            }
        }
        other => return Err(anyhow::anyhow!("Unsupported dtype: {}", other)),
    }
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_dataset() -> GriddedDataset {
        let mut ds = GriddedDataset::new();
        ds.attributes.insert(
            "source_id".to_string(),
            AttributeValue::String("ACCESS-ESM1-5".to_string()),
        );
        ds.insert(DataArray::new(
            "lat",
            vec!["lat".to_string()],
            vec![3],
            vec![-45.0, 0.0, 45.0],
        ));
        let mut attrs = HashMap::new();
        attrs.insert("units".to_string(), AttributeValue::String("K".to_string()));
        ds.insert(
            DataArray::new(
                "tas",
                vec!["time".to_string(), "lat".to_string()],
                vec![2, 3],
                vec![280.0, 281.0, f64::NAN, 283.0, 284.0, 285.0],
            )
            .with_attributes(attrs),
        );
        ds
    }

    #[test]
    fn test_create_then_read_preserves_dataset() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("sample.zarr");
        ZarrStore::create(&store_path, &sample_dataset()).unwrap();

        let loaded = ZarrStore::open(&store_path).unwrap().read_dataset().unwrap();
        assert_eq!(loaded.attr_str("source_id"), Some("ACCESS-ESM1-5"));

        let tas = loaded.get("tas").unwrap();
        assert_eq!(tas.dims, vec!["time".to_string(), "lat".to_string()]);
        assert_eq!(tas.shape, vec![2, 3]);
        assert_eq!(tas.attr_str("units"), Some("K"));
        // dimension names live in `dims`, not as a leaked attribute
        assert!(!tas.attributes.contains_key(ARRAY_DIMENSIONS_ATTR));
        assert_eq!(tas.values[0], 280.0);
        assert!(tas.values[2].is_nan());
        assert_eq!(tas.values[5], 285.0);
    }

    #[test]
    fn test_multidimensional_chunk_key_on_disk() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("sample.zarr");
        ZarrStore::create(&store_path, &sample_dataset()).unwrap();
        assert!(store_path.join("tas").join("0.0").exists());
        assert!(store_path.join("lat").join("0").exists());
        assert!(store_path.join(".zgroup").exists());
    }

    #[test]
    fn test_create_replaces_existing_store() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("sample.zarr");
        ZarrStore::create(&store_path, &sample_dataset()).unwrap();

        let mut smaller = GriddedDataset::new();
        smaller.insert(DataArray::new(
            "lon",
            vec!["lon".to_string()],
            vec![2],
            vec![0.0, 180.0],
        ));
        ZarrStore::create(&store_path, &smaller).unwrap();

        let loaded = ZarrStore::open(&store_path).unwrap().read_dataset().unwrap();
        assert!(loaded.get("tas").is_none());
        assert!(loaded.get("lon").is_some());
    }

    #[test]
    fn test_numeric_fill_value_becomes_nan() {
        let dir = TempDir::new().unwrap();
        let var_dir = dir.path().join("pr");
        fs::create_dir_all(&var_dir).unwrap();
        fs::write(dir.path().join(".zgroup"), r#"{"zarr_format": 2}"#).unwrap();
        fs::write(
            var_dir.join(".zarray"),
            r#"{
                "zarr_format": 2,
                "shape": [3],
                "chunks": [3],
                "dtype": "<f8",
                "compressor": null,
                "fill_value": -9999.0,
                "order": "C",
                "filters": null
            }"#,
        )
        .unwrap();
        let mut chunk = Vec::new();
        for v in [1.5, -9999.0, 2.5] {
            chunk.write_f64::<LittleEndian>(v).unwrap();
        }
        fs::write(var_dir.join("0"), chunk).unwrap();

        let loaded = ZarrStore::open(dir.path()).unwrap().read_dataset().unwrap();
        let pr = loaded.get("pr").unwrap();
        assert_eq!(pr.values[0], 1.5);
        assert!(pr.values[1].is_nan());
        assert_eq!(pr.values[2], 2.5);
        // no dimension attribute, so names fall back to positions
        assert_eq!(pr.dims, vec!["dim_0".to_string()]);
    }

    #[test]
    fn test_open_nonexistent_path_fails() {
        let err = ZarrStore::open("/nonexistent/path").unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_directory_without_arrays_is_not_a_store() {
        let dir = TempDir::new().unwrap();
        let err = ZarrStore::open(dir.path())
            .unwrap()
            .read_dataset()
            .unwrap_err();
        assert!(err.to_string().contains("No Zarr arrays found"));
    }
}
