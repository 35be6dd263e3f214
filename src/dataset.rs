use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::DecimateError;

/// Represents any JSON-compatible attribute value found in store metadata.
///
/// Integer comes before Number so that untagged deserialization keeps
/// whole-number attributes intact instead of widening them to floats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Number(f64),
    Array(Vec<AttributeValue>),
    Object(HashMap<String, AttributeValue>),
    Null,
}

impl AttributeValue {
    /// Returns the string payload, or None for non-string values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as f64 when it carries a numeric payload.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(i) => Some(*i as f64),
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// One named variable: dimension names, shape and a row-major f64 payload.
#[derive(Debug, Clone, PartialEq)]
pub struct DataArray {
    pub name: String,
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
    pub attributes: HashMap<String, AttributeValue>,
}

impl DataArray {
    pub fn new(
        name: impl Into<String>,
        dims: Vec<String>,
        shape: Vec<usize>,
        values: Vec<f64>,
    ) -> Self {
        DataArray {
            name: name.into(),
            dims,
            shape,
            values,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attributes(mut self, attributes: HashMap<String, AttributeValue>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Position of a dimension within this variable, if it has one.
    pub fn dim_position(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.dim_position(dim).is_some()
    }

    /// Flat row-major offset for a full multi-index.
    pub fn offset(&self, index: &[usize]) -> usize {
        debug_assert_eq!(index.len(), self.shape.len());
        let mut flat = 0;
        for (axis, &i) in index.iter().enumerate() {
            debug_assert!(i < self.shape[axis]);
            flat = flat * self.shape[axis] + i;
        }
        flat
    }

    pub fn get(&self, index: &[usize]) -> f64 {
        self.values[self.offset(index)]
    }

    pub fn set(&mut self, index: &[usize], value: f64) {
        let flat = self.offset(index);
        self.values[flat] = value;
    }

    /// String attribute lookup, ignoring non-string values.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_str)
    }

    /// True for 1-D variables that label their own dimension (coordinates).
    pub fn is_index_coord(&self) -> bool {
        self.ndim() == 1 && self.dims[0] == self.name
    }

    /// Gathers the given positions along one dimension, preserving the
    /// order of `indices`. Variables without that dimension are returned
    /// unchanged.
    pub fn take(&self, dim: &str, indices: &[usize]) -> DataArray {
        let Some(axis) = self.dim_position(dim) else {
            return self.clone();
        };
        let mut out_shape = self.shape.clone();
        out_shape[axis] = indices.len();
        let out_len: usize = out_shape.iter().product();

        let mut values = Vec::with_capacity(out_len);
        let mut index = vec![0usize; out_shape.len()];
        let mut src = vec![0usize; out_shape.len()];
        for _ in 0..out_len {
            src.copy_from_slice(&index);
            src[axis] = indices[index[axis]];
            values.push(self.get(&src));
            increment_index(&mut index, &out_shape);
        }

        DataArray {
            name: self.name.clone(),
            dims: self.dims.clone(),
            shape: out_shape,
            values,
            attributes: self.attributes.clone(),
        }
    }
}

/// Advances a row-major multi-index by one position within `shape`.
pub(crate) fn increment_index(index: &mut [usize], shape: &[usize]) {
    for axis in (0..shape.len()).rev() {
        index[axis] += 1;
        if index[axis] < shape[axis] {
            return;
        }
        index[axis] = 0;
    }
}

/// A labeled collection of variables sharing named dimensions, plus the
/// group-level attributes of the store they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GriddedDataset {
    pub variables: BTreeMap<String, DataArray>,
    pub attributes: HashMap<String, AttributeValue>,
}

impl GriddedDataset {
    pub fn new() -> Self {
        GriddedDataset::default()
    }

    pub fn insert(&mut self, array: DataArray) {
        self.variables.insert(array.name.clone(), array);
    }

    pub fn get(&self, name: &str) -> Option<&DataArray> {
        self.variables.get(name)
    }

    /// Dimension sizes derived from the variables. `validate` reports
    /// conflicting sizes; here the first variable that uses a dimension
    /// defines it.
    pub fn dims(&self) -> BTreeMap<String, usize> {
        let mut dims = BTreeMap::new();
        for var in self.variables.values() {
            for (dim, &size) in var.dims.iter().zip(var.shape.iter()) {
                dims.entry(dim.clone()).or_insert(size);
            }
        }
        dims
    }

    pub fn dim_len(&self, dim: &str) -> Option<usize> {
        self.variables
            .values()
            .find_map(|v| v.dim_position(dim).map(|axis| v.shape[axis]))
    }

    pub fn has_dim(&self, dim: &str) -> bool {
        self.dim_len(dim).is_some()
    }

    /// String attribute lookup against the group-level attributes.
    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_str)
    }

    /// Checks internal consistency: every variable's value count matches
    /// its shape, ranks agree with dimension names, and a dimension name
    /// means the same size everywhere.
    pub fn validate(&self) -> Result<(), DecimateError> {
        let mut sizes: BTreeMap<&str, (usize, &str)> = BTreeMap::new();
        for var in self.variables.values() {
            if var.dims.len() != var.shape.len() {
                return Err(DecimateError::InvalidDataset {
                    reason: format!(
                        "variable '{}' has {} dimension names but a rank-{} shape",
                        var.name,
                        var.dims.len(),
                        var.shape.len()
                    ),
                });
            }
            let expected: usize = var.shape.iter().product();
            if var.values.len() != expected {
                return Err(DecimateError::InvalidDataset {
                    reason: format!(
                        "variable '{}' holds {} values but its shape {:?} implies {}",
                        var.name,
                        var.values.len(),
                        var.shape,
                        expected
                    ),
                });
            }
            for (dim, &size) in var.dims.iter().zip(var.shape.iter()) {
                match sizes.get(dim.as_str()) {
                    Some(&(seen, owner)) if seen != size => {
                        return Err(DecimateError::InvalidDataset {
                            reason: format!(
                                "dimension '{}' is {} in variable '{}' but {} in variable '{}'",
                                dim, size, var.name, seen, owner
                            ),
                        });
                    }
                    Some(_) => {}
                    None => {
                        sizes.insert(dim.as_str(), (size, var.name.as_str()));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_2x3() -> DataArray {
        DataArray::new(
            "tas",
            vec!["lat".to_string(), "lon".to_string()],
            vec![2, 3],
            vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0],
        )
    }

    #[test]
    fn test_row_major_offsets() {
        let var = field_2x3();
        assert_eq!(var.offset(&[0, 0]), 0);
        assert_eq!(var.offset(&[0, 2]), 2);
        assert_eq!(var.offset(&[1, 0]), 3);
        assert_eq!(var.get(&[1, 2]), 12.0);
    }

    #[test]
    fn test_take_along_dimension() {
        let var = field_2x3();
        let taken = var.take("lon", &[2, 0]);
        assert_eq!(taken.shape, vec![2, 2]);
        assert_eq!(taken.values, vec![2.0, 0.0, 12.0, 10.0]);
        // absent dimension leaves the variable untouched
        let same = var.take("depth", &[0]);
        assert_eq!(same.values, var.values);
    }

    #[test]
    fn test_dims_derived_from_variables() {
        let mut ds = GriddedDataset::new();
        ds.insert(field_2x3());
        ds.insert(DataArray::new(
            "lat",
            vec!["lat".to_string()],
            vec![2],
            vec![-45.0, 45.0],
        ));
        let dims = ds.dims();
        assert_eq!(dims.get("lat"), Some(&2));
        assert_eq!(dims.get("lon"), Some(&3));
        assert!(ds.get("lat").unwrap().is_index_coord());
        assert!(!ds.get("tas").unwrap().is_index_coord());
    }

    #[test]
    fn test_validate_rejects_conflicting_dimension_sizes() {
        let mut ds = GriddedDataset::new();
        ds.insert(field_2x3());
        ds.insert(DataArray::new(
            "lat",
            vec!["lat".to_string()],
            vec![4],
            vec![0.0; 4],
        ));
        let err = ds.validate().unwrap_err();
        assert!(err.to_string().contains("dimension 'lat'"));
    }

    #[test]
    fn test_validate_rejects_value_count_mismatch() {
        let mut ds = GriddedDataset::new();
        ds.insert(DataArray::new(
            "tas",
            vec!["lat".to_string()],
            vec![3],
            vec![1.0, 2.0],
        ));
        assert!(ds.validate().is_err());
    }

    #[test]
    fn test_attribute_value_integer_survives_deserialization() {
        let parsed: AttributeValue = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, AttributeValue::Integer(42));
        let parsed: AttributeValue = serde_json::from_str("2.5").unwrap();
        assert_eq!(parsed, AttributeValue::Number(2.5));
        let parsed: AttributeValue = serde_json::from_str("\"K\"").unwrap();
        assert_eq!(parsed.as_str(), Some("K"));
    }

    #[test]
    fn test_attr_str_ignores_non_strings() {
        let mut attrs = HashMap::new();
        attrs.insert("units".to_string(), AttributeValue::String("K".to_string()));
        attrs.insert("count".to_string(), AttributeValue::Integer(3));
        let var = field_2x3().with_attributes(attrs);
        assert_eq!(var.attr_str("units"), Some("K"));
        assert_eq!(var.attr_str("count"), None);
        assert_eq!(var.attributes.get("count").unwrap().as_f64(), Some(3.0));
    }
}
