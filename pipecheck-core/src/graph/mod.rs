//! The "PKGR" object-graph format: a versioned, self-describing binary
//! serialization of estimator pipelines.
//!
//! ```text
//! header : "PKGR" | version u16
//! value  : tag u8 | length u32 | payload[length]      (little-endian)
//! ```
//!
//! Objects carry a declared type name and a state dictionary. Completed
//! objects are appended to a back-reference table so shared sub-objects can be
//! written once and referenced afterwards; a reference may only name an object
//! that is already complete, so the format cannot express cycles.

pub mod decoder;
pub mod encoder;

pub use decoder::decode_graph;
pub use encoder::ObjectGraphEncoder;

use crate::error::DecodeError;
use std::sync::Arc;

/// Format tag at the start of every stream.
pub const MAGIC: &[u8; 4] = b"PKGR";

/// The only format version this build understands.
pub const FORMAT_VERSION: u16 = 1;

/// Upper bound on value nesting accepted by the decoder.
pub const MAX_DEPTH: usize = 256;

pub(crate) mod tag {
    pub const NONE: u8 = 0x00;
    pub const BOOL: u8 = 0x01;
    pub const INT: u8 = 0x02;
    pub const FLOAT: u8 = 0x03;
    pub const STR: u8 = 0x04;
    pub const BYTES: u8 = 0x05;
    pub const LIST: u8 = 0x06;
    pub const DICT: u8 = 0x07;
    pub const OBJECT: u8 = 0x08;
    pub const REF: u8 = 0x09;
}

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum GraphValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<GraphValue>),
    Dict(Vec<(String, GraphValue)>),
    Object(Arc<GraphObject>),
}

/// An object of a declared type together with its state.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphObject {
    pub type_name: String,
    pub state: ObjectState,
}

impl GraphValue {
    /// Build an object value from a type name and `(attribute, value)` pairs.
    pub fn object<K: Into<String>>(
        type_name: impl Into<String>,
        state: impl IntoIterator<Item = (K, GraphValue)>,
    ) -> Self {
        let type_name = type_name.into();
        let state = ObjectState::new(state.into_iter().map(|(k, v)| (k.into(), v)).collect())
            .with_type_name(&type_name);
        GraphValue::Object(Arc::new(GraphObject { type_name, state }))
    }

    pub fn str(value: impl Into<String>) -> Self {
        GraphValue::Str(value.into())
    }

    pub fn floats(values: &[f64]) -> Self {
        GraphValue::List(values.iter().map(|v| GraphValue::Float(*v)).collect())
    }

    pub fn strs(values: &[&str]) -> Self {
        GraphValue::List(values.iter().map(|v| GraphValue::str(*v)).collect())
    }

    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphValue::None => "None",
            GraphValue::Bool(_) => "bool",
            GraphValue::Int(_) => "int",
            GraphValue::Float(_) => "float",
            GraphValue::Str(_) => "str",
            GraphValue::Bytes(_) => "bytes",
            GraphValue::List(_) => "list",
            GraphValue::Dict(_) => "dict",
            GraphValue::Object(_) => "object",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GraphValue::Float(v) => Some(*v),
            GraphValue::Int(v) => Some(*v as f64),
            GraphValue::Bool(v) => Some(if *v { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Arc<GraphObject>> {
        match self {
            GraphValue::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

/// The attribute dictionary of an object, with typed accessors used by factories.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectState {
    type_name: String,
    entries: Vec<(String, GraphValue)>,
}

impl ObjectState {
    pub fn new(entries: Vec<(String, GraphValue)>) -> Self {
        Self {
            type_name: String::new(),
            entries,
        }
    }

    pub(crate) fn with_type_name(mut self, type_name: &str) -> Self {
        self.type_name = type_name.to_string();
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn entries(&self) -> &[(String, GraphValue)] {
        &self.entries
    }

    /// Look up an attribute; `None` values count as absent.
    pub fn get(&self, attribute: &str) -> Option<&GraphValue> {
        self.entries
            .iter()
            .find(|(k, _)| k == attribute)
            .map(|(_, v)| v)
            .filter(|v| !matches!(v, GraphValue::None))
    }

    pub fn require(&self, attribute: &str) -> Result<&GraphValue, DecodeError> {
        self.get(attribute)
            .ok_or_else(|| DecodeError::MissingAttribute {
                type_name: self.type_name.clone(),
                attribute: attribute.to_string(),
            })
    }

    fn invalid(&self, attribute: &str, message: impl Into<String>) -> DecodeError {
        DecodeError::InvalidAttribute {
            type_name: self.type_name.clone(),
            attribute: attribute.to_string(),
            message: message.into(),
        }
    }

    pub fn f64(&self, attribute: &str) -> Result<f64, DecodeError> {
        let value = self.require(attribute)?;
        scalar_f64(value).ok_or_else(|| {
            self.invalid(attribute, format!("must be a number, got {}", value.kind()))
        })
    }

    pub fn usize(&self, attribute: &str) -> Result<usize, DecodeError> {
        match self.require(attribute)? {
            GraphValue::Int(v) if *v >= 0 => Ok(*v as usize),
            other => Err(self.invalid(
                attribute,
                format!("must be a non-negative int, got {}", other.kind()),
            )),
        }
    }

    pub fn bool_or(&self, attribute: &str, default: bool) -> Result<bool, DecodeError> {
        match self.get(attribute) {
            None => Ok(default),
            Some(GraphValue::Bool(v)) => Ok(*v),
            Some(other) => Err(self.invalid(
                attribute,
                format!("must be a bool, got {}", other.kind()),
            )),
        }
    }

    pub fn string(&self, attribute: &str) -> Result<String, DecodeError> {
        match self.require(attribute)? {
            GraphValue::Str(s) => Ok(s.clone()),
            other => Err(self.invalid(
                attribute,
                format!("must be a str, got {}", other.kind()),
            )),
        }
    }

    /// A flat numeric array. A 2-D array with a single row is flattened.
    pub fn f64_vec(&self, attribute: &str) -> Result<Vec<f64>, DecodeError> {
        let value = self.require(attribute)?;
        self.to_f64_vec(attribute, value)
    }

    fn to_f64_vec(&self, attribute: &str, value: &GraphValue) -> Result<Vec<f64>, DecodeError> {
        match value {
            GraphValue::List(items) => {
                if let [GraphValue::List(_)] = items.as_slice() {
                    return self.to_f64_vec(attribute, &items[0]);
                }
                items
                    .iter()
                    .map(|item| {
                        item.as_f64().ok_or_else(|| {
                            self.invalid(
                                attribute,
                                format!("must contain numbers, found {}", item.kind()),
                            )
                        })
                    })
                    .collect()
            }
            other => scalar_f64(other).map(|v| vec![v]).ok_or_else(|| {
                self.invalid(
                    attribute,
                    format!("must be a numeric array, got {}", other.kind()),
                )
            }),
        }
    }

    /// A 2-D numeric array; a flat array is treated as a single row.
    pub fn f64_matrix(&self, attribute: &str) -> Result<Vec<Vec<f64>>, DecodeError> {
        match self.require(attribute)? {
            GraphValue::List(rows) if rows.iter().all(|r| matches!(r, GraphValue::List(_))) => {
                rows.iter()
                    .map(|row| self.to_f64_vec(attribute, row))
                    .collect()
            }
            other => Ok(vec![self.to_f64_vec(attribute, other)?]),
        }
    }

    /// An array of labels; numbers are rendered in their canonical text form.
    pub fn label_vec(&self, attribute: &str) -> Result<Vec<String>, DecodeError> {
        match self.require(attribute)? {
            GraphValue::List(items) => items
                .iter()
                .map(|item| self.label(attribute, item))
                .collect(),
            other => Err(self.invalid(
                attribute,
                format!("must be a list, got {}", other.kind()),
            )),
        }
    }

    /// A list of label arrays, e.g. `OneHotEncoder.categories_`.
    pub fn label_matrix(&self, attribute: &str) -> Result<Vec<Vec<String>>, DecodeError> {
        match self.require(attribute)? {
            GraphValue::List(rows) => rows
                .iter()
                .map(|row| match row {
                    GraphValue::List(items) => items
                        .iter()
                        .map(|item| self.label(attribute, item))
                        .collect(),
                    other => Err(self.invalid(
                        attribute,
                        format!("must be a list of lists, found {}", other.kind()),
                    )),
                })
                .collect(),
            other => Err(self.invalid(
                attribute,
                format!("must be a list, got {}", other.kind()),
            )),
        }
    }

    /// An optional list of strings (`None` or absent yields `None`).
    pub fn opt_string_vec(&self, attribute: &str) -> Result<Option<Vec<String>>, DecodeError> {
        match self.get(attribute) {
            None => Ok(None),
            Some(GraphValue::List(items)) => items
                .iter()
                .map(|item| match item {
                    GraphValue::Str(s) => Ok(s.clone()),
                    other => Err(self.invalid(
                        attribute,
                        format!("must contain strings, found {}", other.kind()),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Some),
            Some(other) => Err(self.invalid(
                attribute,
                format!("must be a list of str, got {}", other.kind()),
            )),
        }
    }

    fn label(&self, attribute: &str, item: &GraphValue) -> Result<String, DecodeError> {
        match item {
            GraphValue::Str(s) => Ok(s.clone()),
            GraphValue::Int(v) => Ok(v.to_string()),
            GraphValue::Float(v) => Ok(crate::types::format_number(*v)),
            GraphValue::Bool(v) => Ok(if *v { "True" } else { "False" }.to_string()),
            other => Err(self.invalid(
                attribute,
                format!("labels must be scalars, found {}", other.kind()),
            )),
        }
    }
}

/// A numeric scalar, also accepting a one-element array (numpy 0-d/1-d quirk).
fn scalar_f64(value: &GraphValue) -> Option<f64> {
    match value {
        GraphValue::List(items) if items.len() == 1 => items[0].as_f64(),
        other => other.as_f64(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(entries: Vec<(&str, GraphValue)>) -> ObjectState {
        ObjectState::new(entries.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
            .with_type_name("test.Type")
    }

    #[test]
    fn test_none_attribute_is_absent() {
        let s = state(vec![("mean_", GraphValue::None)]);
        assert!(s.get("mean_").is_none());
        assert!(matches!(
            s.require("mean_"),
            Err(DecodeError::MissingAttribute { .. })
        ));
    }

    #[test]
    fn test_single_row_matrix_flattens() {
        let s = state(vec![(
            "coef_",
            GraphValue::List(vec![GraphValue::floats(&[1.0, 2.0])]),
        )]);
        assert_eq!(s.f64_vec("coef_").unwrap(), vec![1.0, 2.0]);
        assert_eq!(s.f64_matrix("coef_").unwrap(), vec![vec![1.0, 2.0]]);
    }

    #[test]
    fn test_labels_from_ints() {
        let s = state(vec![(
            "classes_",
            GraphValue::List(vec![GraphValue::Int(0), GraphValue::Int(1)]),
        )]);
        assert_eq!(s.label_vec("classes_").unwrap(), vec!["0", "1"]);
    }

    #[test]
    fn test_scalar_from_one_element_array() {
        let s = state(vec![("intercept_", GraphValue::floats(&[0.5]))]);
        assert_eq!(s.f64("intercept_").unwrap(), 0.5);
    }

    #[test]
    fn test_wrong_kind_reports_type_name() {
        let s = state(vec![("expr", GraphValue::Int(3))]);
        let err = s.string("expr").unwrap_err();
        assert!(err.to_string().contains("test.Type"));
    }
}
