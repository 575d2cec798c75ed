//! One-hot encoding of categorical input columns.
//!
//! Each input column expands into one 1.0/0.0 indicator per known category.
//! The document form is a `NormDiscrete` field per indicator.
//!
//! ```
//! use pipecheck_core::Datum;
//! use pipecheck_core::pipeline::Transformer;
//! use pipecheck_core::pipeline::onehot::OneHotEncoder;
//!
//! let encoder = OneHotEncoder::new(vec![vec!["red".into(), "green".into()]]);
//! let row = encoder.transform(&[Datum::Text("green".into())]).unwrap();
//! assert_eq!(row, vec![Datum::Number(0.0), Datum::Number(1.0)]);
//! ```

use super::{Transformer, check_width};
use crate::compiler::{DocumentEncoder, Feature, expect_features};
use crate::document::Expression;
use crate::error::{CompileError, DecodeError, EvaluationError};
use crate::graph::ObjectState;
use crate::registry::{Constructed, TypeRegistry};
use crate::types::{Datum, OpType};
use std::sync::Arc;

pub const ONE_HOT_ENCODER: &str = "sklearn.preprocessing._encoders.OneHotEncoder";

/// One indicator column per (input, category) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct OneHotEncoder {
    categories: Vec<Vec<String>>,
    ignore_unknown: bool,
}

impl OneHotEncoder {
    pub fn new(categories: Vec<Vec<String>>) -> Self {
        Self {
            categories,
            ignore_unknown: false,
        }
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let categories = state.label_matrix("categories_")?;
        let ignore_unknown = match state.get("handle_unknown") {
            None => false,
            Some(_) => match state.string("handle_unknown")?.as_str() {
                "error" => false,
                "ignore" => true,
                other => {
                    return Err(DecodeError::InvalidAttribute {
                        type_name: ONE_HOT_ENCODER.into(),
                        attribute: "handle_unknown".into(),
                        message: format!("unsupported value '{other}'"),
                    });
                }
            },
        };
        Ok(Constructed::Transformer(Arc::new(Self {
            categories,
            ignore_unknown,
        })))
    }
}

impl Transformer for OneHotEncoder {
    fn type_name(&self) -> &'static str {
        ONE_HOT_ENCODER
    }

    fn transform(&self, row: &[Datum]) -> Result<Vec<Datum>, EvaluationError> {
        check_width(row, self.categories.len())?;
        let mut out = Vec::with_capacity(self.categories.iter().map(Vec::len).sum());
        for (datum, categories) in row.iter().zip(&self.categories) {
            let Some(value) = datum.to_category() else {
                out.extend(categories.iter().map(|_| Datum::Missing));
                continue;
            };
            if !self.ignore_unknown && !categories.contains(&value) {
                return Err(EvaluationError::InvalidValue {
                    field: ONE_HOT_ENCODER.to_string(),
                    value,
                });
            }
            out.extend(
                categories
                    .iter()
                    .map(|c| Datum::Number(if *c == value { 1.0 } else { 0.0 })),
            );
        }
        Ok(out)
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Vec<Feature>, CompileError> {
        expect_features(step, &features, self.categories.len())?;
        let mut out = Vec::new();
        for (feature, categories) in features.iter().zip(&self.categories) {
            // An empty value list leaves the field unrestricted.
            let declared: &[String] = if self.ignore_unknown { &[] } else { categories };
            let feature = encoder.to_categorical(step, feature, declared)?;
            for category in categories {
                out.push(encoder.derive(
                    format!("{step}({}={category})", feature.name),
                    OpType::Continuous,
                    Expression::NormDiscrete {
                        field: feature.name.clone(),
                        value: category.clone(),
                    },
                ));
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> OneHotEncoder {
        OneHotEncoder::new(vec![vec!["a".into(), "b".into()], vec!["1".into(), "2".into()]])
    }

    #[test]
    fn test_transform_indicators() {
        let out = encoder()
            .transform(&[Datum::Text("b".into()), Datum::Number(1.0)])
            .unwrap();
        assert_eq!(
            out,
            vec![
                Datum::Number(0.0),
                Datum::Number(1.0),
                Datum::Number(1.0),
                Datum::Number(0.0),
            ]
        );
    }

    #[test]
    fn test_missing_input_yields_missing_columns() {
        let out = encoder()
            .transform(&[Datum::Missing, Datum::Text("2".into())])
            .unwrap();
        assert_eq!(&out[..2], &[Datum::Missing, Datum::Missing]);
    }

    #[test]
    fn test_unknown_category_rejected() {
        assert!(matches!(
            encoder().transform(&[Datum::Text("c".into()), Datum::Text("1".into())]),
            Err(EvaluationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_unknown_category_ignored() {
        let enc = OneHotEncoder {
            ignore_unknown: true,
            ..encoder()
        };
        let out = enc
            .transform(&[Datum::Text("c".into()), Datum::Text("1".into())])
            .unwrap();
        assert_eq!(&out[..2], &[Datum::Number(0.0), Datum::Number(0.0)]);
    }
}
