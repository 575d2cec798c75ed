//! Per-column affine scalers.

use super::{Transformer, check_width, numbers};
use crate::compiler::{DocumentEncoder, Feature, expect_features};
use crate::document::{Expression, Function};
use crate::error::{CompileError, DecodeError, EvaluationError};
use crate::graph::ObjectState;
use crate::registry::{Constructed, TypeRegistry};
use crate::types::{Datum, OpType};
use std::sync::Arc;

pub const STANDARD_SCALER: &str = "sklearn.preprocessing._data.StandardScaler";
pub const MIN_MAX_SCALER: &str = "sklearn.preprocessing._data.MinMaxScaler";

/// `(x - mean) / scale`, either part optional.
#[derive(Debug, Clone, PartialEq)]
pub struct StandardScaler {
    mean: Option<Vec<f64>>,
    scale: Option<Vec<f64>>,
    n_features: usize,
}

impl StandardScaler {
    pub fn new(mean: Option<Vec<f64>>, scale: Option<Vec<f64>>) -> Result<Self, DecodeError> {
        Self::build(mean, scale, None)
    }

    fn build(
        mean: Option<Vec<f64>>,
        scale: Option<Vec<f64>>,
        n_features: Option<usize>,
    ) -> Result<Self, DecodeError> {
        let invalid = |attribute: &str, message: String| DecodeError::InvalidAttribute {
            type_name: STANDARD_SCALER.into(),
            attribute: attribute.into(),
            message,
        };
        let n_features = match (&mean, &scale, n_features) {
            (Some(m), Some(s), _) if m.len() != s.len() => {
                return Err(invalid(
                    "scale_",
                    format!("has {} entries, mean_ has {}", s.len(), m.len()),
                ));
            }
            (Some(v), _, _) | (None, Some(v), _) => v.len(),
            (None, None, Some(n)) => n,
            (None, None, None) => {
                return Err(invalid("mean_", "is required when scale_ is absent".into()));
            }
        };
        Ok(Self {
            mean,
            scale,
            n_features,
        })
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let mean = if state.bool_or("with_mean", true)? {
            Some(state.f64_vec("mean_")?)
        } else {
            None
        };
        let scale = if state.bool_or("with_std", true)? {
            Some(state.f64_vec("scale_")?)
        } else {
            None
        };
        let n_features = match (&mean, &scale) {
            (None, None) => Some(state.usize("n_features_in_")?),
            _ => None,
        };
        Ok(Constructed::Transformer(Arc::new(Self::build(
            mean, scale, n_features,
        )?)))
    }

    fn scale_value(&self, j: usize, x: f64) -> f64 {
        let mut v = x;
        if let Some(mean) = &self.mean {
            v -= mean[j];
        }
        if let Some(scale) = &self.scale {
            v /= scale[j];
        }
        v
    }
}

impl Transformer for StandardScaler {
    fn type_name(&self) -> &'static str {
        STANDARD_SCALER
    }

    fn transform(&self, row: &[Datum]) -> Result<Vec<Datum>, EvaluationError> {
        check_width(row, self.n_features)?;
        Ok(numbers(row, STANDARD_SCALER)?
            .into_iter()
            .enumerate()
            .map(|(j, x)| Datum::from(x.map(|x| self.scale_value(j, x))))
            .collect())
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Vec<Feature>, CompileError> {
        expect_features(step, &features, self.n_features)?;
        if self.mean.is_none() && self.scale.is_none() {
            return Ok(features);
        }
        features
            .iter()
            .enumerate()
            .map(|(j, feature)| {
                feature.require_continuous(step)?;
                let mut expr = feature.expression();
                if let Some(mean) = &self.mean {
                    expr = Expression::apply(
                        Function::Subtract,
                        vec![expr, Expression::constant(mean[j])],
                    );
                }
                if let Some(scale) = &self.scale {
                    expr = Expression::apply(
                        Function::Divide,
                        vec![expr, Expression::constant(scale[j])],
                    );
                }
                Ok(encoder.derive(
                    format!("{step}({})", feature.name),
                    OpType::Continuous,
                    expr,
                ))
            })
            .collect()
    }
}

/// `x * scale + min`.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxScaler {
    min: Vec<f64>,
    scale: Vec<f64>,
}

impl MinMaxScaler {
    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let min = state.f64_vec("min_")?;
        let scale = state.f64_vec("scale_")?;
        if min.len() != scale.len() {
            return Err(DecodeError::InvalidAttribute {
                type_name: MIN_MAX_SCALER.into(),
                attribute: "scale_".into(),
                message: format!("has {} entries, min_ has {}", scale.len(), min.len()),
            });
        }
        Ok(Constructed::Transformer(Arc::new(Self { min, scale })))
    }
}

impl Transformer for MinMaxScaler {
    fn type_name(&self) -> &'static str {
        MIN_MAX_SCALER
    }

    fn transform(&self, row: &[Datum]) -> Result<Vec<Datum>, EvaluationError> {
        check_width(row, self.min.len())?;
        Ok(numbers(row, MIN_MAX_SCALER)?
            .into_iter()
            .enumerate()
            .map(|(j, x)| Datum::from(x.map(|x| x * self.scale[j] + self.min[j])))
            .collect())
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Vec<Feature>, CompileError> {
        expect_features(step, &features, self.min.len())?;
        features
            .iter()
            .enumerate()
            .map(|(j, feature)| {
                feature.require_continuous(step)?;
                let scaled = Expression::apply(
                    Function::Multiply,
                    vec![feature.expression(), Expression::constant(self.scale[j])],
                );
                let expr = Expression::apply(
                    Function::Add,
                    vec![scaled, Expression::constant(self.min[j])],
                );
                Ok(encoder.derive(
                    format!("{step}({})", feature.name),
                    OpType::Continuous,
                    expr,
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphValue;

    fn state(type_name: &str, entries: Vec<(&str, GraphValue)>) -> ObjectState {
        match GraphValue::object(type_name, entries) {
            GraphValue::Object(obj) => obj.state.clone(),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_standard_scaler_transform() {
        let scaler = StandardScaler::new(Some(vec![1.0, 10.0]), Some(vec![2.0, 5.0])).unwrap();
        let out = scaler
            .transform(&[Datum::Text("3".into()), Datum::Missing])
            .unwrap();
        assert_eq!(out, vec![Datum::Number(1.0), Datum::Missing]);
    }

    #[test]
    fn test_standard_scaler_width_checked() {
        let scaler = StandardScaler::new(Some(vec![1.0]), None).unwrap();
        assert!(matches!(
            scaler.transform(&[Datum::Number(1.0), Datum::Number(2.0)]),
            Err(EvaluationError::ShapeMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn test_standard_scaler_without_mean() {
        let s = state(
            STANDARD_SCALER,
            vec![
                ("with_mean", GraphValue::Bool(false)),
                ("mean_", GraphValue::floats(&[100.0])),
                ("scale_", GraphValue::floats(&[4.0])),
            ],
        );
        let Constructed::Transformer(t) = StandardScaler::from_state(&s, &TypeRegistry::new())
            .unwrap()
        else {
            panic!("expected a transformer");
        };
        assert_eq!(
            t.transform(&[Datum::Number(2.0)]).unwrap(),
            vec![Datum::Number(0.5)]
        );
    }

    #[test]
    fn test_min_max_scaler_length_mismatch() {
        let s = state(
            MIN_MAX_SCALER,
            vec![
                ("min_", GraphValue::floats(&[0.0, 1.0])),
                ("scale_", GraphValue::floats(&[1.0])),
            ],
        );
        assert!(matches!(
            MinMaxScaler::from_state(&s, &TypeRegistry::new()),
            Err(DecodeError::InvalidAttribute { .. })
        ));
    }

    #[test]
    fn test_min_max_scaler_transform() {
        let scaler = MinMaxScaler {
            min: vec![-1.0],
            scale: vec![0.5],
        };
        assert_eq!(
            scaler.transform(&[Datum::Number(4.0)]).unwrap(),
            vec![Datum::Number(1.0)]
        );
    }
}
