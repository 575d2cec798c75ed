//! Generalized linear estimators.

use super::{Estimator, Prediction, check_width, numbers};
use crate::compiler::{DocumentEncoder, Feature, expect_features};
use crate::document::{
    MiningFunction, Model, Normalization, NumericPredictor, RegressionModel, RegressionTable,
};
use crate::error::{CompileError, DecodeError, EvaluationError};
use crate::graph::ObjectState;
use crate::registry::{Constructed, TypeRegistry};
use crate::types::Datum;
use std::sync::Arc;

pub const LINEAR_REGRESSION: &str = "sklearn.linear_model._base.LinearRegression";
pub const LOGISTIC_REGRESSION: &str = "sklearn.linear_model._logistic.LogisticRegression";

/// `intercept + sum(coef[j] * x[j])`, accumulated left to right.
pub(crate) fn linear_predictor(intercept: f64, coef: &[f64], xs: &[f64]) -> f64 {
    coef.iter()
        .zip(xs)
        .fold(intercept, |acc, (c, x)| acc + c * x)
}

pub(crate) fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

pub(crate) fn regression_table(
    intercept: f64,
    coef: &[f64],
    features: &[Feature],
    target_category: Option<String>,
) -> RegressionTable {
    RegressionTable {
        intercept,
        target_category,
        predictors: coef
            .iter()
            .zip(features)
            .map(|(c, f)| NumericPredictor {
                field: f.name.clone(),
                coefficient: *c,
            })
            .collect(),
    }
}

/// All inputs as numbers, or `None` if any is missing.
pub(crate) fn complete_row(row: &[Datum], step: &str) -> Result<Option<Vec<f64>>, EvaluationError> {
    Ok(numbers(row, step)?.into_iter().collect())
}

pub(crate) fn check_features(
    step: &str,
    features: &[Feature],
    expected: usize,
) -> Result<(), CompileError> {
    expect_features(step, features, expected)?;
    features.iter().try_for_each(|f| f.require_continuous(step))
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearRegression {
    coef: Vec<f64>,
    intercept: f64,
}

impl LinearRegression {
    pub fn new(coef: Vec<f64>, intercept: f64) -> Self {
        Self { coef, intercept }
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let coef = state.f64_vec("coef_")?;
        let intercept = match state.get("intercept_") {
            Some(_) => state.f64("intercept_")?,
            None => 0.0,
        };
        Ok(Constructed::Estimator(Arc::new(Self { coef, intercept })))
    }
}

impl Estimator for LinearRegression {
    fn type_name(&self) -> &'static str {
        LINEAR_REGRESSION
    }

    fn predict(&self, row: &[Datum]) -> Result<Prediction, EvaluationError> {
        check_width(row, self.coef.len())?;
        let value = complete_row(row, LINEAR_REGRESSION)?
            .map(|xs| linear_predictor(self.intercept, &self.coef, &xs));
        Ok(Prediction::value(Datum::from(value)))
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Model, CompileError> {
        check_features(step, &features, self.coef.len())?;
        Ok(Model::Regression(RegressionModel {
            mining_function: MiningFunction::Regression,
            target: encoder.target_field().to_string(),
            normalization: Normalization::None,
            tables: vec![regression_table(self.intercept, &self.coef, &features, None)],
            categories: Vec::new(),
        }))
    }
}

/// Binary (logit) or multinomial (softmax) logistic regression.
#[derive(Debug, Clone, PartialEq)]
pub struct LogisticRegression {
    classes: Vec<String>,
    coef: Vec<Vec<f64>>,
    intercept: Vec<f64>,
}

impl LogisticRegression {
    pub fn new(
        classes: Vec<String>,
        coef: Vec<Vec<f64>>,
        intercept: Vec<f64>,
    ) -> Result<Self, DecodeError> {
        let invalid = |attribute: &str, message: String| DecodeError::InvalidAttribute {
            type_name: LOGISTIC_REGRESSION.into(),
            attribute: attribute.into(),
            message,
        };
        if classes.len() < 2 {
            return Err(invalid("classes_", format!("needs two or more classes, got {}", classes.len())));
        }
        let expected_rows = if classes.len() == 2 { 1 } else { classes.len() };
        if coef.len() != expected_rows {
            return Err(invalid(
                "coef_",
                format!("{} classes need {expected_rows} rows, got {}", classes.len(), coef.len()),
            ));
        }
        if intercept.len() != coef.len() {
            return Err(invalid(
                "intercept_",
                format!("has {} entries for {} coefficient rows", intercept.len(), coef.len()),
            ));
        }
        if coef.iter().any(|row| row.len() != coef[0].len()) {
            return Err(invalid("coef_", "rows differ in length".into()));
        }
        Ok(Self {
            classes,
            coef,
            intercept,
        })
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let classes = state.label_vec("classes_")?;
        if classes.len() > 2 && state.get("multi_class").is_some() && state.string("multi_class")? == "ovr" {
            return Err(DecodeError::InvalidAttribute {
                type_name: LOGISTIC_REGRESSION.into(),
                attribute: "multi_class".into(),
                message: "one-vs-rest multiclass models are not supported".into(),
            });
        }
        let model = Self::new(
            classes,
            state.f64_matrix("coef_")?,
            state.f64_vec("intercept_")?,
        )?;
        Ok(Constructed::Estimator(Arc::new(model)))
    }

    fn width(&self) -> usize {
        self.coef[0].len()
    }

    fn probabilities(&self, xs: &[f64]) -> Vec<f64> {
        let etas: Vec<f64> = self
            .coef
            .iter()
            .zip(&self.intercept)
            .map(|(coef, intercept)| linear_predictor(*intercept, coef, xs))
            .collect();
        if let [eta] = etas.as_slice() {
            let positive = sigmoid(*eta);
            return vec![1.0 - positive, positive];
        }
        let max = etas.iter().fold(f64::NEG_INFINITY, |m, v| m.max(*v));
        let exps: Vec<f64> = etas.iter().map(|e| (e - max).exp()).collect();
        let sum = exps.iter().fold(0.0, |acc, v| acc + v);
        exps.iter().map(|e| e / sum).collect()
    }
}

impl Estimator for LogisticRegression {
    fn type_name(&self) -> &'static str {
        LOGISTIC_REGRESSION
    }

    fn classes(&self) -> Option<&[String]> {
        Some(&self.classes)
    }

    fn predict(&self, row: &[Datum]) -> Result<Prediction, EvaluationError> {
        check_width(row, self.width())?;
        let Some(xs) = complete_row(row, LOGISTIC_REGRESSION)? else {
            return Ok(Prediction {
                value: Datum::Missing,
                probabilities: self
                    .classes
                    .iter()
                    .map(|c| (c.clone(), Datum::Missing))
                    .collect(),
            });
        };
        let probabilities = self.probabilities(&xs);
        let mut best: Option<(usize, f64)> = None;
        for (i, p) in probabilities.iter().enumerate() {
            if best.is_none_or(|(_, bp)| *p > bp) {
                best = Some((i, *p));
            }
        }
        Ok(Prediction {
            value: best
                .map(|(i, _)| Datum::Text(self.classes[i].clone()))
                .unwrap_or(Datum::Missing),
            probabilities: self
                .classes
                .iter()
                .cloned()
                .zip(probabilities.into_iter().map(Datum::Number))
                .collect(),
        })
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Model, CompileError> {
        check_features(step, &features, self.width())?;
        let (normalization, tables) = if self.classes.len() == 2 {
            (
                Normalization::Logit,
                vec![
                    regression_table(
                        self.intercept[0],
                        &self.coef[0],
                        &features,
                        Some(self.classes[1].clone()),
                    ),
                    regression_table(0.0, &[], &features, Some(self.classes[0].clone())),
                ],
            )
        } else {
            (
                Normalization::Softmax,
                self.coef
                    .iter()
                    .zip(&self.intercept)
                    .zip(&self.classes)
                    .map(|((coef, intercept), class)| {
                        regression_table(*intercept, coef, &features, Some(class.clone()))
                    })
                    .collect(),
            )
        };
        Ok(Model::Regression(RegressionModel {
            mining_function: MiningFunction::Classification,
            target: encoder.target_field().to_string(),
            normalization,
            tables,
            categories: self.classes.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_linear_regression_predict() {
        let lr = LinearRegression::new(vec![2.0, -1.0], 0.5);
        let p = lr
            .predict(&[Datum::Number(3.0), Datum::Text("1".into())])
            .unwrap();
        assert_eq!(p.value, Datum::Number(5.5));
        assert!(p.probabilities.is_empty());
    }

    #[test]
    fn test_linear_regression_missing() {
        let lr = LinearRegression::new(vec![1.0], 0.0);
        assert_eq!(lr.predict(&[Datum::Missing]).unwrap().value, Datum::Missing);
    }

    #[test]
    fn test_binary_logistic() {
        let clf = LogisticRegression::new(labels(&["a", "b"]), vec![vec![1.0]], vec![0.0]).unwrap();
        let p = clf.predict(&[Datum::Number(0.0)]).unwrap();
        // Tie goes to the first class.
        assert_eq!(p.value, Datum::Text("a".into()));
        assert_eq!(p.probabilities[1], ("b".to_string(), Datum::Number(0.5)));

        let p = clf.predict(&[Datum::Number(2.0)]).unwrap();
        assert_eq!(p.value, Datum::Text("b".into()));
    }

    #[test]
    fn test_multinomial_probabilities_sum_to_one() {
        let clf = LogisticRegression::new(
            labels(&["x", "y", "z"]),
            vec![vec![1.0], vec![0.0], vec![-1.0]],
            vec![0.0, 0.5, 0.0],
        )
        .unwrap();
        let p = clf.predict(&[Datum::Number(-3.0)]).unwrap();
        let total: f64 = p
            .probabilities
            .iter()
            .map(|(_, d)| d.to_number("p").unwrap().unwrap())
            .sum();
        assert!((total - 1.0).abs() < 1e-12);
        assert_eq!(p.value, Datum::Text("z".into()));
    }

    #[test]
    fn test_shape_validation() {
        assert!(LogisticRegression::new(labels(&["a"]), vec![vec![1.0]], vec![0.0]).is_err());
        assert!(LogisticRegression::new(labels(&["a", "b", "c"]), vec![vec![1.0]], vec![0.0]).is_err());
        assert!(
            LogisticRegression::new(labels(&["a", "b"]), vec![vec![1.0]], vec![0.0, 1.0]).is_err()
        );
    }
}
