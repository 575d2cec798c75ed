//! B-spline basis expansion.
//!
//! A spline of degree `k` over knots `t` with `n = len(t) - k - 1` coefficients
//! evaluates as `sum_i c[i] * B[i,k](x)`. The basis follows the Cox-de Boor
//! recursion:
//!
//! ```text
//! B[i,0](x) = 1 if i == m else 0
//! B[i,p](x) = (x - t[i]) / (t[i+p] - t[i]) * B[i,p-1](x)
//!           + (t[i+p+1] - x) / (t[i+p+1] - t[i+1]) * B[i+1,p-1](x)
//! ```
//!
//! where `m` is the knot interval containing `x`, clamped to `[k, n-1]` so
//! points outside the base interval extrapolate from the nearest polynomial
//! piece. Terms with a zero denominator are dropped.
//!
//! Native evaluation and the encoded document perform the same operations in
//! the same order, so both paths produce identical values.

use super::{Transformer, check_width};
use crate::compiler::{DocumentEncoder, Feature, expect_features};
use crate::document::{Expression, Function};
use crate::error::{CompileError, DecodeError, EvaluationError};
use crate::graph::ObjectState;
use crate::registry::{Constructed, TypeRegistry};
use crate::types::{Datum, OpType};
use std::sync::Arc;

pub const BSPLINE: &str = "scipy.interpolate._bsplines.BSpline";
pub const BSPLINE_TRANSFORMER: &str = "sklearn2pmml.preprocessing.BSplineTransformer";

/// A fitted univariate B-spline.
#[derive(Debug, Clone, PartialEq)]
pub struct BSpline {
    t: Vec<f64>,
    c: Vec<f64>,
    k: usize,
    n: usize,
    extrapolate: bool,
}

impl BSpline {
    pub fn new(t: Vec<f64>, c: Vec<f64>, k: usize, extrapolate: bool) -> Result<Self, DecodeError> {
        let invalid = |attribute: &str, message: String| DecodeError::InvalidAttribute {
            type_name: BSPLINE.into(),
            attribute: attribute.into(),
            message,
        };
        if t.len() < 2 * k + 2 {
            return Err(invalid(
                "t",
                format!("degree {k} needs at least {} knots, got {}", 2 * k + 2, t.len()),
            ));
        }
        if t.iter().any(|v| !v.is_finite()) {
            return Err(invalid("t", "knots must be finite".into()));
        }
        if t.windows(2).any(|w| w[1] < w[0]) {
            return Err(invalid("t", "knots must be non-decreasing".into()));
        }
        let n = t.len() - k - 1;
        if c.len() < n {
            return Err(invalid(
                "c",
                format!("{} knots need {n} coefficients, got {}", t.len(), c.len()),
            ));
        }
        Ok(Self {
            t,
            c,
            k,
            n,
            extrapolate,
        })
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let spline = Self::new(
            state.f64_vec("t")?,
            state.f64_vec("c")?,
            state.usize("k")?,
            state.bool_or("extrapolate", true)?,
        )?;
        Ok(Constructed::Spline(spline))
    }

    pub fn degree(&self) -> usize {
        self.k
    }

    pub fn knots(&self) -> &[f64] {
        &self.t
    }

    /// Number of basis functions (and coefficients used).
    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn extrapolates(&self) -> bool {
        self.extrapolate
    }

    /// Knot interval index of `x`, as a float so it can be compared in documents.
    fn interval(&self, x: f64) -> f64 {
        (self.k + 1..self.n).fold(self.k as f64, |acc, j| {
            acc + if x >= self.t[j] { 1.0 } else { 0.0 }
        })
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        if !self.extrapolate && (x < self.t[self.k] || x > self.t[self.n]) {
            return f64::NAN;
        }
        let m = self.interval(x);
        let count = self.t.len() - 1;
        let mut basis: Vec<f64> = (0..count)
            .map(|i| if m == i as f64 { 1.0 } else { 0.0 })
            .collect();
        for p in 1..=self.k {
            basis = (0..count - p)
                .map(|i| {
                    let (d1, d2) = self.denominators(i, p);
                    let left = (d1 != 0.0).then(|| (x - self.t[i]) / d1 * basis[i]);
                    let right =
                        (d2 != 0.0).then(|| (self.t[i + p + 1] - x) / d2 * basis[i + 1]);
                    match (left, right) {
                        (Some(l), Some(r)) => l + r,
                        (Some(v), None) | (None, Some(v)) => v,
                        (None, None) => 0.0,
                    }
                })
                .collect();
        }
        (0..self.n)
            .map(|i| self.c[i] * basis[i])
            .reduce(|acc, v| acc + v)
            .unwrap_or(0.0)
    }

    fn denominators(&self, i: usize, p: usize) -> (f64, f64) {
        (
            self.t[i + p] - self.t[i],
            self.t[i + p + 1] - self.t[i + 1],
        )
    }

    /// Emit the basis as derived fields and return the spline value feature.
    fn encode(&self, step: &str, encoder: &mut DocumentEncoder, input: &Feature) -> Feature {
        let x = input.expression();

        let mut terms = vec![Expression::constant(self.k as f64)];
        terms.extend((self.k + 1..self.n).map(|j| {
            Expression::apply(
                Function::GreaterOrEqual,
                vec![x.clone(), Expression::constant(self.t[j])],
            )
        }));
        let interval_expr = if terms.len() == 1 {
            terms.remove(0)
        } else {
            Expression::apply(Function::Add, terms)
        };
        let interval = encoder.derive(format!("{step}[m]"), OpType::Continuous, interval_expr);

        let count = self.t.len() - 1;
        let mut basis: Vec<Feature> = (0..count)
            .map(|i| {
                encoder.derive(
                    format!("{step}[B{i},0]"),
                    OpType::Continuous,
                    Expression::apply(
                        Function::Equal,
                        vec![interval.expression(), Expression::constant(i as f64)],
                    ),
                )
            })
            .collect();
        for p in 1..=self.k {
            basis = (0..count - p)
                .map(|i| {
                    let (d1, d2) = self.denominators(i, p);
                    let left = (d1 != 0.0).then(|| {
                        weighted(
                            Expression::apply(
                                Function::Subtract,
                                vec![x.clone(), Expression::constant(self.t[i])],
                            ),
                            d1,
                            &basis[i],
                        )
                    });
                    let right = (d2 != 0.0).then(|| {
                        weighted(
                            Expression::apply(
                                Function::Subtract,
                                vec![Expression::constant(self.t[i + p + 1]), x.clone()],
                            ),
                            d2,
                            &basis[i + 1],
                        )
                    });
                    let expr = match (left, right) {
                        (Some(l), Some(r)) => Expression::apply(Function::Add, vec![l, r]),
                        (Some(v), None) | (None, Some(v)) => v,
                        (None, None) => Expression::constant(0.0),
                    };
                    encoder.derive(format!("{step}[B{i},{p}]"), OpType::Continuous, expr)
                })
                .collect();
        }

        let mut products: Vec<Expression> = (0..self.n)
            .map(|i| {
                Expression::apply(
                    Function::Multiply,
                    vec![Expression::constant(self.c[i]), basis[i].expression()],
                )
            })
            .collect();
        let value = if products.len() == 1 {
            products.remove(0)
        } else {
            Expression::apply(Function::Add, products)
        };
        encoder.derive(format!("{step}({})", input.name), OpType::Continuous, value)
    }
}

/// `numerator / denominator * basis`
fn weighted(numerator: Expression, denominator: f64, basis: &Feature) -> Expression {
    Expression::apply(
        Function::Multiply,
        vec![
            Expression::apply(
                Function::Divide,
                vec![numerator, Expression::constant(denominator)],
            ),
            basis.expression(),
        ],
    )
}

/// Applies a [`BSpline`] to a single input column.
#[derive(Debug, Clone, PartialEq)]
pub struct BSplineTransformer {
    bspline: BSpline,
}

impl BSplineTransformer {
    pub fn new(bspline: BSpline) -> Self {
        Self { bspline }
    }

    pub fn bspline(&self) -> &BSpline {
        &self.bspline
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let bspline = registry.spline(state.require("bspline")?)?;
        Ok(Constructed::Transformer(Arc::new(Self { bspline })))
    }
}

impl Transformer for BSplineTransformer {
    fn type_name(&self) -> &'static str {
        BSPLINE_TRANSFORMER
    }

    fn transform(&self, row: &[Datum]) -> Result<Vec<Datum>, EvaluationError> {
        check_width(row, 1)?;
        let x = row[0].to_number(BSPLINE_TRANSFORMER)?;
        Ok(vec![Datum::from(x.map(|x| self.bspline.evaluate(x)))])
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Vec<Feature>, CompileError> {
        expect_features(step, &features, 1)?;
        let input = &features[0];
        input.require_continuous(step)?;
        if !self.bspline.extrapolates() {
            return Err(CompileError::Unsupported {
                step: step.to_string(),
                type_name: BSPLINE_TRANSFORMER.to_string(),
                reason: "splines without extrapolation cannot be encoded".into(),
            });
        }
        Ok(vec![self.bspline.encode(step, encoder, input)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Cubic spline on clamped knots over [0, 4].
    fn cubic(c: Vec<f64>) -> BSpline {
        let t = vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0];
        BSpline::new(t, c, 3, true).unwrap()
    }

    #[test]
    fn test_partition_of_unity() {
        let spline = cubic(vec![1.0; 7]);
        for x in [0.0, 0.3, 1.0, 2.5, 3.999, 4.0] {
            let y = spline.evaluate(x);
            assert!((y - 1.0).abs() < 1e-12, "x={x} y={y}");
        }
    }

    #[test]
    fn test_reproduces_linear_function() {
        // Greville abscissae of the knot vector reproduce f(x) = x exactly.
        let t = [0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0, 4.0, 4.0, 4.0];
        let greville: Vec<f64> = (0..7).map(|i| (t[i + 1] + t[i + 2] + t[i + 3]) / 3.0).collect();
        let spline = cubic(greville);
        for x in [0.0, 0.5, 1.7, 3.2, 4.0] {
            assert!((spline.evaluate(x) - x).abs() < 1e-12);
        }
        // Extrapolation continues the last cubic piece, which is linear here.
        assert!((spline.evaluate(5.0) - 5.0).abs() < 1e-9);
        assert!((spline.evaluate(-1.0) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_extrapolation_gives_nan() {
        let t = vec![0.0, 0.0, 1.0, 1.0];
        let spline = BSpline::new(t, vec![1.0, 2.0], 1, false).unwrap();
        assert!(spline.evaluate(2.0).is_nan());
        assert_eq!(spline.evaluate(0.5), 1.5);
    }

    #[test]
    fn test_invalid_knots_rejected() {
        assert!(BSpline::new(vec![0.0, 1.0], vec![1.0], 1, true).is_err());
        assert!(BSpline::new(vec![0.0, 2.0, 1.0, 3.0], vec![1.0, 1.0], 1, true).is_err());
        assert!(BSpline::new(vec![0.0, 0.0, 1.0, 1.0], vec![1.0], 1, true).is_err());
    }

    #[test]
    fn test_missing_input() {
        let t = BSplineTransformer::new(cubic(vec![1.0; 7]));
        assert_eq!(t.transform(&[Datum::Missing]).unwrap(), vec![Datum::Missing]);
    }
}
