//! Document-driven inference.
//!
//! A [`DocumentEvaluator`] scores one [`InputRecord`] at a time against a
//! validated [`Document`]. Derived fields are evaluated lazily and memoized
//! per record.
//!
//! Two guards bound evaluation: the derived-field guard limits how deeply
//! derived fields may reference each other, the function guard limits the
//! nesting of function invocations. Both are chosen when the evaluator is
//! built; [`EvaluatorBuilder::unguarded`] removes them for documents known to
//! nest beyond the defaults.

use crate::document::{
    Document, Expression, Function, MiningFunction, Model, Normalization,
    RegressionModel, ResultFeature,
};
use crate::error::EvaluationError;
use crate::types::{Datum, InputRecord, OpType};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Default nesting limit for derived-field references.
pub const DEFAULT_DERIVED_FIELD_DEPTH: usize = 64;

/// Default nesting limit for function invocations.
pub const DEFAULT_FUNCTION_DEPTH: usize = 32;

/// A nesting-depth limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthGuard {
    pub limit: usize,
}

impl DepthGuard {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }
}

/// Configures and builds a [`DocumentEvaluator`].
#[derive(Debug, Clone)]
pub struct EvaluatorBuilder {
    document: Document,
    derived_field_guard: Option<DepthGuard>,
    function_guard: Option<DepthGuard>,
}

impl EvaluatorBuilder {
    pub fn new(document: Document) -> Self {
        Self {
            document,
            derived_field_guard: Some(DepthGuard::new(DEFAULT_DERIVED_FIELD_DEPTH)),
            function_guard: Some(DepthGuard::new(DEFAULT_FUNCTION_DEPTH)),
        }
    }

    pub fn derived_field_guard(mut self, guard: Option<DepthGuard>) -> Self {
        self.derived_field_guard = guard;
        self
    }

    pub fn function_guard(mut self, guard: Option<DepthGuard>) -> Self {
        self.function_guard = guard;
        self
    }

    /// Remove both guards.
    pub fn unguarded(self) -> Self {
        self.derived_field_guard(None).function_guard(None)
    }

    /// Keep the default guards when `guarded`, remove them otherwise.
    pub fn guarded(self, guarded: bool) -> Self {
        if guarded { self } else { self.unguarded() }
    }

    pub fn build(self) -> Result<DocumentEvaluator, EvaluationError> {
        self.document
            .validate()
            .map_err(EvaluationError::InvalidDocument)?;
        let derived_index = self
            .document
            .derived_fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), i))
            .collect();
        tracing::debug!(
            derived_fields = self.document.derived_fields.len(),
            derived_field_guard = ?self.derived_field_guard,
            function_guard = ?self.function_guard,
            "Built document evaluator"
        );
        Ok(DocumentEvaluator {
            document: self.document,
            derived_index,
            derived_field_guard: self.derived_field_guard,
            function_guard: self.function_guard,
        })
    }
}

/// Evaluates records against a document.
#[derive(Debug)]
pub struct DocumentEvaluator {
    document: Document,
    derived_index: HashMap<String, usize>,
    derived_field_guard: Option<DepthGuard>,
    function_guard: Option<DepthGuard>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Depth {
    derived: usize,
    function: usize,
}

struct Scores {
    value: Datum,
    probabilities: Vec<(String, Datum)>,
}

impl DocumentEvaluator {
    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn is_guarded(&self) -> bool {
        self.derived_field_guard.is_some() || self.function_guard.is_some()
    }

    /// Score one record. The result maps each reported output field to its value.
    pub fn evaluate(&self, record: &InputRecord) -> Result<BTreeMap<String, Datum>, EvaluationError> {
        let mut values: HashMap<String, Datum> = HashMap::new();
        for field in self.document.active_fields() {
            let raw = record
                .get(&field.name)
                .ok_or_else(|| EvaluationError::MissingField(field.name.clone()))?;
            let datum = Datum::from_raw(raw);
            let value = match field.op_type {
                OpType::Continuous => Datum::from(datum.to_number(&field.name)?),
                OpType::Categorical => {
                    if let Datum::Text(s) = &datum {
                        if !field.values.is_empty() && !field.values.contains(s) {
                            return Err(EvaluationError::InvalidValue {
                                field: field.name.clone(),
                                value: s.clone(),
                            });
                        }
                    }
                    datum
                }
            };
            values.insert(field.name.clone(), value);
        }

        let scores = match &self.document.model {
            Model::Regression(model) => self.score_regression(model, &mut values)?,
        };

        let mut result = BTreeMap::new();
        for output in &self.document.outputs {
            let value = match &output.feature {
                ResultFeature::PredictedValue => scores.value.clone(),
                ResultFeature::Probability { value } => scores
                    .probabilities
                    .iter()
                    .find(|(c, _)| c == value)
                    .map(|(_, p)| p.clone())
                    .unwrap_or(Datum::Missing),
                ResultFeature::Transformed { expression } => {
                    self.eval(expression, &mut values, Depth::default())?
                }
            };
            if output.final_result {
                result.insert(output.name.clone(), value.clone());
            }
            values.insert(output.name.clone(), value);
        }
        Ok(result)
    }

    fn score_regression(
        &self,
        model: &RegressionModel,
        values: &mut HashMap<String, Datum>,
    ) -> Result<Scores, EvaluationError> {
        let mut etas = Vec::with_capacity(model.tables.len());
        for table in &model.tables {
            let mut eta = table.intercept;
            for predictor in &table.predictors {
                match self.number(&predictor.field, values, Depth::default())? {
                    Some(x) => eta += predictor.coefficient * x,
                    None => {
                        return Ok(Scores {
                            value: Datum::Missing,
                            probabilities: Vec::new(),
                        });
                    }
                }
            }
            etas.push(eta);
        }

        match model.mining_function {
            MiningFunction::Regression => {
                let eta = etas[0];
                let value = match model.normalization {
                    Normalization::Logit => 1.0 / (1.0 + (-eta).exp()),
                    _ => eta,
                };
                Ok(Scores {
                    value: Datum::Number(value),
                    probabilities: Vec::new(),
                })
            }
            MiningFunction::Classification => {
                let probs: Vec<f64> = match model.normalization {
                    Normalization::Logit => {
                        let first = 1.0 / (1.0 + (-etas[0]).exp());
                        vec![first, 1.0 - first]
                    }
                    _ => {
                        let max = etas.iter().fold(f64::NEG_INFINITY, |m, v| m.max(*v));
                        let exps: Vec<f64> = etas.iter().map(|e| (e - max).exp()).collect();
                        let sum = exps.iter().fold(0.0, |acc, v| acc + v);
                        exps.iter().map(|e| e / sum).collect()
                    }
                };
                let by_category: HashMap<&str, f64> = model
                    .tables
                    .iter()
                    .zip(probs)
                    .filter_map(|(t, p)| t.target_category.as_deref().map(|c| (c, p)))
                    .collect();
                let mut best: Option<(&str, f64)> = None;
                let mut probabilities = Vec::with_capacity(model.categories.len());
                for category in &model.categories {
                    let p = by_category.get(category.as_str()).copied().unwrap_or(0.0);
                    if best.is_none_or(|(_, bp)| p > bp) {
                        best = Some((category.as_str(), p));
                    }
                    probabilities.push((category.clone(), Datum::Number(p)));
                }
                Ok(Scores {
                    value: best
                        .map(|(c, _)| Datum::Text(c.to_string()))
                        .unwrap_or(Datum::Missing),
                    probabilities,
                })
            }
        }
    }

    fn number(
        &self,
        field: &str,
        values: &mut HashMap<String, Datum>,
        depth: Depth,
    ) -> Result<Option<f64>, EvaluationError> {
        self.field_value(field, values, depth)?.to_number(field)
    }

    fn field_value(
        &self,
        name: &str,
        values: &mut HashMap<String, Datum>,
        depth: Depth,
    ) -> Result<Datum, EvaluationError> {
        if let Some(value) = values.get(name) {
            return Ok(value.clone());
        }
        let index = *self
            .derived_index
            .get(name)
            .ok_or_else(|| EvaluationError::UnknownField(name.to_string()))?;
        let depth = Depth {
            derived: depth.derived + 1,
            ..depth
        };
        if let Some(guard) = self.derived_field_guard {
            if depth.derived > guard.limit {
                return Err(EvaluationError::GuardViolation {
                    guard: "derived field",
                    limit: guard.limit,
                });
            }
        }
        let derived = &self.document.derived_fields[index];
        let value = self.eval(&derived.expression, values, depth)?;
        values.insert(name.to_string(), value.clone());
        Ok(value)
    }

    fn eval(
        &self,
        expr: &Expression,
        values: &mut HashMap<String, Datum>,
        depth: Depth,
    ) -> Result<Datum, EvaluationError> {
        match expr {
            Expression::Constant { value } => Ok(Datum::Number(*value)),
            Expression::FieldRef { field } => self.field_value(field, values, depth),
            Expression::NormDiscrete { field, value } => {
                let datum = self.field_value(field, values, depth)?;
                Ok(match datum.to_category() {
                    None => Datum::Missing,
                    Some(c) => Datum::Number(if c == *value { 1.0 } else { 0.0 }),
                })
            }
            Expression::Apply {
                function,
                arguments,
            } => {
                let depth = Depth {
                    function: depth.function + 1,
                    ..depth
                };
                if let Some(guard) = self.function_guard {
                    if depth.function > guard.limit {
                        return Err(EvaluationError::GuardViolation {
                            guard: "function",
                            limit: guard.limit,
                        });
                    }
                }
                let mut args = Vec::with_capacity(arguments.len());
                let mut missing = false;
                for arg in arguments {
                    match self.eval(arg, values, depth)? {
                        Datum::Number(v) => args.push(v),
                        Datum::Missing => missing = true,
                        Datum::Text(s) => {
                            return Err(EvaluationError::InvalidValue {
                                field: format!("{function:?}"),
                                value: s,
                            });
                        }
                    }
                }
                if missing {
                    return Ok(Datum::Missing);
                }
                Ok(Datum::Number(apply(*function, &args)))
            }
        }
    }
}

fn truth(b: bool) -> f64 {
    if b { 1.0 } else { 0.0 }
}

/// Apply a built-in function to arity-checked arguments.
pub(crate) fn apply(function: Function, args: &[f64]) -> f64 {
    use Function::*;
    match function {
        Add => args[1..].iter().fold(args[0], |acc, v| acc + v),
        Multiply => args[1..].iter().fold(args[0], |acc, v| acc * v),
        Subtract => args[0] - args[1],
        Divide => args[0] / args[1],
        Pow => args[0].powf(args[1]),
        Negate => -args[0],
        Exp => args[0].exp(),
        Ln => args[0].ln(),
        Log10 => args[0].log10(),
        Sqrt => args[0].sqrt(),
        Sin => args[0].sin(),
        Cos => args[0].cos(),
        Tan => args[0].tan(),
        Tanh => args[0].tanh(),
        Atan => args[0].atan(),
        Abs => args[0].abs(),
        Equal => truth(args[0] == args[1]),
        NotEqual => truth(args[0] != args[1]),
        LessThan => truth(args[0] < args[1]),
        LessOrEqual => truth(args[0] <= args[1]),
        GreaterThan => truth(args[0] > args[1]),
        GreaterOrEqual => truth(args[0] >= args[1]),
    }
}
