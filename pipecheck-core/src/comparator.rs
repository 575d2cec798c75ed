//! Native vs document inference, field by field.
//!
//! [`compare`] returns a lazy iterator: each step scores one record through
//! both paths and compares every mapped result field. Disagreements are data
//! ([`ComparisonResult::Mismatch`]); evaluation failures on either path end
//! the case and are yielded as errors.

use crate::compiler::FieldMap;
use crate::error::HarnessError;
use crate::evaluator::DocumentEvaluator;
use crate::pipeline::Pipeline;
use crate::types::{Datum, InputRecord, parse_number};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::collections::HashSet;
use std::sync::Arc;

/// Numeric agreement thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Tolerance {
    pub absolute: f64,
    pub relative: f64,
}

impl Default for Tolerance {
    fn default() -> Self {
        Self {
            absolute: 1e-13,
            relative: 1e-13,
        }
    }
}

impl Tolerance {
    pub fn new(absolute: f64, relative: f64) -> Self {
        Self { absolute, relative }
    }

    pub fn exact() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Whether `expected` and `actual` agree.
    pub fn matches(&self, expected: f64, actual: f64) -> bool {
        if expected == actual || (expected.is_nan() && actual.is_nan()) {
            return true;
        }
        if !expected.is_finite() || !actual.is_finite() {
            return false;
        }
        let delta = (expected - actual).abs();
        delta <= self.absolute || delta <= self.relative * expected.abs().max(actual.abs())
    }
}

/// Outcome for one field of one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ComparisonResult {
    Match,
    Mismatch {
        /// Native value.
        expected: Datum,
        /// Document value.
        actual: Datum,
        /// Absolute difference, for numeric pairs.
        delta: Option<f64>,
    },
    Excluded,
}

impl ComparisonResult {
    pub fn is_mismatch(&self) -> bool {
        matches!(self, ComparisonResult::Mismatch { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldComparison {
    pub field: String,
    pub result: ComparisonResult,
}

/// All field comparisons for one input record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordComparison {
    /// Zero-based record index.
    pub record: usize,
    pub fields: Vec<FieldComparison>,
}

impl RecordComparison {
    pub fn mismatches(&self) -> impl Iterator<Item = &FieldComparison> {
        self.fields.iter().filter(|f| f.result.is_mismatch())
    }

    pub fn is_match(&self) -> bool {
        self.mismatches().next().is_none()
    }
}

/// Predicate over document output field names; `true` excludes the field.
pub type Exclusion = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Exclude nothing.
pub fn exclude_none() -> Exclusion {
    Arc::new(|_| false)
}

/// Exclude exactly the named fields.
pub fn exclude_fields<I, S>(fields: I) -> Exclusion
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let fields: HashSet<String> = fields.into_iter().map(Into::into).collect();
    if fields.is_empty() {
        return exclude_none();
    }
    Arc::new(move |name| fields.contains(name))
}

/// Compare two values under `tolerance`.
pub fn compare_values(expected: &Datum, actual: &Datum, tolerance: &Tolerance) -> ComparisonResult {
    let mismatch = |delta| ComparisonResult::Mismatch {
        expected: expected.clone(),
        actual: actual.clone(),
        delta,
    };
    match (expected, actual) {
        (Datum::Missing, Datum::Missing) => ComparisonResult::Match,
        (Datum::Text(a), Datum::Text(b)) if a == b => ComparisonResult::Match,
        (Datum::Missing, _) | (_, Datum::Missing) => mismatch(None),
        _ => match (numeric(expected), numeric(actual)) {
            (Some(a), Some(b)) if tolerance.matches(a, b) => ComparisonResult::Match,
            (Some(a), Some(b)) => mismatch(Some((a - b).abs())),
            _ => mismatch(None),
        },
    }
}

fn numeric(value: &Datum) -> Option<f64> {
    match value {
        Datum::Number(v) => Some(*v),
        Datum::Text(s) => parse_number(s),
        Datum::Missing => None,
    }
}

/// Lazy record-by-record comparison.
pub struct Comparator<'a, I> {
    pipeline: &'a Pipeline,
    evaluator: &'a DocumentEvaluator,
    field_map: &'a FieldMap,
    tolerance: Tolerance,
    exclude: &'a (dyn Fn(&str) -> bool + Send + Sync),
    records: std::iter::Enumerate<I>,
    failed: bool,
}

/// Compare native and document inference over `records`.
pub fn compare<'a, I>(
    pipeline: &'a Pipeline,
    evaluator: &'a DocumentEvaluator,
    field_map: &'a FieldMap,
    records: I,
    tolerance: &Tolerance,
    exclude: &'a (dyn Fn(&str) -> bool + Send + Sync),
) -> Comparator<'a, I::IntoIter>
where
    I: IntoIterator,
    I::Item: Borrow<InputRecord>,
{
    Comparator {
        pipeline,
        evaluator,
        field_map,
        tolerance: *tolerance,
        exclude,
        records: records.into_iter().enumerate(),
        failed: false,
    }
}

impl<I> Comparator<'_, I> {
    fn compare_record(
        &self,
        index: usize,
        record: &InputRecord,
    ) -> Result<RecordComparison, HarnessError> {
        let evaluation = |source| HarnessError::Evaluation {
            record: index,
            source,
        };
        let native = self.pipeline.predict(record).map_err(evaluation)?;
        let document = self.evaluator.evaluate(record).map_err(evaluation)?;

        let fields = self
            .field_map
            .iter()
            .map(|(result, field)| {
                let result = if (self.exclude)(field) {
                    ComparisonResult::Excluded
                } else {
                    let expected = native.get(result).unwrap_or(&Datum::Missing);
                    let actual = document.get(field).unwrap_or(&Datum::Missing);
                    compare_values(expected, actual, &self.tolerance)
                };
                FieldComparison {
                    field: field.to_string(),
                    result,
                }
            })
            .collect();
        Ok(RecordComparison {
            record: index,
            fields,
        })
    }
}

impl<I> Iterator for Comparator<'_, I>
where
    I: Iterator,
    I::Item: Borrow<InputRecord>,
{
    type Item = Result<RecordComparison, HarnessError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let (index, record) = self.records.next()?;
        let outcome = self.compare_record(index, record.borrow());
        match &outcome {
            Ok(comparison) if !comparison.is_match() => {
                tracing::debug!(
                    record = index,
                    mismatches = comparison.mismatches().count(),
                    "Record mismatch"
                );
            }
            Err(e) => {
                tracing::debug!(record = index, error = %e, "Record evaluation failed");
                self.failed = true;
            }
            Ok(_) => {}
        }
        Some(outcome)
    }
}
