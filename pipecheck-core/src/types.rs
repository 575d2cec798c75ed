//! Value types shared by the native pipeline and the document evaluator.

use crate::error::EvaluationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One raw input row as loaded from a tabular fixture: field name to string.
pub type InputRecord = BTreeMap<String, String>;

/// Raw strings that denote a missing value in tabular fixtures.
const MISSING_TOKENS: &[&str] = &["", "N/A", "NA", "NaN"];

/// A single scalar flowing through either evaluation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Datum {
    Number(f64),
    Text(String),
    Missing,
}

impl Datum {
    /// Interpret a raw fixture cell, mapping the missing-value tokens to `Missing`.
    pub fn from_raw(raw: &str) -> Self {
        let trimmed = raw.trim();
        if MISSING_TOKENS.contains(&trimmed) {
            Datum::Missing
        } else {
            Datum::Text(trimmed.to_string())
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Datum::Missing)
    }

    /// Numeric view of this value. `Ok(None)` means missing.
    pub fn to_number(&self, field: &str) -> Result<Option<f64>, EvaluationError> {
        match self {
            Datum::Number(v) => Ok(Some(*v)),
            Datum::Missing => Ok(None),
            Datum::Text(s) => parse_number(s)
                .map(Some)
                .ok_or_else(|| EvaluationError::InvalidValue {
                    field: field.to_string(),
                    value: s.clone(),
                }),
        }
    }

    /// Categorical view of this value. `None` means missing.
    pub fn to_category(&self) -> Option<String> {
        match self {
            Datum::Number(v) => Some(format_number(*v)),
            Datum::Text(s) => Some(s.clone()),
            Datum::Missing => None,
        }
    }
}

impl From<Option<f64>> for Datum {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Datum::Missing, Datum::Number)
    }
}

impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Datum::Number(v) => write!(f, "{v:e}"),
            Datum::Text(s) => write!(f, "\"{s}\""),
            Datum::Missing => write!(f, "<missing>"),
        }
    }
}

/// Parse a numeric cell the way both evaluation paths do.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok()
}

/// Canonical text form of a number used as a category label (`1.0` → `"1"`).
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.is_finite() && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// Operational type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Continuous,
    Categorical,
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpType::Continuous => write!(f, "continuous"),
            OpType::Categorical => write!(f, "categorical"),
        }
    }
}
