//! The declarative scoring document a pipeline compiles into.
//!
//! A document is a dependency-ordered set of field definitions:
//!
//! - the data dictionary declares raw input fields (and the target),
//! - derived fields compute new values from data fields and earlier derived fields,
//! - a single model scores the fields,
//! - output fields expose the prediction, class probabilities and
//!   post-processed values.
//!
//! [`Document::validate`] enforces the ordering invariant: every reference
//! resolves to something defined earlier, so the dependency structure is
//! acyclic by construction.

mod validate;

use crate::types::OpType;
use serde::{Deserialize, Serialize};

/// A complete scoring document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub header: Header,
    pub data_dictionary: Vec<DataField>,
    #[serde(default)]
    pub derived_fields: Vec<DerivedField>,
    pub model: Model,
    #[serde(default)]
    pub outputs: Vec<OutputField>,
}

/// Provenance of a compiled document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub application: String,
    pub version: String,
    /// SHA-256 of the object-graph stream the pipeline was decoded from.
    #[serde(default)]
    pub source_digest: Option<String>,
    /// Out-of-band artifacts the model was built from.
    #[serde(default)]
    pub artifacts: Vec<ArtifactLocation>,
}

/// An external artifact, referenced with the document's `file://` convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactLocation {
    pub step: String,
    pub uri: String,
    pub sha256: String,
}

/// Role of a data field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldUsage {
    Active,
    Target,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataField {
    pub name: String,
    pub op_type: OpType,
    pub usage: FieldUsage,
    /// Valid values of a categorical field; empty means unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedField {
    pub name: String,
    pub op_type: OpType,
    pub expression: Expression,
}

/// Expression language of derived and output fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expression {
    FieldRef {
        field: String,
    },
    Constant {
        value: f64,
    },
    Apply {
        function: Function,
        arguments: Vec<Expression>,
    },
    /// 1.0 when the categorical field equals `value`, else 0.0.
    NormDiscrete {
        field: String,
        value: String,
    },
}

impl Expression {
    pub fn field(name: impl Into<String>) -> Self {
        Expression::FieldRef { field: name.into() }
    }

    pub fn constant(value: f64) -> Self {
        Expression::Constant { value }
    }

    pub fn apply(function: Function, arguments: Vec<Expression>) -> Self {
        Expression::Apply {
            function,
            arguments,
        }
    }

    /// Names of all fields this expression reads.
    pub fn field_refs(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expression::FieldRef { field } | Expression::NormDiscrete { field, .. } => {
                out.push(field)
            }
            Expression::Constant { .. } => {}
            Expression::Apply { arguments, .. } => {
                for arg in arguments {
                    arg.collect_refs(out);
                }
            }
        }
    }
}

/// Built-in functions. Comparisons yield 1.0 or 0.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Function {
    Add,
    Subtract,
    Multiply,
    Divide,
    Pow,
    Negate,
    Exp,
    Ln,
    Log10,
    Sqrt,
    Sin,
    Cos,
    Tan,
    Tanh,
    Atan,
    Abs,
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

/// Accepted argument counts of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
}

impl Function {
    pub fn arity(self) -> Arity {
        use Function::*;
        match self {
            Add | Multiply => Arity::AtLeast(2),
            Subtract | Divide | Pow | Equal | NotEqual | LessThan | LessOrEqual | GreaterThan
            | GreaterOrEqual => Arity::Exactly(2),
            Negate | Exp | Ln | Log10 | Sqrt | Sin | Cos | Tan | Tanh | Atan | Abs => {
                Arity::Exactly(1)
            }
        }
    }

    pub fn accepts(self, n: usize) -> bool {
        match self.arity() {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
        }
    }
}

/// The scoring model of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Model {
    Regression(RegressionModel),
}

impl Model {
    pub fn target(&self) -> &str {
        match self {
            Model::Regression(m) => &m.target,
        }
    }

    pub fn field_refs(&self) -> Vec<&str> {
        match self {
            Model::Regression(m) => m
                .tables
                .iter()
                .flat_map(|t| t.predictors.iter().map(|p| p.field.as_str()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiningFunction {
    Regression,
    Classification,
}

/// Transformation applied to the raw regression-table scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    None,
    /// Regression: `1 / (1 + exp(-y))`. Binary classification: first table
    /// gets `1 / (1 + exp(-y))`, the second its complement.
    Logit,
    /// `exp(y_i - max) / sum_j exp(y_j - max)`.
    Softmax,
}

/// Linear scoring: one table per class (classification) or a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionModel {
    pub mining_function: MiningFunction,
    pub target: String,
    pub normalization: Normalization,
    pub tables: Vec<RegressionTable>,
    /// Class labels in the estimator's order; empty for regression.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTable {
    pub intercept: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_category: Option<String>,
    #[serde(default)]
    pub predictors: Vec<NumericPredictor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericPredictor {
    pub field: String,
    pub coefficient: f64,
}

/// A value exposed in the evaluation result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    pub name: String,
    pub op_type: OpType,
    pub feature: ResultFeature,
    /// Intermediate outputs are evaluated but not reported.
    #[serde(default = "default_true")]
    pub final_result: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "feature", rename_all = "snake_case")]
pub enum ResultFeature {
    PredictedValue,
    Probability { value: String },
    /// An expression over fields and earlier output fields.
    Transformed { expression: Expression },
}

impl Document {
    pub fn data_field(&self, name: &str) -> Option<&DataField> {
        self.data_dictionary.iter().find(|f| f.name == name)
    }

    pub fn active_fields(&self) -> impl Iterator<Item = &DataField> {
        self.data_dictionary
            .iter()
            .filter(|f| f.usage == FieldUsage::Active)
    }

    /// Names of the outputs reported by evaluation, in order.
    pub fn result_fields(&self) -> impl Iterator<Item = &OutputField> {
        self.outputs.iter().filter(|o| o.final_result)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_refs_walks_arguments() {
        let expr = Expression::apply(
            Function::Add,
            vec![
                Expression::field("a"),
                Expression::apply(Function::Exp, vec![Expression::field("b")]),
                Expression::NormDiscrete {
                    field: "c".into(),
                    value: "x".into(),
                },
                Expression::constant(1.0),
            ],
        );
        assert_eq!(expr.field_refs(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_function_arity() {
        assert!(Function::Add.accepts(5));
        assert!(!Function::Add.accepts(1));
        assert!(Function::Tanh.accepts(1));
        assert!(!Function::Divide.accepts(3));
    }

    #[test]
    fn test_expression_serializes_tagged() {
        let expr = Expression::apply(Function::Sin, vec![Expression::field("x")]);
        let json = serde_json::to_value(&expr).unwrap();
        assert_eq!(json["type"], "apply");
        assert_eq!(json["function"], "sin");
        assert_eq!(json["arguments"][0]["field"], "x");
    }
}
