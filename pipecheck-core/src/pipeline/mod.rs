//! In-memory pipeline model and native inference.
//!
//! A [`Pipeline`] is an ordered chain of named [`Step`]s: zero or more
//! transformers followed by exactly one final estimator. Every step carries two
//! capabilities: native evaluation (`transform` / `predict`) and encoding into
//! the document dialect (`encode`). The two must agree within tolerance;
//! checking that they do is the job of [`crate::comparator`].

pub mod bspline;
pub mod expression;
pub mod h2o;
pub mod linear;
pub mod onehot;
pub mod scalers;

use crate::compiler::{DocumentEncoder, Feature};
use crate::document::Model;
use crate::error::{ArtifactError, CompileError, DecodeError, EvaluationError};
use crate::graph::{GraphValue, ObjectState};
use crate::registry::{Constructed, TypeRegistry};
use crate::types::{Datum, InputRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const PMML_PIPELINE: &str = "sklearn2pmml.pipeline.PMMLPipeline";
pub const SKLEARN_PIPELINE: &str = "sklearn.pipeline.Pipeline";

/// Target field name used when the pipeline does not declare one.
pub const DEFAULT_TARGET: &str = "y";

/// A step that maps a row to a new row.
pub trait Transformer: fmt::Debug + Send + Sync {
    /// Fully qualified type name as it appears in the object graph.
    fn type_name(&self) -> &'static str;

    fn transform(&self, row: &[Datum]) -> Result<Vec<Datum>, EvaluationError>;

    /// Emit derived fields for this step and return the features it produces.
    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Vec<Feature>, CompileError>;
}

/// The final, prediction-bearing step.
pub trait Estimator: fmt::Debug + Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Class labels for classifiers, `None` for regressors.
    fn classes(&self) -> Option<&[String]> {
        None
    }

    fn predict(&self, row: &[Datum]) -> Result<Prediction, EvaluationError>;

    /// Build the document model scoring `features`.
    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Model, CompileError>;

    /// External artifact this estimator loads its parameters from.
    fn artifact(&self) -> Option<&ArtifactRef> {
        None
    }

    /// Produce a copy of this estimator bound to a local copy of its artifact.
    fn resolve_artifact(
        &self,
        step: &str,
        _local: &Path,
    ) -> Result<Arc<dyn Estimator>, ArtifactError> {
        Err(ArtifactError::NoArtifact(step.to_string()))
    }
}

/// Reference from a step to an out-of-band artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactRef {
    /// As stored in the object graph, relative to the fixture root.
    Unresolved { path: String },
    /// Bound to a materialized local file.
    Resolved { path: String, local: PathBuf },
}

impl ArtifactRef {
    pub fn path(&self) -> &str {
        match self {
            ArtifactRef::Unresolved { path } | ArtifactRef::Resolved { path, .. } => path,
        }
    }

    pub fn local(&self) -> Option<&Path> {
        match self {
            ArtifactRef::Unresolved { .. } => None,
            ArtifactRef::Resolved { local, .. } => Some(local),
        }
    }

    pub fn resolve(&self, local: &Path) -> ArtifactRef {
        ArtifactRef::Resolved {
            path: self.path().to_string(),
            local: local.to_path_buf(),
        }
    }
}

/// Output of an estimator for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub value: Datum,
    /// Class probabilities in class order; empty for regressors.
    pub probabilities: Vec<(String, Datum)>,
}

impl Prediction {
    pub fn value(value: Datum) -> Self {
        Self {
            value,
            probabilities: Vec::new(),
        }
    }
}

/// Pipeline-level name of a result value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ResultName {
    Prediction,
    Probability(String),
    /// The i-th output of the predict transformer.
    Transformed(usize),
}

impl fmt::Display for ResultName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultName::Prediction => write!(f, "prediction"),
            ResultName::Probability(c) => write!(f, "probability[{c}]"),
            ResultName::Transformed(i) => write!(f, "transformed[{i}]"),
        }
    }
}

/// Tagged pipeline step.
#[derive(Debug, Clone)]
pub enum Step {
    Transformer(Arc<dyn Transformer>),
    Estimator(Arc<dyn Estimator>),
}

impl Step {
    pub fn type_name(&self) -> &'static str {
        match self {
            Step::Transformer(t) => t.type_name(),
            Step::Estimator(e) => e.type_name(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NamedStep {
    pub name: String,
    pub step: Step,
}

/// A decoded estimator pipeline. Immutable; artifact resolution yields a new value.
#[derive(Debug, Clone)]
pub struct Pipeline {
    steps: Vec<NamedStep>,
    active_fields: Vec<String>,
    target_field: String,
    predict_transformer: Option<Arc<dyn Transformer>>,
    source_digest: Option<String>,
}

impl Pipeline {
    /// Assemble a pipeline, checking its shape.
    pub fn new(
        steps: Vec<NamedStep>,
        active_fields: Vec<String>,
        target_field: String,
        predict_transformer: Option<Arc<dyn Transformer>>,
    ) -> Result<Self, DecodeError> {
        let Some((last, init)) = steps.split_last() else {
            return Err(DecodeError::InvalidPipeline("pipeline has no steps".into()));
        };
        if !matches!(last.step, Step::Estimator(_)) {
            return Err(DecodeError::InvalidPipeline(format!(
                "final step '{}' ({}) is not an estimator",
                last.name,
                last.step.type_name()
            )));
        }
        if let Some(step) = init.iter().find(|s| matches!(s.step, Step::Estimator(_))) {
            return Err(DecodeError::InvalidPipeline(format!(
                "estimator '{}' is not the final step",
                step.name
            )));
        }
        let mut names = HashSet::new();
        for step in &steps {
            if !names.insert(step.name.as_str()) {
                return Err(DecodeError::InvalidPipeline(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }
        if active_fields.is_empty() {
            return Err(DecodeError::InvalidPipeline("no active fields".into()));
        }
        Ok(Self {
            steps,
            active_fields,
            target_field,
            predict_transformer,
            source_digest: None,
        })
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        let invalid = |attribute: &str, message: String| DecodeError::InvalidAttribute {
            type_name: state.type_name().to_string(),
            attribute: attribute.into(),
            message,
        };

        let GraphValue::List(items) = state.require("steps")? else {
            return Err(invalid("steps", "must be a list of (name, step) pairs".into()));
        };
        let mut steps = Vec::with_capacity(items.len());
        for item in items {
            let (name, value) = match item {
                GraphValue::List(pair) => match pair.as_slice() {
                    [GraphValue::Str(name), value] => (name.clone(), value),
                    _ => return Err(invalid("steps", "each step must be a (name, step) pair".into())),
                },
                other => {
                    return Err(invalid("steps", format!("expected a pair, found {}", other.kind())));
                }
            };
            steps.push(NamedStep {
                name,
                step: registry.step(value)?,
            });
        }

        let active_fields = match state.opt_string_vec("active_fields")? {
            Some(fields) => fields,
            None => match state.get("n_features_in_") {
                Some(_) => (1..=state.usize("n_features_in_")?)
                    .map(|i| format!("x{i}"))
                    .collect(),
                None => {
                    return Err(DecodeError::MissingAttribute {
                        type_name: state.type_name().to_string(),
                        attribute: "active_fields".into(),
                    });
                }
            },
        };
        let target_field = match state.opt_string_vec("target_fields")? {
            None => DEFAULT_TARGET.to_string(),
            Some(fields) => match <[String; 1]>::try_from(fields) {
                Ok([target]) => target,
                Err(fields) => {
                    return Err(invalid(
                        "target_fields",
                        format!("exactly one target is supported, got {}", fields.len()),
                    ));
                }
            },
        };
        let predict_transformer = state
            .get("predict_transformer")
            .map(|value| registry.transformer(value))
            .transpose()?;

        Pipeline::new(steps, active_fields, target_field, predict_transformer)
            .map(Constructed::Pipeline)
    }

    pub(crate) fn with_source_digest(mut self, digest: String) -> Self {
        self.source_digest = Some(digest);
        self
    }

    pub fn steps(&self) -> &[NamedStep] {
        &self.steps
    }

    pub fn active_fields(&self) -> &[String] {
        &self.active_fields
    }

    pub fn target_field(&self) -> &str {
        &self.target_field
    }

    pub fn predict_transformer(&self) -> Option<&Arc<dyn Transformer>> {
        self.predict_transformer.as_ref()
    }

    pub fn source_digest(&self) -> Option<&str> {
        self.source_digest.as_deref()
    }

    /// Name and estimator of the final step.
    pub fn final_step(&self) -> (&str, &Arc<dyn Estimator>) {
        match self.steps.last() {
            Some(NamedStep {
                name,
                step: Step::Estimator(estimator),
            }) => (name, estimator),
            // Pipeline::new rejects any other shape.
            _ => unreachable!("pipeline without final estimator"),
        }
    }

    pub fn final_estimator(&self) -> &Arc<dyn Estimator> {
        self.final_step().1
    }

    /// Transformer steps in order.
    pub fn transformers(&self) -> impl Iterator<Item = (&str, &Arc<dyn Transformer>)> {
        self.steps.iter().filter_map(|s| match &s.step {
            Step::Transformer(t) => Some((s.name.as_str(), t)),
            Step::Estimator(_) => None,
        })
    }

    /// `(step name, relative path)` of the final estimator's artifact, if it
    /// still needs to be materialized.
    pub fn unresolved_artifact(&self) -> Option<(&str, &str)> {
        let (name, estimator) = self.final_step();
        match estimator.artifact() {
            Some(ArtifactRef::Unresolved { path }) => Some((name, path)),
            _ => None,
        }
    }

    /// A new pipeline whose final estimator is bound to `local`.
    pub fn resolve_artifact(&self, local: &Path) -> Result<Pipeline, ArtifactError> {
        let (name, estimator) = self.final_step();
        let resolved = estimator.resolve_artifact(name, local)?;
        tracing::debug!(step = name, local = %local.display(), "Resolved step artifact");
        let mut steps = self.steps.clone();
        if let Some(last) = steps.last_mut() {
            last.step = Step::Estimator(resolved);
        }
        Ok(Pipeline {
            steps,
            ..self.clone()
        })
    }

    /// Native inference: run every step on one record.
    pub fn predict(
        &self,
        record: &InputRecord,
    ) -> Result<BTreeMap<ResultName, Datum>, EvaluationError> {
        let mut row = self
            .active_fields
            .iter()
            .map(|field| {
                record
                    .get(field)
                    .map(|raw| Datum::from_raw(raw))
                    .ok_or_else(|| EvaluationError::MissingField(field.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        for (_, transformer) in self.transformers() {
            row = transformer.transform(&row)?;
        }
        let prediction = self.final_estimator().predict(&row)?;

        let mut results = BTreeMap::new();
        for (class, p) in prediction.probabilities {
            results.insert(ResultName::Probability(class), p);
        }
        if let Some(transformer) = &self.predict_transformer {
            let transformed = transformer.transform(std::slice::from_ref(&prediction.value))?;
            for (i, value) in transformed.into_iter().enumerate() {
                results.insert(ResultName::Transformed(i), value);
            }
        }
        results.insert(ResultName::Prediction, prediction.value);
        Ok(results)
    }
}

/// Fail unless the row has `expected` columns.
pub(crate) fn check_width(row: &[Datum], expected: usize) -> Result<(), EvaluationError> {
    if row.len() == expected {
        Ok(())
    } else {
        Err(EvaluationError::ShapeMismatch {
            expected,
            actual: row.len(),
        })
    }
}

/// Numeric view of each input; `None` entries are missing values.
pub(crate) fn numbers(row: &[Datum], step: &str) -> Result<Vec<Option<f64>>, EvaluationError> {
    row.iter().map(|d| d.to_number(step)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::linear::LinearRegression;
    use crate::pipeline::scalers::StandardScaler;

    fn scaler() -> NamedStep {
        NamedStep {
            name: "scaler".into(),
            step: Step::Transformer(Arc::new(
                StandardScaler::new(Some(vec![1.0]), Some(vec![2.0])).unwrap(),
            )),
        }
    }

    fn regressor() -> NamedStep {
        NamedStep {
            name: "regressor".into(),
            step: Step::Estimator(Arc::new(LinearRegression::new(vec![3.0], 0.5))),
        }
    }

    #[test]
    fn test_empty_pipeline_rejected() {
        let err = Pipeline::new(Vec::new(), vec!["x".into()], "y".into(), None).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPipeline(_)));
    }

    #[test]
    fn test_final_step_must_be_estimator() {
        let err = Pipeline::new(vec![regressor(), scaler()], vec!["x".into()], "y".into(), None)
            .unwrap_err();
        assert!(err.to_string().contains("not an estimator"));
    }

    #[test]
    fn test_only_final_step_may_be_estimator() {
        let mut second = regressor();
        second.name = "second".into();
        let err = Pipeline::new(vec![regressor(), second], vec!["x".into()], "y".into(), None)
            .unwrap_err();
        assert!(err.to_string().contains("not the final step"));
    }

    #[test]
    fn test_duplicate_step_names_rejected() {
        let mut dup = regressor();
        dup.name = "scaler".into();
        assert!(Pipeline::new(vec![scaler(), dup], vec!["x".into()], "y".into(), None).is_err());
    }

    #[test]
    fn test_native_predict() {
        let pipeline =
            Pipeline::new(vec![scaler(), regressor()], vec!["x".into()], "y".into(), None)
                .unwrap();
        let record: InputRecord = [("x".to_string(), "5".to_string())].into();
        let out = pipeline.predict(&record).unwrap();
        // (5 - 1) / 2 * 3 + 0.5
        assert_eq!(out[&ResultName::Prediction], Datum::Number(6.5));
        assert_eq!(pipeline.unresolved_artifact(), None);
    }

    #[test]
    fn test_resolving_plain_estimator_fails() {
        let pipeline = Pipeline::new(vec![regressor()], vec!["x".into()], "y".into(), None).unwrap();
        assert!(matches!(
            pipeline.resolve_artifact(Path::new("/tmp/nothing")),
            Err(ArtifactError::NoArtifact(_))
        ));
    }
}
