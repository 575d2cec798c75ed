//! Pipeline → document compilation.
//!
//! Compilation is a pure function of the pipeline: it walks the steps in
//! order, threading a list of [`Feature`]s through each step's `encode`, and
//! emits one derived field per intermediate value. The [`FieldMap`] returned
//! alongside the document links pipeline result names to document output
//! fields so the two evaluation paths can be compared name by name.

use crate::document::{
    ArtifactLocation, DataField, DerivedField, Document, Expression, FieldUsage, Header,
    OutputField, ResultFeature,
};
use crate::error::CompileError;
use crate::pipeline::{Pipeline, ResultName};
use crate::types::OpType;
use serde::Serialize;
use std::collections::BTreeMap;

/// Value recorded in [`Header::application`].
pub const APPLICATION: &str = "pipecheck";

/// Step label used when encoding the predict transformer.
pub const PREDICT_TRANSFORMER: &str = "predict_transformer";

/// A named value flowing between steps during compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    pub op_type: OpType,
}

impl Feature {
    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: OpType::Continuous,
        }
    }

    /// A reference to this feature for use in expressions.
    pub fn expression(&self) -> Expression {
        Expression::field(&self.name)
    }

    /// Fail unless the feature is continuous.
    pub fn require_continuous(&self, step: &str) -> Result<(), CompileError> {
        match self.op_type {
            OpType::Continuous => Ok(()),
            OpType::Categorical => Err(CompileError::FeatureMismatch {
                step: step.to_string(),
                message: format!("feature '{}' is categorical", self.name),
            }),
        }
    }
}

/// Check that a step received as many features as it was fitted on.
pub fn expect_features(step: &str, features: &[Feature], expected: usize) -> Result<(), CompileError> {
    if features.len() == expected {
        Ok(())
    } else {
        Err(CompileError::FeatureMismatch {
            step: step.to_string(),
            message: format!("expected {expected} features, got {}", features.len()),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Derived,
    Output,
}

/// Accumulates document parts while steps encode themselves.
#[derive(Debug)]
pub struct DocumentEncoder {
    data_fields: Vec<DataField>,
    derived_fields: Vec<DerivedField>,
    outputs: Vec<OutputField>,
    artifacts: Vec<ArtifactLocation>,
    target: String,
    section: Section,
}

impl DocumentEncoder {
    fn new(active_fields: &[String], target: &str) -> Self {
        let data_fields = active_fields
            .iter()
            .map(|name| DataField {
                name: name.clone(),
                op_type: OpType::Continuous,
                usage: FieldUsage::Active,
                values: Vec::new(),
            })
            .collect();
        Self {
            data_fields,
            derived_fields: Vec::new(),
            outputs: Vec::new(),
            artifacts: Vec::new(),
            target: target.to_string(),
            section: Section::Derived,
        }
    }

    /// Name of the document's target field.
    pub fn target_field(&self) -> &str {
        &self.target
    }

    /// Define a new field. Before the model this is a derived field; while
    /// encoding the predict transformer it is an intermediate output field.
    pub fn derive(
        &mut self,
        name: impl Into<String>,
        op_type: OpType,
        expression: Expression,
    ) -> Feature {
        let name = name.into();
        match self.section {
            Section::Derived => self.derived_fields.push(DerivedField {
                name: name.clone(),
                op_type,
                expression,
            }),
            Section::Output => self.outputs.push(OutputField {
                name: name.clone(),
                op_type,
                feature: ResultFeature::Transformed { expression },
                final_result: false,
            }),
        }
        Feature { name, op_type }
    }

    /// Redeclare an input data field as categorical over `values`.
    pub fn to_categorical(
        &mut self,
        step: &str,
        feature: &Feature,
        values: &[String],
    ) -> Result<Feature, CompileError> {
        let field = self
            .data_fields
            .iter_mut()
            .find(|f| f.name == feature.name && f.usage == FieldUsage::Active)
            .ok_or_else(|| CompileError::FeatureMismatch {
                step: step.to_string(),
                message: format!(
                    "categorical encoding needs a raw input field, '{}' is derived",
                    feature.name
                ),
            })?;
        if field.op_type == OpType::Categorical && field.values != values {
            return Err(CompileError::FeatureMismatch {
                step: step.to_string(),
                message: format!("field '{}' already has a different category set", field.name),
            });
        }
        field.op_type = OpType::Categorical;
        field.values = values.to_vec();
        Ok(Feature {
            name: feature.name.clone(),
            op_type: OpType::Categorical,
        })
    }

    /// Record an out-of-band artifact in the document header.
    pub fn add_artifact(&mut self, location: ArtifactLocation) {
        self.artifacts.push(location);
    }

    fn output(&mut self, name: String, op_type: OpType, feature: ResultFeature) {
        self.outputs.push(OutputField {
            name,
            op_type,
            feature,
            final_result: true,
        });
    }

    /// Make `feature` a reported output and return the output's name.
    fn promote(&mut self, feature: &Feature, index: usize) -> String {
        if let Some(output) = self.outputs.iter_mut().find(|o| o.name == feature.name) {
            output.final_result = true;
            return output.name.clone();
        }
        let name = format!("{PREDICT_TRANSFORMER}[{index}]");
        self.output(
            name.clone(),
            feature.op_type,
            ResultFeature::Transformed {
                expression: feature.expression(),
            },
        );
        name
    }
}

/// Bidirectional mapping between pipeline result names and document output
/// fields, plus the active input field names.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FieldMap {
    results: Vec<(ResultName, String)>,
    #[serde(skip)]
    by_result: BTreeMap<ResultName, String>,
    #[serde(skip)]
    by_field: BTreeMap<String, ResultName>,
    inputs: Vec<String>,
}

impl FieldMap {
    fn insert(&mut self, result: ResultName, field: String) {
        self.by_result.insert(result.clone(), field.clone());
        self.by_field.insert(field.clone(), result.clone());
        self.results.push((result, field));
    }

    pub fn output_field(&self, result: &ResultName) -> Option<&str> {
        self.by_result.get(result).map(String::as_str)
    }

    pub fn result_name(&self, field: &str) -> Option<&ResultName> {
        self.by_field.get(field)
    }

    /// `(result, output field)` pairs in document order.
    pub fn iter(&self) -> impl Iterator<Item = (&ResultName, &str)> {
        self.results.iter().map(|(r, f)| (r, f.as_str()))
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Compile a pipeline into a validated document.
pub fn compile(pipeline: &Pipeline) -> Result<(Document, FieldMap), CompileError> {
    let target = pipeline.target_field();
    let mut encoder = DocumentEncoder::new(pipeline.active_fields(), target);
    let mut field_map = FieldMap {
        inputs: pipeline.active_fields().to_vec(),
        ..FieldMap::default()
    };

    let mut features: Vec<Feature> = pipeline
        .active_fields()
        .iter()
        .map(Feature::continuous)
        .collect();
    for (name, transformer) in pipeline.transformers() {
        features = transformer.encode(name, &mut encoder, features)?;
        tracing::trace!(step = name, features = features.len(), "Encoded transformer");
    }

    let (name, estimator) = pipeline.final_step();
    let model = estimator.encode(name, &mut encoder, features)?;

    let classes = estimator.classes().map(<[String]>::to_vec);
    let predict_type = if classes.is_some() {
        OpType::Categorical
    } else {
        OpType::Continuous
    };
    encoder.data_fields.push(DataField {
        name: target.to_string(),
        op_type: predict_type,
        usage: FieldUsage::Target,
        values: classes.clone().unwrap_or_default(),
    });

    let predict_name = format!("predict({target})");
    encoder.output(predict_name.clone(), predict_type, ResultFeature::PredictedValue);
    field_map.insert(ResultName::Prediction, predict_name.clone());
    for class in classes.unwrap_or_default() {
        let output = format!("probability({class})");
        encoder.output(
            output.clone(),
            OpType::Continuous,
            ResultFeature::Probability {
                value: class.clone(),
            },
        );
        field_map.insert(ResultName::Probability(class), output);
    }

    if let Some(transformer) = pipeline.predict_transformer() {
        encoder.section = Section::Output;
        let input = Feature {
            name: predict_name,
            op_type: predict_type,
        };
        let transformed = transformer.encode(PREDICT_TRANSFORMER, &mut encoder, vec![input])?;
        for (i, feature) in transformed.iter().enumerate() {
            let output = encoder.promote(feature, i);
            field_map.insert(ResultName::Transformed(i), output);
        }
    }

    let document = Document {
        header: Header {
            application: APPLICATION.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            source_digest: pipeline.source_digest().map(str::to_string),
            artifacts: encoder.artifacts,
        },
        data_dictionary: encoder.data_fields,
        derived_fields: encoder.derived_fields,
        model,
        outputs: encoder.outputs,
    };
    document.validate().map_err(CompileError::InvalidDocument)?;

    tracing::debug!(
        derived = document.derived_fields.len(),
        outputs = field_map.len(),
        "Compiled pipeline"
    );
    Ok((document, field_map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::expression::ExpressionTransformer;
    use crate::pipeline::linear::{LinearRegression, LogisticRegression};
    use crate::pipeline::onehot::OneHotEncoder;
    use crate::pipeline::scalers::StandardScaler;
    use crate::pipeline::{NamedStep, Step};
    use std::sync::Arc;

    fn fields(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn transformer(name: &str, t: impl crate::pipeline::Transformer + 'static) -> NamedStep {
        NamedStep {
            name: name.into(),
            step: Step::Transformer(Arc::new(t)),
        }
    }

    fn estimator(name: &str, e: impl crate::pipeline::Estimator + 'static) -> NamedStep {
        NamedStep {
            name: name.into(),
            step: Step::Estimator(Arc::new(e)),
        }
    }

    #[test]
    fn test_compile_scaler_regression() {
        let pipeline = Pipeline::new(
            vec![
                transformer(
                    "scaler",
                    StandardScaler::new(Some(vec![1.0, 2.0]), Some(vec![3.0, 4.0])).unwrap(),
                ),
                estimator("lr", LinearRegression::new(vec![0.5, -0.5], 1.0)),
            ],
            fields(&["a", "b"]),
            "y".into(),
            None,
        )
        .unwrap();
        let (doc, map) = compile(&pipeline).unwrap();
        let names: Vec<_> = doc.derived_fields.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["scaler(a)", "scaler(b)"]);
        assert_eq!(map.output_field(&ResultName::Prediction), Some("predict(y)"));
        assert_eq!(map.result_name("predict(y)"), Some(&ResultName::Prediction));
        assert_eq!(doc.header.application, APPLICATION);
    }

    #[test]
    fn test_compile_classifier_outputs() {
        let pipeline = Pipeline::new(
            vec![estimator(
                "clf",
                LogisticRegression::new(
                    fields(&["no", "yes"]),
                    vec![vec![1.0]],
                    vec![0.0],
                )
                .unwrap(),
            )],
            fields(&["x"]),
            "label".into(),
            None,
        )
        .unwrap();
        let (doc, map) = compile(&pipeline).unwrap();
        let outputs: Vec<_> = map.iter().map(|(_, f)| f.to_string()).collect();
        assert_eq!(
            outputs,
            vec!["predict(label)", "probability(no)", "probability(yes)"]
        );
        let target = doc.data_field("label").unwrap();
        assert_eq!(target.op_type, OpType::Categorical);
    }

    #[test]
    fn test_predict_transformer_outputs() {
        let pipeline = Pipeline::new(
            vec![estimator("lr", LinearRegression::new(vec![2.0], 0.0))],
            fields(&["x"]),
            "y".into(),
            Some(Arc::new(ExpressionTransformer::parse("numpy.exp(X[0]) - 1").unwrap())),
        )
        .unwrap();
        let (doc, map) = compile(&pipeline).unwrap();
        let field = map.output_field(&ResultName::Transformed(0)).unwrap();
        assert_eq!(field, PREDICT_TRANSFORMER);
        let output = doc.outputs.iter().find(|o| o.name == field).unwrap();
        assert!(output.final_result);
    }

    #[test]
    fn test_categorical_into_linear_model_fails() {
        let pipeline = Pipeline::new(
            vec![
                transformer("scaler", StandardScaler::new(Some(vec![0.0]), None).unwrap()),
                transformer("ohe", OneHotEncoder::new(vec![fields(&["a", "b"])])),
                estimator("lr", LinearRegression::new(vec![1.0, 1.0], 0.0)),
            ],
            fields(&["x"]),
            "y".into(),
            None,
        )
        .unwrap();
        assert!(matches!(
            compile(&pipeline),
            Err(CompileError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn test_compile_is_deterministic() {
        let pipeline = Pipeline::new(
            vec![
                transformer("ohe", OneHotEncoder::new(vec![fields(&["red", "green"])])),
                estimator("lr", LinearRegression::new(vec![1.0, 2.0], 0.5)),
            ],
            fields(&["color"]),
            "y".into(),
            None,
        )
        .unwrap();
        let (first, _) = compile(&pipeline).unwrap();
        let (second, _) = compile(&pipeline).unwrap();
        assert_eq!(first, second);
    }
}
