//! Type registry: maps object-graph type names to constructors.
//!
//! Decoding is two-phase. [`crate::graph::decode_graph`] turns bytes into a
//! generic value tree; the registry then constructs pipeline objects from it,
//! dispatching on each object's declared type name. The registry is open:
//! callers may register factories for additional types, or replace built-in
//! ones, before decoding.

use crate::error::DecodeError;
use crate::graph::{GraphObject, GraphValue, ObjectState, decode_graph};
use crate::pipeline::bspline::{BSPLINE, BSPLINE_TRANSFORMER, BSpline, BSplineTransformer};
use crate::pipeline::expression::{EXPRESSION_TRANSFORMER, ExpressionTransformer};
use crate::pipeline::h2o::{H2O_ESTIMATOR, H2OEstimator};
use crate::pipeline::linear::{
    LINEAR_REGRESSION, LOGISTIC_REGRESSION, LinearRegression, LogisticRegression,
};
use crate::pipeline::onehot::{ONE_HOT_ENCODER, OneHotEncoder};
use crate::pipeline::scalers::{MIN_MAX_SCALER, MinMaxScaler, STANDARD_SCALER, StandardScaler};
use crate::pipeline::{Estimator, PMML_PIPELINE, Pipeline, SKLEARN_PIPELINE, Step, Transformer};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

/// Builds a domain object from an object's state. Nested objects are
/// constructed through the registry passed in.
pub type Factory = fn(&ObjectState, &TypeRegistry) -> Result<Constructed, DecodeError>;

/// A constructed domain object.
#[derive(Debug, Clone)]
pub enum Constructed {
    Pipeline(Pipeline),
    Transformer(Arc<dyn Transformer>),
    Estimator(Arc<dyn Estimator>),
    Spline(BSpline),
}

impl Constructed {
    pub fn kind(&self) -> &'static str {
        match self {
            Constructed::Pipeline(_) => "pipeline",
            Constructed::Transformer(_) => "transformer",
            Constructed::Estimator(_) => "estimator",
            Constructed::Spline(_) => "spline",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    factories: HashMap<String, Factory>,
}

static GLOBAL: LazyLock<TypeRegistry> = LazyLock::new(TypeRegistry::with_defaults);

/// Decode a pipeline using the built-in types.
pub fn decode(bytes: &[u8]) -> Result<Pipeline, DecodeError> {
    TypeRegistry::global().decode(bytes)
}

impl TypeRegistry {
    /// The process-wide registry with the built-in types.
    pub fn global() -> &'static TypeRegistry {
        &GLOBAL
    }

    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in type registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PMML_PIPELINE, Pipeline::from_state);
        registry.register(SKLEARN_PIPELINE, Pipeline::from_state);
        registry.register(STANDARD_SCALER, StandardScaler::from_state);
        registry.register(MIN_MAX_SCALER, MinMaxScaler::from_state);
        registry.register(ONE_HOT_ENCODER, OneHotEncoder::from_state);
        registry.register(EXPRESSION_TRANSFORMER, ExpressionTransformer::from_state);
        registry.register(BSPLINE_TRANSFORMER, BSplineTransformer::from_state);
        registry.register(BSPLINE, BSpline::from_state);
        registry.register(LINEAR_REGRESSION, LinearRegression::from_state);
        registry.register(LOGISTIC_REGRESSION, LogisticRegression::from_state);
        registry.register(H2O_ESTIMATOR, H2OEstimator::from_state);
        registry
    }

    /// Register a factory, returning the one it replaces.
    pub fn register(&mut self, type_name: impl Into<String>, factory: Factory) -> Option<Factory> {
        self.factories.insert(type_name.into(), factory)
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn construct_object(&self, object: &GraphObject) -> Result<Constructed, DecodeError> {
        let factory = self
            .factories
            .get(&object.type_name)
            .ok_or_else(|| DecodeError::UnknownType {
                type_name: object.type_name.clone(),
            })?;
        factory(&object.state, self)
    }

    /// Construct the object held by `value`.
    pub fn construct(&self, value: &GraphValue) -> Result<Constructed, DecodeError> {
        let object = value.as_object().ok_or_else(|| DecodeError::UnexpectedKind {
            expected: "object".into(),
            found: value.kind().into(),
        })?;
        self.construct_object(object)
    }

    pub fn transformer(&self, value: &GraphValue) -> Result<Arc<dyn Transformer>, DecodeError> {
        match self.construct(value)? {
            Constructed::Transformer(t) => Ok(t),
            other => Err(unexpected("transformer", &other)),
        }
    }

    pub fn estimator(&self, value: &GraphValue) -> Result<Arc<dyn Estimator>, DecodeError> {
        match self.construct(value)? {
            Constructed::Estimator(e) => Ok(e),
            other => Err(unexpected("estimator", &other)),
        }
    }

    pub fn spline(&self, value: &GraphValue) -> Result<BSpline, DecodeError> {
        match self.construct(value)? {
            Constructed::Spline(s) => Ok(s),
            other => Err(unexpected("spline", &other)),
        }
    }

    /// A pipeline step: either a transformer or an estimator.
    pub fn step(&self, value: &GraphValue) -> Result<Step, DecodeError> {
        match self.construct(value)? {
            Constructed::Transformer(t) => Ok(Step::Transformer(t)),
            Constructed::Estimator(e) => Ok(Step::Estimator(e)),
            other => Err(unexpected("transformer or estimator", &other)),
        }
    }

    /// Decode a complete pipeline from an object-graph stream.
    ///
    /// Decoding is deterministic: the same bytes always yield the same
    /// pipeline or the same error.
    pub fn decode(&self, bytes: &[u8]) -> Result<Pipeline, DecodeError> {
        let root = decode_graph(bytes)?;
        let pipeline = match self.construct(&root)? {
            Constructed::Pipeline(p) => p,
            other => return Err(unexpected("pipeline", &other)),
        };
        let digest = format!("{:x}", Sha256::digest(bytes));
        tracing::debug!(
            steps = pipeline.steps().len(),
            digest = %digest,
            "Decoded pipeline"
        );
        Ok(pipeline.with_source_digest(digest))
    }
}

fn unexpected(expected: &str, found: &Constructed) -> DecodeError {
    DecodeError::UnexpectedKind {
        expected: expected.into(),
        found: found.kind().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ObjectGraphEncoder;
    use crate::types::{Datum, InputRecord};

    fn pipeline_graph(steps: Vec<(&str, GraphValue)>, extra: Vec<(&str, GraphValue)>) -> GraphValue {
        let steps = GraphValue::List(
            steps
                .into_iter()
                .map(|(name, step)| GraphValue::List(vec![GraphValue::str(name), step]))
                .collect(),
        );
        let mut state = vec![("steps", steps)];
        state.extend(extra);
        GraphValue::object(PMML_PIPELINE, state)
    }

    fn linear(coef: &[f64], intercept: f64) -> GraphValue {
        GraphValue::object(
            LINEAR_REGRESSION,
            [
                ("coef_", GraphValue::floats(coef)),
                ("intercept_", GraphValue::Float(intercept)),
            ],
        )
    }

    fn encode(root: GraphValue) -> Vec<u8> {
        ObjectGraphEncoder::new().encode(&root)
    }

    #[test]
    fn test_decode_pipeline() {
        let scaler = GraphValue::object(
            STANDARD_SCALER,
            [
                ("mean_", GraphValue::floats(&[1.0])),
                ("scale_", GraphValue::floats(&[2.0])),
            ],
        );
        let bytes = encode(pipeline_graph(
            vec![("scaler", scaler), ("lr", linear(&[4.0], 1.0))],
            vec![("active_fields", GraphValue::strs(&["x"]))],
        ));
        let pipeline = decode(&bytes).unwrap();
        assert_eq!(pipeline.steps().len(), 2);
        assert_eq!(pipeline.target_field(), "y");
        assert_eq!(pipeline.source_digest().map(str::len), Some(64));

        let record: InputRecord = [("x".to_string(), "3".to_string())].into();
        let out = pipeline.predict(&record).unwrap();
        assert_eq!(out.values().next(), Some(&Datum::Number(5.0)));
    }

    #[test]
    fn test_default_active_fields_from_feature_count() {
        let bytes = encode(pipeline_graph(
            vec![("lr", linear(&[1.0, 1.0], 0.0))],
            vec![("n_features_in_", GraphValue::Int(2))],
        ));
        let pipeline = decode(&bytes).unwrap();
        assert_eq!(pipeline.active_fields(), ["x1", "x2"]);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let bytes = encode(pipeline_graph(
            vec![("mystery", GraphValue::object("acme.Mystery", Vec::<(&str, GraphValue)>::new()))],
            vec![("active_fields", GraphValue::strs(&["x"]))],
        ));
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::UnknownType {
                type_name: "acme.Mystery".into()
            }
        );
    }

    #[test]
    fn test_root_must_be_pipeline() {
        let bytes = encode(linear(&[1.0], 0.0));
        assert!(matches!(
            decode(&bytes),
            Err(DecodeError::UnexpectedKind { .. })
        ));
    }

    #[test]
    fn test_registered_factory_replaces_builtin() {
        fn zero_regression(
            _state: &ObjectState,
            _registry: &TypeRegistry,
        ) -> Result<Constructed, DecodeError> {
            Ok(Constructed::Estimator(Arc::new(LinearRegression::new(vec![0.0], 0.0))))
        }
        let mut registry = TypeRegistry::with_defaults();
        assert!(registry.register(LINEAR_REGRESSION, zero_regression).is_some());
        let bytes = encode(pipeline_graph(
            vec![("lr", linear(&[5.0], 5.0))],
            vec![("active_fields", GraphValue::strs(&["x"]))],
        ));
        let pipeline = registry.decode(&bytes).unwrap();
        let record: InputRecord = [("x".to_string(), "1".to_string())].into();
        let out = pipeline.predict(&record).unwrap();
        assert_eq!(out.values().next(), Some(&Datum::Number(0.0)));
    }

    #[test]
    fn test_empty_registry_knows_nothing() {
        let registry = TypeRegistry::new();
        assert!(registry.type_names().is_empty());
        assert!(TypeRegistry::global().contains(PMML_PIPELINE));
        assert!(TypeRegistry::global().contains(H2O_ESTIMATOR));
    }

    #[test]
    fn test_decode_is_deterministic() {
        let bytes = encode(pipeline_graph(
            vec![("lr", linear(&[1.0], 0.0))],
            vec![("active_fields", GraphValue::strs(&["x"]))],
        ));
        let first = format!("{:?}", decode(&bytes).unwrap());
        let second = format!("{:?}", decode(&bytes).unwrap());
        assert_eq!(first, second);
    }
}
