//! # pipecheck-core
//!
//! Verifies that a pickled model pipeline and the scoring document compiled
//! from it make the same predictions.
//!
//! A case runs in four stages:
//!
//! 1. **Decode**: read a (possibly compressed) object-graph stream and rebuild the
//!    pipeline through the open [`TypeRegistry`].
//! 2. **Stage**: copy any out-of-band artifact a step refers to into a temporary
//!    file and resolve the step against it.
//! 3. **Compile**: encode the pipeline into a declarative [`Document`].
//! 4. **Compare**: score every input record natively and through the
//!    [`DocumentEvaluator`], field by field, within a [`Tolerance`].
//!
//! [`IntegrationHarness`] drives all four for a (model, dataset) pair.

pub mod comparator;
pub mod compiler;
pub mod config;
pub mod document;
pub mod error;
pub mod evaluator;
pub mod fixtures;
pub mod graph;
pub mod harness;
pub mod pipeline;
pub mod registry;
pub mod storage;
pub mod types;

pub use comparator::{
    ComparisonResult, Exclusion, FieldComparison, RecordComparison, Tolerance, compare,
    exclude_fields, exclude_none,
};
pub use compiler::{FieldMap, compile};
pub use config::{CaseConfig, HarnessConfig, load_config};
pub use document::Document;
pub use error::{ArtifactError, CompileError, DecodeError, EvaluationError, HarnessError};
pub use evaluator::{DocumentEvaluator, EvaluatorBuilder};
pub use fixtures::{ArtifactStaging, DirectoryFixtures, FixtureResolver, StagedArtifact};
pub use graph::{GraphValue, ObjectGraphEncoder, decode_graph};
pub use harness::{HarnessSettings, IntegrationHarness, PreparedCase, Verdict};
pub use pipeline::{Estimator, Pipeline, ResultName, Transformer};
pub use registry::TypeRegistry;
pub use types::{Datum, InputRecord};
