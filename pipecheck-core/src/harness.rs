//! End-to-end verification of one (model, dataset) case.
//!
//! ```text
//! FixtureResolver ──► decode ──► stage artifact ──► compile ──► compare ──► Verdict
//!        └──────────── input records ─────────────────────────────┘
//! ```
//!
//! A staged artifact is owned by the [`PreparedCase`] and lives until the case
//! is dropped, so it is removed on every exit path.

use crate::comparator::{
    ComparisonResult, Comparator, Exclusion, RecordComparison, Tolerance, compare, exclude_fields,
};
use crate::compiler::{FieldMap, compile};
use crate::config::{CaseConfig, HarnessConfig};
use crate::document::Document;
use crate::error::{CompileError, HarnessError};
use crate::evaluator::{DocumentEvaluator, EvaluatorBuilder};
use crate::fixtures::{
    ArtifactStaging, FixtureResolver, StagedArtifact, model_fixture_path, records_fixture_path,
};
use crate::pipeline::Pipeline;
use crate::registry::TypeRegistry;
use crate::storage::Storage;
use crate::types::{Datum, InputRecord};
use serde::Serialize;
use std::fmt;
use std::path::Path;

/// Per-harness knobs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarnessSettings {
    pub tolerance: Tolerance,
    pub guarded: bool,
    pub max_reported_mismatches: usize,
}

impl Default for HarnessSettings {
    fn default() -> Self {
        Self::from(&HarnessConfig::default())
    }
}

impl From<&HarnessConfig> for HarnessSettings {
    fn from(config: &HarnessConfig) -> Self {
        Self {
            tolerance: config.tolerance,
            guarded: config.guarded,
            max_reported_mismatches: config.max_reported_mismatches,
        }
    }
}

pub struct IntegrationHarness<R> {
    resolver: R,
    registry: TypeRegistry,
    staging: ArtifactStaging,
    settings: HarnessSettings,
}

impl<R: FixtureResolver> IntegrationHarness<R> {
    pub fn new(resolver: R) -> Self {
        Self {
            resolver,
            registry: TypeRegistry::global().clone(),
            staging: ArtifactStaging::new(),
            settings: HarnessSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: HarnessSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_staging(mut self, staging: ArtifactStaging) -> Self {
        self.staging = staging;
        self
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Open, decompress and decode a pickled pipeline fixture.
    pub fn decode_fixture(&self, path: &str) -> Result<Pipeline, HarnessError> {
        let raw = self.resolver.open(path)?;
        let bytes = Storage::open(raw)?.into_bytes()?;
        let pipeline = self.registry.decode(&bytes)?;
        tracing::debug!(path, steps = pipeline.steps().len(), "Decoded fixture");
        Ok(pipeline)
    }

    /// Decode, stage any artifact, compile and build the evaluator.
    pub fn prepare(&self, model: &str, dataset: &str) -> Result<PreparedCase, HarnessError> {
        self.prepare_with(model, dataset, self.settings.guarded)
    }

    pub fn prepare_with(
        &self,
        model: &str,
        dataset: &str,
        guarded: bool,
    ) -> Result<PreparedCase, HarnessError> {
        let pipeline = self.decode_fixture(&model_fixture_path(model, dataset))?;

        let (pipeline, staged) = match pipeline.unresolved_artifact() {
            Some((step, path)) => {
                let staged = {
                    let mut reader = self.resolver.open(path)?;
                    self.staging
                        .materialize(&mut reader, &staging_prefix(model, dataset))?
                };
                tracing::info!(
                    step,
                    artifact = path,
                    local = %staged.path().display(),
                    "Staged step artifact"
                );
                (pipeline.resolve_artifact(staged.path())?, Some(staged))
            }
            None => (pipeline, None),
        };

        let (document, field_map) = compile(&pipeline)?;
        let evaluator = EvaluatorBuilder::new(document)
            .guarded(guarded)
            .build()
            .map_err(|e| CompileError::InvalidDocument(e.to_string()))?;

        Ok(PreparedCase {
            model: model.to_string(),
            dataset: dataset.to_string(),
            pipeline,
            evaluator,
            field_map,
            tolerance: self.settings.tolerance,
            max_reported_mismatches: self.settings.max_reported_mismatches,
            staged,
        })
    }

    /// Run a full case, excluding fields matched by `exclude`.
    pub fn evaluate(
        &self,
        model: &str,
        dataset: &str,
        exclude: &Exclusion,
    ) -> Result<Verdict, HarnessError> {
        self.evaluate_with(model, dataset, exclude, self.settings.guarded)
    }

    fn evaluate_with(
        &self,
        model: &str,
        dataset: &str,
        exclude: &Exclusion,
        guarded: bool,
    ) -> Result<Verdict, HarnessError> {
        let span = tracing::info_span!("case", model, dataset);
        let _enter = span.enter();

        let records = self.resolver.load_records(&records_fixture_path(dataset))?;
        let case = self.prepare_with(model, dataset, guarded)?;
        let verdict = case.run(&records, exclude)?;
        tracing::info!(
            records = verdict.records,
            mismatches = verdict.total_mismatches,
            passed = verdict.passed,
            "Case finished"
        );
        Ok(verdict)
    }

    /// Run a configured case.
    pub fn run_case(&self, case: &CaseConfig) -> Result<Verdict, HarnessError> {
        let exclude = exclude_fields(case.exclude.iter().cloned());
        self.evaluate_with(
            &case.model,
            &case.dataset,
            &exclude,
            case.guarded.unwrap_or(self.settings.guarded),
        )
    }
}

/// Temp-file prefix tying a staged artifact to its case.
fn staging_prefix(model: &str, dataset: &str) -> String {
    format!("{model}{dataset}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// A compiled case ready for comparison. Owns the staged artifact, if any.
pub struct PreparedCase {
    model: String,
    dataset: String,
    pipeline: Pipeline,
    evaluator: DocumentEvaluator,
    field_map: FieldMap,
    tolerance: Tolerance,
    max_reported_mismatches: usize,
    staged: Option<StagedArtifact>,
}

impl PreparedCase {
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn document(&self) -> &Document {
        self.evaluator.document()
    }

    pub fn field_map(&self) -> &FieldMap {
        &self.field_map
    }

    /// Local path of the staged artifact while the case is alive.
    pub fn artifact_path(&self) -> Option<&Path> {
        self.staged.as_ref().map(StagedArtifact::path)
    }

    /// Lazily compare records one at a time.
    pub fn comparisons<'a>(
        &'a self,
        records: &'a [InputRecord],
        exclude: &'a Exclusion,
    ) -> Comparator<'a, std::slice::Iter<'a, InputRecord>> {
        compare(
            &self.pipeline,
            &self.evaluator,
            &self.field_map,
            records,
            &self.tolerance,
            exclude.as_ref(),
        )
    }

    /// Compare every record and summarize. Consumes the case, releasing its artifact.
    pub fn run(self, records: &[InputRecord], exclude: &Exclusion) -> Result<Verdict, HarnessError> {
        let mut verdict = Verdict::new(&self.model, &self.dataset, self.max_reported_mismatches);
        for comparison in self.comparisons(records, exclude) {
            verdict.add(&comparison?);
        }
        Ok(verdict)
    }
}

/// One reported disagreement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MismatchReport {
    pub record: usize,
    pub field: String,
    pub expected: Datum,
    pub actual: Datum,
    pub delta: Option<f64>,
}

/// Outcome of a case.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub model: String,
    pub dataset: String,
    pub passed: bool,
    pub records: usize,
    pub total_mismatches: usize,
    /// The first mismatches, up to the configured limit.
    pub mismatches: Vec<MismatchReport>,
    #[serde(skip)]
    limit: usize,
}

impl Verdict {
    fn new(model: &str, dataset: &str, limit: usize) -> Self {
        Self {
            model: model.to_string(),
            dataset: dataset.to_string(),
            passed: true,
            records: 0,
            total_mismatches: 0,
            mismatches: Vec::new(),
            limit,
        }
    }

    fn add(&mut self, comparison: &RecordComparison) {
        self.records += 1;
        for field in &comparison.fields {
            if let ComparisonResult::Mismatch {
                expected,
                actual,
                delta,
            } = &field.result
            {
                self.total_mismatches += 1;
                self.passed = false;
                if self.mismatches.len() < self.limit {
                    self.mismatches.push(MismatchReport {
                        record: comparison.record,
                        field: field.field.clone(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                        delta: *delta,
                    });
                }
            }
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.passed { "PASS" } else { "FAIL" };
        write!(
            f,
            "{status} {}:{} ({} records",
            self.model, self.dataset, self.records
        )?;
        if self.total_mismatches > 0 {
            write!(f, ", {} mismatches", self.total_mismatches)?;
        }
        write!(f, ")")?;
        for m in &self.mismatches {
            write!(
                f,
                "\n  record {} field {}: native {} document {}",
                m.record, m.field, m.expected, m.actual
            )?;
            if let Some(delta) = m.delta {
                write!(f, " (delta {delta:e})")?;
            }
        }
        if self.total_mismatches > self.mismatches.len() {
            write!(
                f,
                "\n  ... {} more",
                self.total_mismatches - self.mismatches.len()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::FieldComparison;

    fn mismatch(field: &str) -> FieldComparison {
        FieldComparison {
            field: field.into(),
            result: ComparisonResult::Mismatch {
                expected: Datum::Number(1.0),
                actual: Datum::Number(2.0),
                delta: Some(1.0),
            },
        }
    }

    #[test]
    fn test_verdict_caps_reported_mismatches() {
        let mut verdict = Verdict::new("M", "D", 2);
        for record in 0..3 {
            verdict.add(&RecordComparison {
                record,
                fields: vec![mismatch("predict(y)")],
            });
        }
        assert!(!verdict.passed);
        assert_eq!(verdict.records, 3);
        assert_eq!(verdict.total_mismatches, 3);
        assert_eq!(verdict.mismatches.len(), 2);
        let text = verdict.to_string();
        assert!(text.starts_with("FAIL M:D (3 records, 3 mismatches)"));
        assert!(text.ends_with("... 1 more"));
    }

    #[test]
    fn test_verdict_passes_without_mismatches() {
        let mut verdict = Verdict::new("M", "D", 10);
        verdict.add(&RecordComparison {
            record: 0,
            fields: vec![FieldComparison {
                field: "predict(y)".into(),
                result: ComparisonResult::Excluded,
            }],
        });
        assert!(verdict.passed);
        assert_eq!(verdict.to_string(), "PASS M:D (1 records)");
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["passed"], true);
        assert!(json.get("limit").is_none());
    }

    #[test]
    fn test_staging_prefix() {
        assert_eq!(staging_prefix("GLM", "AuditCat"), "GLMAuditCat");
        assert_eq!(staging_prefix("../GLM", "Audit Cat"), "___GLMAudit_Cat");
    }
}
