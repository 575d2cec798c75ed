//! Estimators backed by an H2O MOJO archive.
//!
//! The object graph only records where the archive lives (`_mojo_path`,
//! relative to the fixture root). The archive itself has to be materialized
//! locally and bound with [`Estimator::resolve_artifact`] before the estimator
//! can predict or be compiled. A MOJO is a zip archive; this build reads the
//! GLM description stored in its `model.json` entry.

use super::linear::{check_features, complete_row, linear_predictor, regression_table, sigmoid};
use super::{ArtifactRef, Estimator, Prediction, check_width};
use crate::compiler::{DocumentEncoder, Feature};
use crate::document::{ArtifactLocation, MiningFunction, Model, Normalization, RegressionModel};
use crate::error::{ArtifactError, CompileError, DecodeError, EvaluationError};
use crate::graph::ObjectState;
use crate::registry::{Constructed, TypeRegistry};
use crate::types::Datum;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, Write};
use std::path::Path;
use std::sync::Arc;

pub const H2O_ESTIMATOR: &str = "h2o.estimators.H2OEstimator";

/// Archive entry holding the model description.
pub const MODEL_ENTRY: &str = "model.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Identity,
    Logit,
}

/// The GLM parameters carried in a MOJO.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MojoModel {
    pub algorithm: String,
    pub link: Link,
    pub names: Vec<String>,
    pub coefficients: Vec<f64>,
    pub intercept: f64,
}

impl MojoModel {
    /// Read the model description from the archive at `path`.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let file = std::fs::File::open(path).map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let archive_error = |source| ArtifactError::Archive {
            path: path.to_path_buf(),
            source,
        };
        let mut archive = zip::ZipArchive::new(file).map_err(archive_error)?;
        let mut entry = archive.by_name(MODEL_ENTRY).map_err(archive_error)?;
        let mut json = String::new();
        entry
            .read_to_string(&mut json)
            .map_err(|source| ArtifactError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let format_error = |message: String| ArtifactError::Format {
            path: path.to_path_buf(),
            message,
        };
        let model: MojoModel = serde_json::from_str(&json).map_err(|e| format_error(e.to_string()))?;
        if model.algorithm != "glm" {
            return Err(format_error(format!("unsupported algorithm '{}'", model.algorithm)));
        }
        if model.names.len() != model.coefficients.len() {
            return Err(format_error(format!(
                "{} names for {} coefficients",
                model.names.len(),
                model.coefficients.len()
            )));
        }
        Ok(model)
    }

    /// Package this description as a MOJO archive.
    pub fn write_archive<W: Write + Seek>(&self, writer: W) -> zip::result::ZipResult<W> {
        let mut zip = zip::ZipWriter::new(writer);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        zip.start_file(MODEL_ENTRY, options)?;
        let json = serde_json::to_vec_pretty(self).map_err(std::io::Error::other)?;
        zip.write_all(&json)?;
        zip.finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct H2OEstimator {
    artifact: ArtifactRef,
    model: Option<MojoModel>,
}

impl H2OEstimator {
    pub fn new(mojo_path: impl Into<String>) -> Self {
        Self {
            artifact: ArtifactRef::Unresolved {
                path: mojo_path.into(),
            },
            model: None,
        }
    }

    pub fn model(&self) -> Option<&MojoModel> {
        self.model.as_ref()
    }

    pub(crate) fn from_state(
        state: &ObjectState,
        _registry: &TypeRegistry,
    ) -> Result<Constructed, DecodeError> {
        Ok(Constructed::Estimator(Arc::new(Self::new(
            state.string("_mojo_path")?,
        ))))
    }
}

impl Estimator for H2OEstimator {
    fn type_name(&self) -> &'static str {
        H2O_ESTIMATOR
    }

    fn predict(&self, row: &[Datum]) -> Result<Prediction, EvaluationError> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EvaluationError::UnresolvedArtifact(self.artifact.path().to_string()))?;
        check_width(row, model.coefficients.len())?;
        let value = complete_row(row, H2O_ESTIMATOR)?.map(|xs| {
            let eta = linear_predictor(model.intercept, &model.coefficients, &xs);
            match model.link {
                Link::Identity => eta,
                Link::Logit => sigmoid(eta),
            }
        });
        Ok(Prediction::value(Datum::from(value)))
    }

    fn encode(
        &self,
        step: &str,
        encoder: &mut DocumentEncoder,
        features: Vec<Feature>,
    ) -> Result<Model, CompileError> {
        let (Some(local), Some(model)) = (self.artifact.local(), &self.model) else {
            return Err(CompileError::UnresolvedArtifact {
                step: step.to_string(),
                path: self.artifact.path().to_string(),
            });
        };
        check_features(step, &features, model.coefficients.len())?;

        let bytes = std::fs::read(local).map_err(|e| CompileError::ArtifactUnreadable {
            step: step.to_string(),
            path: local.to_path_buf(),
            message: e.to_string(),
        })?;
        encoder.add_artifact(ArtifactLocation {
            step: step.to_string(),
            uri: format!("file://{}", local.display()),
            sha256: format!("{:x}", Sha256::digest(&bytes)),
        });

        Ok(Model::Regression(RegressionModel {
            mining_function: MiningFunction::Regression,
            target: encoder.target_field().to_string(),
            normalization: match model.link {
                Link::Identity => Normalization::None,
                Link::Logit => Normalization::Logit,
            },
            tables: vec![regression_table(
                model.intercept,
                &model.coefficients,
                &features,
                None,
            )],
            categories: Vec::new(),
        }))
    }

    fn artifact(&self) -> Option<&ArtifactRef> {
        Some(&self.artifact)
    }

    fn resolve_artifact(
        &self,
        step: &str,
        local: &Path,
    ) -> Result<Arc<dyn Estimator>, ArtifactError> {
        let model = MojoModel::load(local)?;
        tracing::debug!(
            step,
            algorithm = %model.algorithm,
            coefficients = model.coefficients.len(),
            "Loaded MOJO model"
        );
        Ok(Arc::new(Self {
            artifact: self.artifact.resolve(local),
            model: Some(model),
        }))
    }
}
