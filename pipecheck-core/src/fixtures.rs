//! Fixture resolution and artifact staging.
//!
//! Fixtures are addressed by slash-separated paths relative to a fixture root:
//!
//! ```text
//! pkl/<Model><Dataset>.pkl    pickled pipeline
//! csv/<Dataset>.csv           input records
//! <artifact path>             blobs referenced by steps (e.g. MOJO archives)
//! ```

use crate::error::HarnessError;
use crate::types::InputRecord;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

/// Suffix given to staged artifact files.
pub const ARTIFACT_SUFFIX: &str = ".mojo.zip";

/// Dataset identifier used for the record fixture.
///
/// A trailing `Cat` is stripped; otherwise a trailing `Dict` is stripped;
/// any other identifier is used unchanged.
pub fn record_dataset(dataset: &str) -> &str {
    if let Some(base) = dataset.strip_suffix("Cat") {
        base
    } else if let Some(base) = dataset.strip_suffix("Dict") {
        base
    } else {
        dataset
    }
}

/// Path of the pickled pipeline for a (model, dataset) pair.
pub fn model_fixture_path(model: &str, dataset: &str) -> String {
    format!("pkl/{model}{dataset}.pkl")
}

/// Path of the input records for a dataset.
pub fn records_fixture_path(dataset: &str) -> String {
    format!("csv/{}.csv", record_dataset(dataset))
}

/// Resolves fixture paths to byte streams.
pub trait FixtureResolver: Send + Sync {
    /// Open a fixture. A missing fixture is [`HarnessError::NotFound`].
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, HarnessError>;

    /// Load a CSV fixture; the header row names the fields.
    fn load_records(&self, path: &str) -> Result<Vec<InputRecord>, HarnessError> {
        let reader = self.open(path)?;
        read_records(path, reader)
    }
}

/// Parse CSV records from `reader`. `path` is used in error messages only.
pub fn read_records(path: &str, reader: impl Read) -> Result<Vec<InputRecord>, HarnessError> {
    let mut csv = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(reader);
    let headers = csv
        .headers()
        .map_err(|e| HarnessError::fixture(path, e.to_string()))?
        .clone();
    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = headers.iter().find(|h| !seen.insert(*h)) {
        return Err(HarnessError::fixture(path, format!("duplicate column '{dup}'")));
    }

    let mut records = Vec::new();
    for row in csv.records() {
        let row = row.map_err(|e| HarnessError::fixture(path, e.to_string()))?;
        records.push(
            headers
                .iter()
                .zip(row.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect(),
        );
    }
    tracing::debug!(path, records = records.len(), "Loaded records");
    Ok(records)
}

/// Fixtures stored under a directory.
#[derive(Debug, Clone)]
pub struct DirectoryFixtures {
    root: PathBuf,
}

impl DirectoryFixtures {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a fixture path onto the filesystem, refusing paths that leave the root.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, HarnessError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(HarnessError::fixture(path, "path escapes the fixture root"));
        }
        Ok(self.root.join(relative))
    }
}

impl FixtureResolver for DirectoryFixtures {
    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>, HarnessError> {
        let full = self.resolve(path)?;
        match File::open(&full) {
            Ok(file) => {
                tracing::trace!(path = %full.display(), "Opened fixture");
                Ok(Box::new(io::BufReader::new(file)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(HarnessError::not_found(path)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Copies artifact streams into uniquely named temporary files.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStaging {
    dir: Option<PathBuf>,
}

impl ArtifactStaging {
    /// Stage into the system temp directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage into `dir`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// Copy `reader` to a new temp file named `<prefix>XXXX.mojo.zip`.
    ///
    /// If copying fails the partial file is removed before returning.
    pub fn materialize(
        &self,
        reader: &mut dyn Read,
        prefix: &str,
    ) -> Result<StagedArtifact, HarnessError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(prefix).suffix(ARTIFACT_SUFFIX);
        let mut file = match &self.dir {
            Some(dir) => builder.tempfile_in(dir)?,
            None => builder.tempfile()?,
        };
        let bytes = io::copy(reader, &mut file)?;
        file.flush()?;
        let path = file
            .into_temp_path()
            .keep()
            .map_err(|e| HarnessError::Io(e.error))?;
        tracing::debug!(path = %path.display(), bytes, "Staged artifact");
        Ok(StagedArtifact { path })
    }
}

/// A materialized artifact file, deleted when dropped.
#[derive(Debug)]
pub struct StagedArtifact {
    path: PathBuf,
}

impl StagedArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagedArtifact {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "Deleted staged artifact"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to delete staged artifact"
            ),
        }
    }
}
