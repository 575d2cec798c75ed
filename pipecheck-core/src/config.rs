//! Harness configuration.
//!
//! Configuration is layered with figment, later layers winning:
//!
//! 1. built-in defaults,
//! 2. the user config (`config.toml` in the platform config dir),
//! 3. the workspace `pipecheck.toml`,
//! 4. `PIPECHECK_` environment variables (`__` separates nested keys),
//! 5. explicit overrides.

use crate::comparator::Tolerance;
use crate::error::HarnessError;
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the workspace-level config file.
pub const WORKSPACE_CONFIG: &str = "pipecheck.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root directory of the fixture tree.
    pub fixtures_dir: PathBuf,
    /// Build document evaluators with the default nesting guards.
    pub guarded: bool,
    /// How many mismatches a verdict lists in detail.
    pub max_reported_mismatches: usize,
    pub tolerance: Tolerance,
    pub cases: Vec<CaseConfig>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            fixtures_dir: PathBuf::from("fixtures"),
            guarded: true,
            max_reported_mismatches: 10,
            tolerance: Tolerance::default(),
            cases: Vec::new(),
        }
    }
}

/// One (model, dataset) verification case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseConfig {
    pub model: String,
    pub dataset: String,
    /// Output fields left out of the comparison.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    /// Overrides [`HarnessConfig::guarded`] for this case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guarded: Option<bool>,
}

impl CaseConfig {
    pub fn new(model: impl Into<String>, dataset: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            dataset: dataset.into(),
            exclude: Vec::new(),
            guarded: None,
        }
    }

    /// `<Model>:<Dataset>` label.
    pub fn label(&self) -> String {
        format!("{}:{}", self.model, self.dataset)
    }
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "pipecheck", "pipecheck")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load the layered configuration.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&HarnessConfig>,
) -> Result<HarnessConfig, HarnessError> {
    let mut figment = Figment::from(Serialized::defaults(HarnessConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = ws.join(WORKSPACE_CONFIG);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // PIPECHECK_TOLERANCE__ABSOLUTE, PIPECHECK_GUARDED, ...
    figment = figment.merge(Env::prefixed("PIPECHECK_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment
        .extract()
        .map_err(|e| HarnessError::Config(Box::new(e)))
}

/// Whether a workspace or user config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if user_config_path().is_some_and(|p| p.exists()) {
        return true;
    }
    workspace.is_some_and(|ws| ws.join(WORKSPACE_CONFIG).exists())
}
