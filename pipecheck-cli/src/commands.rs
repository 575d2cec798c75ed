//! CLI subcommand handlers.

use crate::Commands;
use pipecheck_core::config::{WORKSPACE_CONFIG, config_exists};
use pipecheck_core::fixtures::model_fixture_path;
use pipecheck_core::harness::HarnessSettings;
use pipecheck_core::pipeline::Step;
use pipecheck_core::{
    CaseConfig, DirectoryFixtures, HarnessConfig, IntegrationHarness, Verdict, load_config,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

/// Handle a CLI subcommand.
pub async fn handle_command(
    command: Commands,
    workspace: &Path,
    fixtures: Option<PathBuf>,
) -> anyhow::Result<ExitCode> {
    match command {
        Commands::Run {
            cases,
            exclude,
            unguarded,
            absolute,
            relative,
            json,
        } => {
            let mut config = load(workspace, fixtures)?;
            if unguarded {
                config.guarded = false;
            }
            if let Some(absolute) = absolute {
                config.tolerance.absolute = absolute;
            }
            if let Some(relative) = relative {
                config.tolerance.relative = relative;
            }
            handle_run(config, cases, exclude, json).await
        }
        Commands::Inspect { case } => {
            handle_inspect(&load(workspace, fixtures)?, &case)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Compile { case, output } => {
            handle_compile(&load(workspace, fixtures)?, &case, output.as_deref())?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Init => {
            handle_init(workspace)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            handle_show_config(workspace)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load(workspace: &Path, fixtures: Option<PathBuf>) -> anyhow::Result<HarnessConfig> {
    let mut config = load_config(Some(workspace), None)?;
    if let Some(fixtures) = fixtures {
        config.fixtures_dir = fixtures;
    }
    if config.fixtures_dir.is_relative() {
        config.fixtures_dir = workspace.join(&config.fixtures_dir);
    }
    Ok(config)
}

fn harness(config: &HarnessConfig) -> IntegrationHarness<DirectoryFixtures> {
    IntegrationHarness::new(DirectoryFixtures::new(&config.fixtures_dir))
        .with_settings(HarnessSettings::from(config))
}

#[derive(Debug, Serialize)]
struct CaseOutcome {
    case: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    verdict: Option<Verdict>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl CaseOutcome {
    fn passed(&self) -> bool {
        self.verdict.as_ref().is_some_and(|v| v.passed)
    }
}

async fn run_cases(config: &HarnessConfig, cases: Vec<CaseConfig>) -> anyhow::Result<Vec<CaseOutcome>> {
    let harness = Arc::new(harness(config));
    let handles: Vec<_> = cases
        .into_iter()
        .map(|case| {
            let harness = Arc::clone(&harness);
            tokio::task::spawn_blocking(move || {
                let result = harness.run_case(&case);
                (case, result)
            })
        })
        .collect();

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        let (case, result) = handle.await?;
        let outcome = match result {
            Ok(verdict) => CaseOutcome {
                case: case.label(),
                verdict: Some(verdict),
                error: None,
            },
            Err(e) => {
                tracing::error!(case = %case.label(), error = %e, "Case failed");
                CaseOutcome {
                    case: case.label(),
                    verdict: None,
                    error: Some(e.to_string()),
                }
            }
        };
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

async fn handle_run(
    config: HarnessConfig,
    cases: Vec<CaseConfig>,
    exclude: Vec<String>,
    json: bool,
) -> anyhow::Result<ExitCode> {
    let mut cases = if cases.is_empty() {
        config.cases.clone()
    } else {
        cases
    };
    if cases.is_empty() {
        anyhow::bail!(
            "No cases to run. Pass --case MODEL:DATASET or add [[cases]] to {}",
            WORKSPACE_CONFIG
        );
    }
    for case in &mut cases {
        case.exclude.extend(exclude.iter().cloned());
    }

    tracing::info!(
        cases = cases.len(),
        fixtures = %config.fixtures_dir.display(),
        "Running cases"
    );
    let outcomes = run_cases(&config, cases).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&outcomes)?);
    } else {
        for outcome in &outcomes {
            match (&outcome.verdict, &outcome.error) {
                (Some(verdict), _) => println!("{verdict}"),
                (None, Some(error)) => println!("ERROR {}: {}", outcome.case, error),
                (None, None) => {}
            }
        }
        let passed = outcomes.iter().filter(|o| o.passed()).count();
        println!("\n{} of {} cases passed", passed, outcomes.len());
    }

    Ok(if outcomes.iter().all(CaseOutcome::passed) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn handle_inspect(config: &HarnessConfig, case: &CaseConfig) -> anyhow::Result<()> {
    let pipeline = harness(config).decode_fixture(&model_fixture_path(&case.model, &case.dataset))?;

    println!("Pipeline {}", case.label());
    if let Some(digest) = pipeline.source_digest() {
        println!("  sha256:        {}", digest);
    }
    println!("  active fields: {}", pipeline.active_fields().join(", "));
    println!("  target:        {}", pipeline.target_field());
    println!("  steps:");
    for step in pipeline.steps() {
        print!("    {:<16} {}", step.name, step.step.type_name());
        if let Step::Estimator(estimator) = &step.step {
            if let Some(artifact) = estimator.artifact() {
                print!("  (artifact {})", artifact.path());
            }
            if let Some(classes) = estimator.classes() {
                print!("  classes [{}]", classes.join(", "));
            }
        }
        println!();
    }
    if let Some(transformer) = pipeline.predict_transformer() {
        println!("  predict transformer: {}", transformer.type_name());
    }
    Ok(())
}

fn handle_compile(
    config: &HarnessConfig,
    case: &CaseConfig,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let prepared = harness(config).prepare(&case.model, &case.dataset)?;
    let json = prepared.document().to_json()?;
    for (result, field) in prepared.field_map().iter() {
        tracing::debug!(%result, field, "Mapped result");
    }
    match output {
        Some(path) => {
            std::fs::write(path, &json)?;
            println!("Wrote document for {} to {}", case.label(), path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

fn handle_init(workspace: &Path) -> anyhow::Result<()> {
    let config_path = workspace.join(WORKSPACE_CONFIG);
    if config_path.exists() {
        println!(
            "Configuration file already exists at: {}",
            config_path.display()
        );
        return Ok(());
    }
    let toml_str = toml::to_string_pretty(&HarnessConfig::default())?;
    std::fs::write(&config_path, &toml_str)?;
    println!(
        "Created default configuration at: {}",
        config_path.display()
    );
    Ok(())
}

fn handle_show_config(workspace: &Path) -> anyhow::Result<()> {
    if !config_exists(Some(workspace)) {
        println!("# No configuration file found; showing defaults.");
    }
    let config = load_config(Some(workspace), None)?;
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}
