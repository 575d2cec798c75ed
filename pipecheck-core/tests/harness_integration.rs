//! End-to-end cases through the integration harness.

mod common;

use common::*;
use pipecheck_core::comparator::{ComparisonResult, exclude_fields, exclude_none};
use pipecheck_core::config::CaseConfig;
use pipecheck_core::graph::GraphValue;
use pipecheck_core::harness::HarnessSettings;
use pipecheck_core::{EvaluationError, FixtureResolver, HarnessError, ResultName};
use pretty_assertions::assert_eq;

fn bspline_fixture() -> FixtureTree {
    let tree = FixtureTree::new();
    for (model, spline) in [
        ("Gaussian", gaussian_bspline()),
        ("Sin", sin_bspline()),
        ("Tanh", tanh_bspline()),
    ] {
        tree.write_pipeline(
            model,
            "BSpline",
            &pipeline(
                vec![("bspline", spline), ("lr", linear(&[1.0], 0.0))],
                vec![
                    ("active_fields", GraphValue::strs(&["x"])),
                    ("target_fields", GraphValue::strs(&["y"])),
                    ("predict_transformer", expression("numpy.exp(X[0]) - 1")),
                ],
            ),
        );
    }
    // Extends past the outer knots on both sides.
    tree.write_csv("BSpline", &["x"], &grid(-4.5, 4.5, 91));
    tree
}

fn unguarded_bspline_case(model: &str) -> CaseConfig {
    CaseConfig {
        model: model.into(),
        dataset: "BSpline".into(),
        exclude: vec!["predict(y)".into()],
        guarded: Some(false),
    }
}

#[test]
fn test_bspline_cases_pass_unguarded() {
    let tree = bspline_fixture();
    let harness = tree.harness();
    for model in ["Gaussian", "Sin", "Tanh"] {
        let verdict = harness.run_case(&unguarded_bspline_case(model)).unwrap();
        assert!(verdict.passed, "{verdict}");
        assert_eq!(verdict.records, 91);
        assert_eq!(verdict.total_mismatches, 0);
    }
}

#[test]
fn test_bspline_cases_prepare_unguarded() {
    let tree = bspline_fixture();
    let harness = tree.harness();
    let records = harness.resolver().load_records("csv/BSpline.csv").unwrap();
    let exclude = exclude_fields(["predict(y)"]);
    for model in ["Sin", "Tanh"] {
        let case = harness.prepare_with(model, "BSpline", false).unwrap();
        assert!(case.artifact_path().is_none());
        let verdict = case.run(&records, &exclude).unwrap();
        assert!(verdict.passed, "{verdict}");
        assert_eq!(verdict.model, model);
        assert_eq!(verdict.records, 91);
    }
}

#[test]
fn test_excluded_field_is_not_compared() {
    let tree = bspline_fixture();
    let harness = tree.harness();
    let case = harness.prepare("Gaussian", "BSpline").unwrap();
    let records = harness.resolver().load_records("csv/BSpline.csv").unwrap();

    let exclude = exclude_fields(["predict(y)"]);
    let transformed = case
        .field_map()
        .output_field(&ResultName::Transformed(0))
        .unwrap()
        .to_string();
    for comparison in case.comparisons(&records, &exclude) {
        let comparison = comparison.unwrap();
        assert_eq!(comparison.fields.len(), 2);
        for field in &comparison.fields {
            if field.field == "predict(y)" {
                assert_eq!(field.result, ComparisonResult::Excluded);
            } else {
                assert_eq!(field.field, transformed);
                assert_eq!(field.result, ComparisonResult::Match);
            }
        }
    }
}

#[test]
fn test_spline_value_agrees_at_sample_points() {
    let tree = bspline_fixture();
    let verdict = tree
        .harness()
        .evaluate("Gaussian", "BSpline", &exclude_none())
        .unwrap();
    assert!(verdict.passed, "{verdict}");
}

#[test]
fn test_dataset_suffix_selects_record_fixture() {
    let tree = FixtureTree::new();
    let root = pipeline(
        vec![("lr", linear(&[2.0, -1.0], 0.5))],
        vec![("active_fields", GraphValue::strs(&["x1", "x2"]))],
    );
    tree.write_pipeline("Linear", "AuditCat", &root);
    tree.write_pipeline("Linear", "AuditDict", &root);
    tree.write_pipeline("Linear", "AuditNA", &root);
    tree.write_csv(
        "Audit",
        &["x1", "x2"],
        &[vec!["1".into(), "2".into()], vec!["0.25".into(), "".into()]],
    );
    let harness = tree.harness();

    for dataset in ["AuditCat", "AuditDict"] {
        let verdict = harness.evaluate("Linear", dataset, &exclude_none()).unwrap();
        assert!(verdict.passed, "{verdict}");
        assert_eq!(verdict.records, 2);
    }
    // No suffix is stripped, so csv/AuditNA.csv is looked up.
    assert!(matches!(
        harness.evaluate("Linear", "AuditNA", &exclude_none()),
        Err(HarnessError::NotFound { path }) if path == "csv/AuditNA.csv"
    ));
}

#[test]
fn test_missing_model_fixture() {
    let tree = FixtureTree::new();
    tree.write_csv("Iris", &["x"], &[vec!["1".into()]]);
    assert!(matches!(
        tree.harness().evaluate("Nothing", "Iris", &exclude_none()),
        Err(HarnessError::NotFound { path }) if path == "pkl/NothingIris.pkl"
    ));
}

#[test]
fn test_compressed_pipeline_fixture() {
    let tree = FixtureTree::new();
    tree.write_pipeline_gz(
        "Logistic",
        "Iris",
        &pipeline(
            vec![(
                "classifier",
                logistic(
                    &["setosa", "versicolor", "virginica"],
                    vec![vec![1.0, -0.5], vec![0.2, 0.3], vec![-1.2, 0.2]],
                    &[0.1, 0.0, -0.1],
                ),
            )],
            vec![
                ("active_fields", GraphValue::strs(&["a", "b"])),
                ("target_fields", GraphValue::strs(&["species"])),
            ],
        ),
    );
    tree.write_csv(
        "Iris",
        &["a", "b"],
        &[
            vec!["5.1".into(), "3.5".into()],
            vec!["-2".into(), "7".into()],
            vec!["0".into(), "0".into()],
        ],
    );
    let verdict = tree
        .harness()
        .evaluate("Logistic", "Iris", &exclude_none())
        .unwrap();
    assert!(verdict.passed, "{verdict}");
}

fn nested_tanh(depth: usize) -> String {
    let mut source = "X[0]".to_string();
    for _ in 0..depth {
        source = format!("numpy.tanh({source})");
    }
    source
}

fn deep_fixture(depth: usize) -> FixtureTree {
    let tree = FixtureTree::new();
    tree.write_pipeline(
        "Deep",
        "Nested",
        &pipeline(
            vec![
                ("deep", expression(&nested_tanh(depth))),
                ("lr", linear(&[1.0], 0.0)),
            ],
            vec![("active_fields", GraphValue::strs(&["x"]))],
        ),
    );
    tree.write_csv("Nested", &["x"], &grid(-2.0, 2.0, 5));
    tree
}

#[test]
fn test_guarded_evaluation_rejects_deep_nesting() {
    let tree = deep_fixture(40);
    let result = tree.harness().evaluate("Deep", "Nested", &exclude_none());
    assert!(matches!(
        result,
        Err(HarnessError::Evaluation {
            record: 0,
            source: EvaluationError::GuardViolation { guard: "function", .. }
        })
    ));
}

#[test]
fn test_unguarded_evaluation_handles_deep_nesting() {
    let tree = deep_fixture(40);
    let harness = tree.harness().with_settings(HarnessSettings {
        guarded: false,
        ..HarnessSettings::default()
    });
    let verdict = harness.evaluate("Deep", "Nested", &exclude_none()).unwrap();
    assert!(verdict.passed, "{verdict}");
    assert_eq!(verdict.records, 5);

    // A per-case override wins over the harness setting.
    let mut case = CaseConfig::new("Deep", "Nested");
    case.guarded = Some(true);
    assert!(harness.run_case(&case).is_err());
}

#[test]
fn test_shallow_nesting_passes_guards() {
    let tree = deep_fixture(8);
    let verdict = tree
        .harness()
        .evaluate("Deep", "Nested", &exclude_none())
        .unwrap();
    assert!(verdict.passed, "{verdict}");
}
