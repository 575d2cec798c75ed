//! Shared fixture builders for integration tests.
#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use pipecheck_core::graph::{GraphValue, ObjectGraphEncoder};
use pipecheck_core::pipeline::PMML_PIPELINE;
use pipecheck_core::pipeline::bspline::{BSPLINE, BSPLINE_TRANSFORMER};
use pipecheck_core::pipeline::expression::EXPRESSION_TRANSFORMER;
use pipecheck_core::pipeline::h2o::{Link, MojoModel};
use pipecheck_core::pipeline::linear::{LINEAR_REGRESSION, LOGISTIC_REGRESSION};
use pipecheck_core::{DirectoryFixtures, IntegrationHarness};
use std::io::Write;
use std::path::Path;
use tempfile::TempDir;

/// A fixture tree in a temporary directory.
pub struct FixtureTree {
    dir: TempDir,
}

impl FixtureTree {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, path: &str, bytes: &[u8]) {
        let full = self.root().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, bytes).unwrap();
    }

    pub fn write_pipeline(&self, model: &str, dataset: &str, root: &GraphValue) {
        let bytes = ObjectGraphEncoder::new().encode(root);
        self.write(&format!("pkl/{model}{dataset}.pkl"), &bytes);
    }

    /// Write the pipeline through a gzip compressor.
    pub fn write_pipeline_gz(&self, model: &str, dataset: &str, root: &GraphValue) {
        let mut gz = GzEncoder::new(Vec::new(), Compression::default());
        gz.write_all(&ObjectGraphEncoder::new().encode(root)).unwrap();
        self.write(&format!("pkl/{model}{dataset}.pkl"), &gz.finish().unwrap());
    }

    pub fn write_csv(&self, dataset: &str, header: &[&str], rows: &[Vec<String>]) {
        let mut text = header.join(",");
        text.push('\n');
        for row in rows {
            text.push_str(&row.join(","));
            text.push('\n');
        }
        self.write(&format!("csv/{dataset}.csv"), text.as_bytes());
    }

    pub fn write_mojo(&self, path: &str, model: &MojoModel) {
        let cursor = model.write_archive(std::io::Cursor::new(Vec::new())).unwrap();
        self.write(path, &cursor.into_inner());
    }

    pub fn harness(&self) -> IntegrationHarness<DirectoryFixtures> {
        IntegrationHarness::new(DirectoryFixtures::new(self.root()))
    }
}

pub fn pipeline(steps: Vec<(&str, GraphValue)>, extra: Vec<(&str, GraphValue)>) -> GraphValue {
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

pub fn linear(coef: &[f64], intercept: f64) -> GraphValue {
    GraphValue::object(
        LINEAR_REGRESSION,
        [
            ("coef_", GraphValue::floats(coef)),
            ("intercept_", GraphValue::Float(intercept)),
        ],
    )
}

pub fn logistic(classes: &[&str], coef: Vec<Vec<f64>>, intercept: &[f64]) -> GraphValue {
    GraphValue::object(
        LOGISTIC_REGRESSION,
        [
            ("classes_", GraphValue::strs(classes)),
            (
                "coef_",
                GraphValue::List(coef.iter().map(|row| GraphValue::floats(row)).collect()),
            ),
            ("intercept_", GraphValue::floats(intercept)),
        ],
    )
}

pub fn expression(source: &str) -> GraphValue {
    GraphValue::object(EXPRESSION_TRANSFORMER, [("expr", GraphValue::str(source))])
}

/// Clamped cubic knots on [-3, 3].
pub const GAUSSIAN_KNOTS: [f64; 13] = [
    -3.0, -3.0, -3.0, -3.0, -2.0, -1.0, 0.0, 1.0, 2.0, 3.0, 3.0, 3.0, 3.0,
];

/// Clamped cubic knots on [-pi, pi].
pub fn periodic_knots() -> Vec<f64> {
    use std::f64::consts::PI;
    let mut knots = vec![-PI; 3];
    knots.extend((0..=8).map(|i| -PI + PI * i as f64 / 4.0));
    knots.extend([PI; 3]);
    knots
}

/// Cubic spline with coefficients `f` sampled at the Greville abscissae of `knots`.
pub fn fitted_bspline(knots: &[f64], f: impl Fn(f64) -> f64) -> GraphValue {
    let k = 3;
    let n = knots.len() - k - 1;
    let coefficients: Vec<f64> = (0..n)
        .map(|i| f(knots[i + 1..=i + k].iter().sum::<f64>() / k as f64))
        .collect();
    let spline = GraphValue::object(
        BSPLINE,
        [
            ("t", GraphValue::floats(knots)),
            ("c", GraphValue::floats(&coefficients)),
            ("k", GraphValue::Int(k as i64)),
            ("extrapolate", GraphValue::Bool(true)),
        ],
    );
    GraphValue::object(BSPLINE_TRANSFORMER, [("bspline", spline)])
}

/// Standard normal density on [`GAUSSIAN_KNOTS`].
pub fn gaussian_bspline() -> GraphValue {
    fitted_bspline(&GAUSSIAN_KNOTS, |g| {
        (-g * g / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt()
    })
}

pub fn sin_bspline() -> GraphValue {
    fitted_bspline(&periodic_knots(), f64::sin)
}

pub fn tanh_bspline() -> GraphValue {
    fitted_bspline(&GAUSSIAN_KNOTS, f64::tanh)
}

/// Evenly spaced inputs covering `[lo, hi]`.
pub fn grid(lo: f64, hi: f64, count: usize) -> Vec<Vec<String>> {
    (0..count)
        .map(|i| {
            let x = lo + (hi - lo) * i as f64 / (count - 1) as f64;
            vec![x.to_string()]
        })
        .collect()
}

pub fn glm(link: Link, coefficients: &[f64], intercept: f64) -> MojoModel {
    MojoModel {
        algorithm: "glm".into(),
        link,
        names: (1..=coefficients.len()).map(|i| format!("x{i}")).collect(),
        coefficients: coefficients.to_vec(),
        intercept,
    }
}
