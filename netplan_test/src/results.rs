// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The results tree: batch directories, test discovery, and the batch
//! summary.

use anyhow::Context;
use jiff::Timestamp;
use jiff::Zoned;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::path::PathBuf;

/// Results root used when none is given.
pub const DEFAULT_RESULTS_ROOT: &str = "results";
/// Directory searched for test configurations when none are given.
pub const DEFAULT_CONFIGS_DIR: &str = "configs";
/// File name of the batch summary inside a batch directory.
pub const SUMMARY_FILE_NAME: &str = "summary.json";

const BATCH_DIR_FORMAT: &str = "%Y%m%d%H%M%S";

/// Creates the batch directory `<root>/<YYYYMMDDHHMMSS>` and returns its
/// path. `root` defaults to [`DEFAULT_RESULTS_ROOT`].
pub fn setup_results_dir(root: Option<&Path>) -> anyhow::Result<PathBuf> {
    let root = root.unwrap_or(Path::new(DEFAULT_RESULTS_ROOT));
    let dir = root.join(batch_dir_name(&Zoned::now()));
    fs_err::create_dir_all(&dir).context("failed to create results directory")?;
    tracing::info!(dir = %dir.display(), "results directory created");
    Ok(dir)
}

fn batch_dir_name(now: &Zoned) -> String {
    now.strftime(BATCH_DIR_FORMAT).to_string()
}

/// Returns the configurations to test, sorted.
///
/// An explicit list is used as given. Otherwise every `*.yaml` file directly
/// inside `configs_dir` is a test.
pub fn find_tests(tests: &[PathBuf], configs_dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = if tests.is_empty() {
        let pattern = configs_dir.join("*.yaml");
        let pattern = pattern
            .to_str()
            .context("configs directory is not valid utf-8")?;
        glob::glob(pattern)
            .context("invalid configs directory")?
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read configs directory")?
    } else {
        tests.to_vec()
    };
    found.sort();
    tracing::info!(count = found.len(), tests = ?found, "found tests");
    Ok(found)
}

/// Final state of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    /// The test image was created, booted, and collected without error.
    Passed,
    /// Some step failed; see [`TestReport::error`].
    Failed,
}

/// Outcome of one test case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestReport {
    /// Test name, derived from the configuration file name.
    pub name: String,
    /// The configuration file the test ran with.
    pub config: PathBuf,
    /// Pass or fail.
    pub status: TestStatus,
    /// The error chain of a failed test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Whether the guest had to be terminated at its deadline.
    pub timed_out: bool,
    /// Guest files collected into the test directory.
    #[serde(default)]
    pub collected: Vec<String>,
    /// Wall-clock time spent on the test, in seconds.
    pub duration_secs: f64,
}

impl TestReport {
    /// Whether the test passed.
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// Outcome of a whole batch, written to [`SUMMARY_FILE_NAME`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    /// The batch directory.
    pub results_dir: PathBuf,
    /// The pristine image the batch ran against.
    pub pristine_image: PathBuf,
    /// When the batch started.
    pub started: Timestamp,
    /// When the batch finished, if it did.
    #[serde(default)]
    pub finished: Option<Timestamp>,
    /// Per-test outcomes, in execution order.
    pub tests: Vec<TestReport>,
}

impl BatchReport {
    /// Starts an empty report for the batch in `results_dir`.
    pub fn new(results_dir: &Path, pristine_image: &Path) -> Self {
        Self {
            results_dir: results_dir.to_owned(),
            pristine_image: pristine_image.to_owned(),
            started: Timestamp::now(),
            finished: None,
            tests: Vec::new(),
        }
    }

    /// Number of failed tests.
    pub fn failed(&self) -> usize {
        self.tests.iter().filter(|t| !t.passed()).count()
    }

    /// Whether every test passed.
    pub fn all_passed(&self) -> bool {
        self.failed() == 0
    }

    /// Marks the batch finished and writes the summary into the batch
    /// directory.
    pub fn finish(&mut self) -> anyhow::Result<PathBuf> {
        self.finished = Some(Timestamp::now());
        let path = self.results_dir.join(SUMMARY_FILE_NAME);
        let json = serde_json::to_vec_pretty(self).context("failed to serialize summary")?;
        fs_err::write(&path, json)?;
        Ok(path)
    }

    /// Reads the summary of the batch in `results_dir`, if one was written.
    pub fn load(results_dir: &Path) -> anyhow::Result<Option<Self>> {
        let path = results_dir.join(SUMMARY_FILE_NAME);
        let data = match fs_err::read(&path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let report = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(report))
    }
}
