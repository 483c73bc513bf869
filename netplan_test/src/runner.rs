// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The batch controller behind `collect`, `run`, and `verify`.

use crate::LogSource;
use crate::base_image::BaseImage;
use crate::image_stream::MirrorConfig;
use crate::image_stream::find_pristine_image;
use crate::results::BatchReport;
use crate::results::DEFAULT_CONFIGS_DIR;
use crate::results::TestReport;
use crate::results::TestStatus;
use crate::results::find_tests;
use crate::results::setup_results_dir;
use crate::test_image::TestImage;
use crate::test_image::Toolkit;
use crate::test_image::test_name;
use anyhow::Context;
use jiff::Timestamp;
use std::path::Path;
use std::path::PathBuf;

/// What a batch runs against.
#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Results root; defaults to `results`.
    pub results_root: Option<PathBuf>,
    /// Configurations to test. Empty means every `*.yaml` in `configs_dir`.
    pub tests: Vec<PathBuf>,
    /// Where to discover configurations.
    pub configs_dir: PathBuf,
    /// Release to mirror the pristine image for.
    pub release: Option<String>,
    /// Explicit pristine image, bypassing the mirror.
    pub image: Option<PathBuf>,
    /// Image mirror settings.
    pub mirror: MirrorConfig,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            results_root: None,
            tests: Vec::new(),
            configs_dir: DEFAULT_CONFIGS_DIR.into(),
            release: None,
            image: None,
            mirror: MirrorConfig::default(),
        }
    }
}

/// Boots a guest for every configuration and gathers its logs.
///
/// Setup failures (results directory, image, base copy) fail the batch. A
/// failing test is recorded in the returned report and the batch moves on.
pub fn collect(options: &BatchOptions, toolkit: &Toolkit) -> anyhow::Result<BatchReport> {
    let results_dir = setup_results_dir(options.results_root.as_deref())?;
    let log = LogSource::new(&results_dir);
    let _enter = log.span().enter();

    let pristine = find_pristine_image(
        options.release.as_deref(),
        options.image.as_deref(),
        &options.mirror,
    )?;
    let mut base =
        BaseImage::create(&pristine, &results_dir).context("failed to create base image")?;
    let tests = find_tests(&options.tests, &options.configs_dir)?;

    let mut report = BatchReport::new(&results_dir, &pristine);
    for config in &tests {
        report.tests.push(run_one(toolkit, &log, &base, config));
    }

    let summary = report.finish()?;
    tracing::info!(
        passed = report.tests.len() - report.failed(),
        failed = report.failed(),
        summary = %summary.display(),
        "batch complete"
    );
    base.release().context("failed to remove base image")?;
    Ok(report)
}

/// Collects, then verifies the new batch.
pub fn run(options: &BatchOptions, toolkit: &Toolkit) -> anyhow::Result<BatchReport> {
    let report = collect(options, toolkit)?;
    verify(&report.results_dir)?;
    Ok(report)
}

/// Verifies the collected results of a batch.
///
/// Collected artifacts are not checked against any criteria yet. This
/// reports the recorded outcome of each test from the batch summary, if
/// one was written.
pub fn verify(results_dir: &Path) -> anyhow::Result<Option<BatchReport>> {
    tracing::info!(dir = %results_dir.display(), "verifying");
    if !results_dir.is_dir() {
        anyhow::bail!("results directory {} does not exist", results_dir.display());
    }
    let report = BatchReport::load(results_dir)?;
    match &report {
        Some(report) => {
            for test in &report.tests {
                match test.status {
                    TestStatus::Passed => tracing::info!(name = test.name, "passed"),
                    TestStatus::Failed => tracing::warn!(
                        name = test.name,
                        error = test.error.as_deref().unwrap_or_default(),
                        "failed"
                    ),
                }
            }
        }
        None => tracing::warn!("no batch summary found"),
    }
    Ok(report)
}

fn run_one(toolkit: &Toolkit, log: &LogSource, base: &BaseImage, config: &Path) -> TestReport {
    let name = test_name(config).unwrap_or_else(|_| config.display().to_string());
    let start = Timestamp::now();
    let mut timed_out = false;
    let result = run_test(toolkit, log, base, config, &mut timed_out);
    log.log_test_result(&name, &result);

    let (status, error, collected) = match result {
        Ok(collected) => (TestStatus::Passed, None, collected),
        Err(err) => (TestStatus::Failed, Some(format!("{err:#}")), Vec::new()),
    };
    TestReport {
        name,
        config: config.to_owned(),
        status,
        error,
        timed_out,
        collected,
        duration_secs: Timestamp::now().duration_since(start).as_secs_f64(),
    }
}

fn run_test(
    toolkit: &Toolkit,
    log: &LogSource,
    base: &BaseImage,
    config: &Path,
    timed_out: &mut bool,
) -> anyhow::Result<Vec<String>> {
    let mut image = TestImage::create(toolkit, log, base, config)?;
    *timed_out = image.launch()?.timed_out();
    let collected = image.collect()?;
    image.release()?;
    Ok(collected
        .iter()
        .filter_map(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubHost;

    fn options(host: &StubHost) -> BatchOptions {
        BatchOptions {
            results_root: Some(host.results_root()),
            configs_dir: host.configs_dir(),
            image: Some(host.pristine()),
            ..Default::default()
        }
    }

    #[test]
    fn collect_produces_results_tree() {
        let host = StubHost::new();
        host.add_config("basic.yaml", b"network:\n  version: 2\n");
        host.add_config("vlan.yaml", b"network:\n  vlans: {}\n");
        host.set_guest_logs(&[("ip_a.log", b"1: lo\n"), ("networkctl.log", b"IDX LINK\n")]);
        let toolkit = host.toolkit();

        let report = collect(&options(&host), &toolkit).unwrap();
        assert!(report.all_passed());
        assert_eq!(report.tests.len(), 2);
        assert_eq!(report.tests[0].name, "basic");
        assert_eq!(report.tests[1].name, "vlan");
        assert_eq!(report.tests[0].collected, ["ip_a.log", "networkctl.log"]);

        let dir = &report.results_dir;
        assert_eq!(dir.parent().unwrap(), host.results_root());
        for name in ["basic", "vlan"] {
            let test_dir = dir.join(name);
            assert!(test_dir.join("console.log").exists());
            assert_eq!(fs_err::read(test_dir.join("ip_a.log")).unwrap(), b"1: lo\n");
            assert!(!test_dir.join("image.qcow").exists());
            assert!(!test_dir.join("seed.img").exists());
        }
        assert!(dir.join("summary.json").exists());

        // The base copy outlived both tests and is removed at the end.
        assert_eq!(host.overlays_over_live_base(), 2);
        assert!(!dir.join("focal.img").exists());
        assert!(host.pristine().exists());
    }

    #[test]
    fn failed_test_does_not_stop_the_batch() {
        let host = StubHost::new();
        host.add_config("basic.yaml", b"network: {}\n");
        host.add_config("vlan.yaml", b"network: {}\n");
        host.fail_apply_for("basic");
        let toolkit = host.toolkit();

        let report = collect(&options(&host), &toolkit).unwrap();
        assert_eq!(report.failed(), 1);
        assert!(!report.tests[0].passed());
        assert!(
            report.tests[0]
                .error
                .as_deref()
                .unwrap()
                .contains("failed to apply configuration")
        );
        assert!(report.tests[1].passed());
        assert!(!report.results_dir.join("basic/image.qcow").exists());
        assert!(!report.results_dir.join("focal.img").exists());
    }

    #[test]
    fn timeout_is_recorded_not_fatal() {
        let host = StubHost::new();
        host.add_config("basic.yaml", b"network: {}\n");
        host.set_timed_out(true);
        let toolkit = host.toolkit();

        let report = collect(&options(&host), &toolkit).unwrap();
        assert!(report.all_passed());
        assert!(report.tests[0].timed_out);
    }

    #[test]
    fn missing_pristine_image_fails_the_batch() {
        let host = StubHost::new();
        host.add_config("basic.yaml", b"network: {}\n");
        let toolkit = host.toolkit();
        let options = BatchOptions {
            image: Some(host.configs_dir().join("missing.img")),
            ..options(&host)
        };
        assert!(collect(&options, &toolkit).is_err());
    }

    #[test]
    fn run_verifies_the_new_batch() {
        let host = StubHost::new();
        host.add_config("basic.yaml", b"network: {}\n");
        let toolkit = host.toolkit();

        let report = run(&options(&host), &toolkit).unwrap();
        let verified = verify(&report.results_dir).unwrap().unwrap();
        assert_eq!(verified.tests.len(), 1);
        assert!(verify(&host.results_root().join("nope")).is_err());
    }
}
