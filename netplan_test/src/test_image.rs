// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The per-test overlay image.

use crate::CONSOLE_LOG_FILE_NAME;
use crate::GUEST_LOG_DIR;
use crate::GUEST_NETPLAN_PATH;
use crate::LogSource;
use crate::OVERLAY_FILE_NAME;
use crate::SEED_FILE_NAME;
use crate::base_image::BaseImage;
use crate::base_image::remove_if_present;
use crate::guest::DiskMounter;
use crate::guest::GuestFileBridge;
use crate::guest::GuestOutput;
use crate::guest::MountImageCallback;
use crate::launcher::LaunchConfig;
use crate::launcher::LaunchOutcome;
use crate::launcher::LaunchRequest;
use crate::launcher::Qemu;
use crate::launcher::VmLauncher;
use crate::overlay::OverlayBuilder;
use crate::overlay::QemuImg;
use crate::seed::SeedBuilder;
use crate::seed::USER_DATA;
use anyhow::Context;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// Errors specific to test image setup.
#[derive(Error, Debug)]
pub enum TestImageError {
    /// a test with the same name already ran in this batch
    #[error("test `{name}` already has a results directory at {}", path.display())]
    DuplicateTest {
        /// The derived test name.
        name: String,
        /// The colliding directory.
        path: PathBuf,
    },
    /// the configuration path has no usable file name
    #[error("cannot derive a test name from {}", .0.display())]
    BadConfigPath(PathBuf),
}

/// The host capabilities a test image is built and run with.
pub struct Toolkit {
    /// Offline access to guest disks.
    pub bridge: GuestFileBridge<Box<dyn DiskMounter>>,
    /// Overlay creation.
    pub overlay: Box<dyn OverlayBuilder>,
    /// Seed disk creation.
    pub seed: Box<dyn SeedBuilder>,
    /// Guest boot.
    pub launcher: Box<dyn VmLauncher>,
}

impl Toolkit {
    /// Assembles a toolkit from its parts.
    pub fn new(
        mounter: impl DiskMounter + 'static,
        overlay: impl OverlayBuilder + 'static,
        seed: impl SeedBuilder + 'static,
        launcher: impl VmLauncher + 'static,
    ) -> Self {
        Self {
            bridge: GuestFileBridge::new(Box::new(mounter)),
            overlay: Box::new(overlay),
            seed: Box::new(seed),
            launcher: Box::new(launcher),
        }
    }

    /// The toolkit backed by the real host tools: `mount-image-callback`,
    /// `qemu-img` and QEMU, with seeds from `seed`.
    pub fn host(launch: LaunchConfig, seed: impl SeedBuilder + 'static, use_sudo: bool) -> Self {
        Self::new(
            MountImageCallback { use_sudo },
            QemuImg::default(),
            seed,
            Qemu::new(launch),
        )
    }
}

/// Derives the test name from a configuration path: the file name with its
/// extension stripped.
pub fn test_name(config_path: &Path) -> Result<String, TestImageError> {
    config_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TestImageError::BadConfigPath(config_path.to_owned()))
}

/// A disposable overlay of the base image for one test case.
///
/// The overlay and seed disks are removed by [`TestImage::release`], or on
/// drop. Everything else in the test directory is kept.
pub struct TestImage<'a> {
    toolkit: &'a Toolkit,
    log: LogSource,
    name: String,
    directory: PathBuf,
    path: PathBuf,
    seed_path: Option<PathBuf>,
}

impl<'a> TestImage<'a> {
    /// Creates the test directory and overlay for `config_path`, writes the
    /// configuration into the guest, and applies it.
    ///
    /// e.g. for `configs/basic.yaml`:
    ///
    /// ```text
    /// name       basic
    /// directory  results/20171128091153/basic
    /// path       results/20171128091153/basic/image.qcow
    /// ```
    pub fn create(
        toolkit: &'a Toolkit,
        log: &LogSource,
        base: &BaseImage,
        config_path: &Path,
    ) -> anyhow::Result<Self> {
        let name = test_name(config_path)?;
        let log = log.for_test(&name);
        let directory = base.directory().join(&name);
        let path = directory.join(OVERLAY_FILE_NAME);

        let _enter = log.span().enter();
        tracing::info!("running test: {name}");

        match fs_err::create_dir(&directory) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(TestImageError::DuplicateTest {
                    name,
                    path: directory,
                }
                .into());
            }
            Err(err) => return Err(err.into()),
        }

        tracing::debug!("creating test image");
        let image = Self {
            toolkit,
            log: log.clone(),
            name,
            directory,
            path,
            seed_path: None,
        };
        // From here on, dropping `image` on an early return removes the
        // overlay again.
        toolkit
            .overlay
            .create_overlay(base.path(), &image.path)
            .context("failed to create overlay")?;
        toolkit
            .bridge
            .push(config_path, GUEST_NETPLAN_PATH, &image.path)?;
        image
            .execute(&["netplan", "apply"])
            .context("failed to apply configuration")?;

        Ok(image)
    }

    /// The test name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The per-test results directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The overlay disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The seed disk, once generated.
    pub fn seed_path(&self) -> Option<&Path> {
        self.seed_path.as_deref()
    }

    /// Runs `argv` inside the powered-off guest and returns its output.
    pub fn execute(&self, argv: &[&str]) -> anyhow::Result<GuestOutput> {
        self.toolkit.bridge.exec(argv, &self.path)
    }

    /// Generates the seed, boots the guest, and waits for it to power off or
    /// be terminated.
    pub fn launch(&mut self) -> anyhow::Result<LaunchOutcome> {
        let _enter = self.log.span().enter();

        // Record the seed path before building so a partially written seed
        // is still cleaned up.
        self.seed_path = Some(self.directory.join(SEED_FILE_NAME));
        let seed = self
            .toolkit
            .seed
            .build(&self.directory, USER_DATA)
            .context("failed to generate seed")?;
        self.seed_path = Some(seed.clone());

        let console_log = self.directory.join(CONSOLE_LOG_FILE_NAME);
        let outcome = self.toolkit.launcher.launch(&LaunchRequest {
            overlay: &self.path,
            seed: &seed,
            console_log: &console_log,
        })?;
        if outcome.timed_out() {
            tracing::warn!("guest was terminated after running past its deadline");
        }
        Ok(outcome)
    }

    /// Copies every regular file in the guest log directory into the test
    /// directory. Subdirectories are skipped.
    ///
    /// The guest must be stopped.
    pub fn collect(&self) -> anyhow::Result<Vec<PathBuf>> {
        let _enter = self.log.span().enter();
        tracing::debug!("collecting results");

        let entries = self.toolkit.bridge.list_files(GUEST_LOG_DIR, &self.path)?;
        let mut collected = Vec::with_capacity(entries.len());
        for entry in entries {
            let remote = format!("{}/{}", GUEST_LOG_DIR.trim_end_matches('/'), entry);
            let local = self.directory.join(&entry);
            self.toolkit.bridge.pull(&remote, &local, &self.path)?;
            collected.push(local);
        }
        Ok(collected)
    }

    /// Removes the overlay and seed disks. Calling this more than once is
    /// harmless.
    pub fn release(&mut self) -> anyhow::Result<()> {
        let overlay = remove_if_present(&self.path);
        let seed = match self.seed_path.take() {
            Some(seed) => remove_if_present(&seed),
            None => Ok(()),
        };
        overlay.context("failed to remove overlay")?;
        seed.context("failed to remove seed")?;
        Ok(())
    }
}

impl Drop for TestImage<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            let _enter = self.log.span().enter();
            tracing::error!(
                error = e.as_ref() as &dyn std::error::Error,
                "failed to release test image"
            );
        }
    }
}
