// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Pristine image acquisition from a simplestreams mirror.

use crate::command::run_host_cmd_checked;
use anyhow::Context;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

/// Errors locating a mirrored image.
#[derive(Error, Debug)]
pub enum StreamError {
    /// the mirror did not hold exactly one image for the release
    #[error("expected one mirrored image for {release}, found {found}")]
    NoUniqueImage {
        /// The release searched for.
        release: String,
        /// How many images matched.
        found: usize,
    },
}

/// Where daily cloud images are mirrored from and to.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// The image stream to mirror.
    pub url: String,
    /// Local mirror directory.
    pub directory: PathBuf,
    /// Keyring used to verify the signed stream.
    pub keyring: PathBuf,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            url: "https://cloud-images.ubuntu.com/daily".into(),
            directory: "/srv/netplan/".into(),
            keyring: "/usr/share/keyrings/ubuntu-cloudimage-keyring.gpg".into(),
        }
    }
}

/// Picks the pristine image for a batch.
///
/// An explicit `image` is used as is. Otherwise the latest daily image of
/// `release` is mirrored, with `release` defaulting to the latest Ubuntu
/// release.
pub fn find_pristine_image(
    release: Option<&str>,
    image: Option<&Path>,
    mirror: &MirrorConfig,
) -> anyhow::Result<PathBuf> {
    let image = match image {
        Some(image) => image.to_owned(),
        None => {
            let release = match release {
                Some(release) => release.to_owned(),
                None => latest_ubuntu_release()?,
            };
            latest_cloud_image(&release, mirror)?
        }
    };
    tracing::info!(image = %image.display(), "using pristine image");
    Ok(image)
}

/// Syncs the newest daily disk image of `release` for this host's
/// architecture into the mirror directory and returns its path.
pub fn latest_cloud_image(release: &str, mirror: &MirrorConfig) -> anyhow::Result<PathBuf> {
    tracing::info!(release, "finding pristine image");
    let arch = system_architecture()?;

    let mut cmd = Command::new("sstream-mirror");
    cmd.arg(format!("--keyring={}", mirror.keyring.display()))
        .arg("--max=1")
        .arg(&mirror.url)
        .arg(&mirror.directory)
        .arg(format!("arch={arch}"))
        .arg(format!("release={release}"))
        .arg("ftype=disk1.img");
    run_host_cmd_checked(cmd, None).context("failed to sync image stream")?;

    Ok(find_mirrored_image(&mirror.directory, release)?)
}

fn find_mirrored_image(mirror_dir: &Path, release: &str) -> Result<PathBuf, StreamError> {
    let pattern = mirror_dir.join("**").join(release).join("**").join("*.img");
    let mut images: Vec<PathBuf> = match pattern.to_str().map(glob::glob) {
        Some(Ok(paths)) => paths.filter_map(Result::ok).collect(),
        _ => Vec::new(),
    };
    if images.len() != 1 {
        return Err(StreamError::NoUniqueImage {
            release: release.to_owned(),
            found: images.len(),
        });
    }
    Ok(images.remove(0))
}

/// The latest Ubuntu development release, or the latest stable release when
/// no release is in development.
pub fn latest_ubuntu_release() -> anyhow::Result<String> {
    let mut devel = Command::new("distro-info");
    devel.arg("--devel");
    match run_host_cmd_checked(devel, None) {
        Ok(release) if !release.is_empty() => return Ok(release),
        Ok(_) => {}
        Err(err) => {
            tracing::debug!(
                error = &err as &dyn std::error::Error,
                "no development release, using stable"
            );
        }
    }

    let mut stable = Command::new("distro-info");
    stable.arg("--stable");
    run_host_cmd_checked(stable, None).context("failed to determine latest release")
}

/// The host's Debian architecture name, e.g. `amd64`.
pub fn system_architecture() -> anyhow::Result<String> {
    let mut cmd = Command::new("dpkg");
    cmd.arg("--print-architecture");
    run_host_cmd_checked(cmd, None).context("failed to determine architecture")
}
