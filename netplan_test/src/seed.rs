// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! First-boot NoCloud seed disks.

use crate::SEED_FILE_NAME;
use crate::command::run_host_cmd;
use anyhow::Context;
use fatfs::FormatVolumeOptions;
use fatfs::FsOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::process::ExitStatus;
use thiserror::Error;

/// The cloud-config every guest boots with. It gathers network state into
/// the guest log directory and powers the guest off.
pub const USER_DATA: &[u8] = include_bytes!("../guest-bootstrap/user-data");

const META_DATA: &[u8] = b"instance-id: iid-netplan-test\nlocal-hostname: netplan-test\n";

/// Size of seed disks built by [`FatSeed`].
const FAT_SEED_SIZE: u64 = 2 * 1024 * 1024;

/// Errors building a seed disk.
#[derive(Error, Debug)]
pub enum SeedError {
    /// the seed tool failed
    #[error("seed tool exited with status {status}: {stderr}")]
    Tool {
        /// Exit status of the tool.
        status: ExitStatus,
        /// Standard output of the tool.
        stdout: String,
        /// Standard error of the tool.
        stderr: String,
    },
}

/// What to do when the seed tool reports a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum SeedErrorPolicy {
    /// Fail the test case.
    #[default]
    Abort,
    /// Log the tool's output and boot with whatever seed was produced.
    Warn,
}

/// Builds the seed disk a guest reads its first-boot configuration from.
pub trait SeedBuilder {
    /// Writes a seed disk carrying `user_data` into `directory` and returns
    /// its path.
    fn build(&self, directory: &Path, user_data: &[u8]) -> anyhow::Result<PathBuf>;
}

/// [`SeedBuilder`] using cloud-image-utils' `cloud-localds`.
#[derive(Debug, Clone, Default)]
pub struct CloudLocalds {
    /// Handling of tool failures.
    pub policy: SeedErrorPolicy,
}

impl SeedBuilder for CloudLocalds {
    fn build(&self, directory: &Path, user_data: &[u8]) -> anyhow::Result<PathBuf> {
        tracing::debug!("generating seed image");
        let seed = directory.join(SEED_FILE_NAME);

        let mut user_data_file =
            tempfile::NamedTempFile::new().context("failed to create user-data file")?;
        user_data_file.write_all(user_data)?;
        user_data_file.flush()?;

        let mut cmd = Command::new("cloud-localds");
        cmd.arg(&seed).arg(user_data_file.path());
        let output = run_host_cmd(cmd, None)?;
        let stdout = output.stdout_lossy();
        let stderr = output.stderr_lossy();

        if !output.status.success() {
            match self.policy {
                SeedErrorPolicy::Abort => {
                    return Err(SeedError::Tool {
                        status: output.status,
                        stdout,
                        stderr,
                    }
                    .into());
                }
                SeedErrorPolicy::Warn => {
                    tracing::error!(%output.status, stdout, stderr, "seed generation failed");
                }
            }
        } else if !stderr.trim().is_empty() {
            tracing::warn!(stdout, stderr, "seed tool reported errors");
        }

        Ok(seed)
    }
}

/// [`SeedBuilder`] that formats the NoCloud volume in-process.
///
/// The result is a bare FAT volume labelled `cidata` holding `user-data` and
/// `meta-data`, which cloud-init's NoCloud datasource picks up like the
/// output of `cloud-localds`.
#[derive(Debug, Clone, Default)]
pub struct FatSeed;

impl SeedBuilder for FatSeed {
    fn build(&self, directory: &Path, user_data: &[u8]) -> anyhow::Result<PathBuf> {
        tracing::debug!("generating seed image");
        let seed = directory.join(SEED_FILE_NAME);
        let mut file = fs_err::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&seed)?;
        file.set_len(FAT_SEED_SIZE)
            .context("failed to set file size")?;
        build_cidata(&mut file, &[("user-data", user_data), ("meta-data", META_DATA)])
            .context("failed to build seed volume")?;
        Ok(seed)
    }
}

fn build_cidata(
    file: &mut (impl std::io::Read + Write + std::io::Seek),
    files: &[(&str, &[u8])],
) -> anyhow::Result<()> {
    // cloud-init looks for a volume label of "cidata"
    fatfs::format_volume(
        &mut *file,
        FormatVolumeOptions::new().volume_label(*b"cidata     "),
    )
    .context("failed to format volume")?;
    let fs = fatfs::FileSystem::new(file, FsOptions::new()).context("failed to open fs")?;
    for (name, data) in files {
        let mut dest = fs
            .root_dir()
            .create_file(name)
            .context("failed to create file")?;
        dest.write_all(data).context("failed to write file")?;
        dest.flush().context("failed to flush file")?;
    }
    fs.unmount().context("failed to unmount fs")?;
    Ok(())
}
