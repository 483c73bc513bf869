// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Copy-on-write overlay disks.

use crate::command::run_host_cmd;
use anyhow::Context;
use std::path::Path;
use std::process::Command;

/// Creates copy-on-write overlays on top of a backing disk.
pub trait OverlayBuilder {
    /// Creates `overlay` with `backing` as its backing file. Writes to the
    /// overlay must never reach `backing`.
    fn create_overlay(&self, backing: &Path, overlay: &Path) -> anyhow::Result<()>;
}

/// Creates qcow2 overlays with `qemu-img`.
#[derive(Debug, Clone)]
pub struct QemuImg {
    /// Format of the backing file, passed as `-F`. Cloud images are qcow2.
    pub backing_format: Option<String>,
}

impl Default for QemuImg {
    fn default() -> Self {
        Self {
            backing_format: Some("qcow2".into()),
        }
    }
}

impl QemuImg {
    fn command(&self, backing: &Path, overlay: &Path) -> Command {
        let mut cmd = Command::new("qemu-img");
        cmd.args(["create", "-f", "qcow2", "-b"]).arg(backing);
        if let Some(format) = &self.backing_format {
            cmd.args(["-F", format.as_str()]);
        }
        cmd.arg(overlay);
        cmd
    }
}

impl OverlayBuilder for QemuImg {
    fn create_overlay(&self, backing: &Path, overlay: &Path) -> anyhow::Result<()> {
        // qemu-img records the backing path verbatim, so it must be absolute
        // for the overlay to be usable from any working directory.
        let backing = std::path::absolute(backing).context("failed to resolve backing path")?;
        let overlay = std::path::absolute(overlay).context("failed to resolve overlay path")?;
        tracing::debug!(backing = %backing.display(), overlay = %overlay.display(), "creating overlay");
        run_host_cmd(self.command(&backing, &overlay), None)?
            .check()
            .context("qemu-img failed to create overlay")?;
        Ok(())
    }
}
