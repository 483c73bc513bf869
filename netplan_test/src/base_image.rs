// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The batch-wide backing image.

use anyhow::Context;
use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;

/// A writable copy of the pristine image that backs every test overlay in a
/// batch.
///
/// The copy is removed by [`BaseImage::release`], or on drop if it was never
/// released explicitly.
#[derive(Debug)]
pub struct BaseImage {
    image_name: String,
    directory: PathBuf,
    path: PathBuf,
    released: bool,
}

impl BaseImage {
    /// Copies `pristine_path` into `results_dir`, keeping its file name.
    ///
    /// e.g. `focal-server-cloudimg-amd64.img` is copied to
    /// `results/20171128091153/focal-server-cloudimg-amd64.img`.
    pub fn create(pristine_path: &Path, results_dir: &Path) -> anyhow::Result<Self> {
        let image_name = pristine_path
            .file_name()
            .context("pristine image path has no file name")?
            .to_string_lossy()
            .into_owned();
        let path = results_dir.join(&image_name);

        tracing::debug!(image_name, path = %path.display(), "creating base image");
        // Construct before copying so a partial copy is cleaned up too.
        let image = Self {
            image_name,
            directory: results_dir.to_owned(),
            path,
            released: false,
        };
        fs_err::copy(pristine_path, &image.path).context("failed to copy pristine image")?;
        Ok(image)
    }

    /// The file name shared by the pristine image and this copy.
    pub fn image_name(&self) -> &str {
        &self.image_name
    }

    /// The batch directory the copy lives in.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Path of the copy.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the copy. Calling this more than once is harmless.
    pub fn release(&mut self) -> anyhow::Result<()> {
        self.released = true;
        remove_if_present(&self.path)
    }
}

impl Drop for BaseImage {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.release() {
            tracing::error!(
                error = e.as_ref() as &dyn std::error::Error,
                "failed to remove base image"
            );
        }
    }
}

/// Removes `path`, treating an already-missing file as success.
pub(crate) fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match fs_err::remove_file(path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "removed file");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
