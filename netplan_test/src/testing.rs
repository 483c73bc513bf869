// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-process stand-ins for the host tools, used by unit tests.

use crate::BaseImage;
use crate::guest::DiskMounter;
use crate::guest::GuestOutput;
use crate::launcher::LaunchOutcome;
use crate::launcher::LaunchRequest;
use crate::launcher::VmLauncher;
use crate::overlay::OverlayBuilder;
use crate::seed::FatSeed;
use crate::test_image::Toolkit;
use parking_lot::Mutex;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tempfile::TempDir;

#[derive(Default)]
struct StubState {
    commands: Vec<String>,
    /// (disk path substring, command prefix) pairs that fail.
    failing: Vec<(Option<String>, String)>,
    guest_logs: Vec<(String, Vec<u8>)>,
    guest_log_subdirs: Vec<String>,
    timed_out: bool,
    overlays_over_live_base: usize,
}

/// [`DiskMounter`] that treats a host directory as the root of every disk.
///
/// Understands the file transfer and listing commands the bridge issues. Any
/// other command is recorded and succeeds.
#[derive(Clone)]
pub struct DirMounter {
    root: PathBuf,
    state: Arc<Mutex<StubState>>,
}

impl DirMounter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_owned(),
            state: Default::default(),
        }
    }

    fn guest_path(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

impl DiskMounter for DirMounter {
    fn exec(
        &self,
        disk: &Path,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<GuestOutput> {
        let command = argv.join(" ");
        {
            let mut state = self.state.lock();
            state.commands.push(command.clone());
            let disk = disk.to_string_lossy();
            let fails = state.failing.iter().any(|(on_disk, cmd)| {
                command.starts_with(cmd.as_str())
                    && on_disk.as_ref().is_none_or(|d| disk.contains(d.as_str()))
            });
            if fails {
                anyhow::bail!("stub failure: {command}");
            }
        }

        let mut output = GuestOutput::default();
        match argv {
            ["sh", "-c", _, "write_data", remote] => {
                let path = self.guest_path(remote);
                if let Some(parent) = path.parent() {
                    fs_err::create_dir_all(parent)?;
                }
                fs_err::write(path, stdin.unwrap_or_default())?;
            }
            ["sh", "-c", _, "read_data", remote] => {
                output.stdout = fs_err::read(self.guest_path(remote))?;
            }
            ["find", dir, "-mindepth", "1", "-maxdepth", "1", "-type", "f", ..] => {
                let mut names = Vec::new();
                for entry in fs_err::read_dir(self.guest_path(dir))? {
                    let entry = entry?;
                    if entry.file_type()?.is_file() {
                        names.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                names.sort();
                for name in names {
                    output.stdout.extend_from_slice(name.as_bytes());
                    output.stdout.push(b'\n');
                }
            }
            _ => {}
        }
        Ok(output)
    }
}

/// [`OverlayBuilder`] that writes a placeholder file and never opens the
/// backing file.
struct StubOverlay {
    state: Arc<Mutex<StubState>>,
}

impl OverlayBuilder for StubOverlay {
    fn create_overlay(&self, backing: &Path, overlay: &Path) -> anyhow::Result<()> {
        if backing.exists() {
            self.state.lock().overlays_over_live_base += 1;
        }
        fs_err::write(overlay, b"QFI\xfb stub overlay")?;
        Ok(())
    }
}

/// [`VmLauncher`] that plays the part of the bootstrap user-data: it writes a
/// console log and replaces the guest log directory with the configured
/// files.
struct StubLauncher {
    guest_root: PathBuf,
    state: Arc<Mutex<StubState>>,
}

impl VmLauncher for StubLauncher {
    fn launch(&self, request: &LaunchRequest<'_>) -> anyhow::Result<LaunchOutcome> {
        assert!(request.overlay.exists());
        assert!(request.seed.exists());
        fs_err::write(request.console_log, b"[    0.000000] Linux version stub\n")?;

        let state = self.state.lock();
        let log_dir = self.guest_root.join("var/tmp");
        if log_dir.exists() {
            fs_err::remove_dir_all(&log_dir)?;
        }
        fs_err::create_dir_all(&log_dir)?;
        for (name, data) in &state.guest_logs {
            fs_err::write(log_dir.join(name), data)?;
        }
        for name in &state.guest_log_subdirs {
            fs_err::create_dir_all(log_dir.join(name))?;
            fs_err::write(log_dir.join(name).join("nested.log"), b"nested")?;
        }

        Ok(if state.timed_out {
            LaunchOutcome::TimedOut
        } else {
            LaunchOutcome::Exited(ExitStatus::from_raw(0))
        })
    }
}

/// Scratch directories plus a stubbed [`Toolkit`] sharing one guest root.
pub struct StubHost {
    guest: TempDir,
    configs: TempDir,
    results: TempDir,
    pristine: TempDir,
    state: Arc<Mutex<StubState>>,
}

impl StubHost {
    pub fn new() -> Self {
        let pristine = tempfile::tempdir().unwrap();
        let image: Vec<u8> = (0..64 * 1024).map(|i| (i % 253) as u8).collect();
        fs_err::write(pristine.path().join("focal.img"), image).unwrap();
        Self {
            guest: tempfile::tempdir().unwrap(),
            configs: tempfile::tempdir().unwrap(),
            results: tempfile::tempdir().unwrap(),
            pristine,
            state: Default::default(),
        }
    }

    pub fn toolkit(&self) -> Toolkit {
        Toolkit::new(
            DirMounter {
                root: self.guest_root().to_owned(),
                state: self.state.clone(),
            },
            StubOverlay {
                state: self.state.clone(),
            },
            FatSeed,
            StubLauncher {
                guest_root: self.guest_root().to_owned(),
                state: self.state.clone(),
            },
        )
    }

    /// Copies the pristine image into the results root.
    pub fn base(&self) -> BaseImage {
        BaseImage::create(&self.pristine(), self.results.path()).unwrap()
    }

    pub fn guest_root(&self) -> &Path {
        self.guest.path()
    }

    pub fn results_root(&self) -> PathBuf {
        self.results.path().to_owned()
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.configs.path().to_owned()
    }

    pub fn pristine(&self) -> PathBuf {
        self.pristine.path().join("focal.img")
    }

    pub fn add_config(&self, name: &str, data: &[u8]) -> PathBuf {
        let path = self.configs.path().join(name);
        fs_err::write(&path, data).unwrap();
        path
    }

    /// Files the guest leaves in its log directory when it boots.
    pub fn set_guest_logs(&self, logs: &[(&str, &[u8])]) {
        self.state.lock().guest_logs = logs
            .iter()
            .map(|(name, data)| (name.to_string(), data.to_vec()))
            .collect();
    }

    /// Directories the guest leaves in its log directory when it boots.
    pub fn set_guest_log_subdirs(&self, names: &[&str]) {
        self.state.lock().guest_log_subdirs = names.iter().map(|n| n.to_string()).collect();
    }

    /// Makes commands starting with `command` fail on every disk.
    pub fn fail_command(&self, command: &str) {
        self.state.lock().failing.push((None, command.to_owned()));
    }

    /// Makes `netplan apply` fail for the test named `test`.
    pub fn fail_apply_for(&self, test: &str) {
        self.state
            .lock()
            .failing
            .push((Some(format!("/{test}/")), "netplan apply".to_owned()));
    }

    pub fn set_timed_out(&self, timed_out: bool) {
        self.state.lock().timed_out = timed_out;
    }

    /// Guest commands issued so far, space-joined.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// How many overlays were created while their backing file existed.
    pub fn overlays_over_live_base(&self) -> usize {
        self.state.lock().overlays_over_live_base
    }
}
