// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading and writing files inside a powered-off guest disk.
//!
//! Every operation is a complete mount, chroot exec, unmount cycle performed
//! by a [`DiskMounter`]. Nothing stays mounted between calls.

use crate::command::CommandError;
use crate::command::HostOutput;
use crate::command::run_host_cmd;
use anyhow::Context;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use thiserror::Error;

/// Errors from guest disk operations.
#[derive(Error, Debug)]
pub enum GuestError {
    /// another operation currently has the disk mounted
    #[error("disk {0} is already mounted by another operation")]
    DiskBusy(PathBuf),
    /// the mount helper or the chrooted command failed
    #[error("guest command `{command}` failed on {disk}")]
    Exec {
        /// The disk that was mounted.
        disk: PathBuf,
        /// The command run inside the chroot.
        command: String,
        /// The underlying failure.
        #[source]
        source: CommandError,
    },
}

/// Output of a command run inside a mounted guest disk.
#[derive(Debug, Default, Clone)]
pub struct GuestOutput {
    /// Raw standard output.
    pub stdout: Vec<u8>,
    /// Raw standard error.
    pub stderr: Vec<u8>,
}

impl GuestOutput {
    /// Standard output, decoded lossily.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Mounts a disk image offline and runs a command chrooted into it.
pub trait DiskMounter {
    /// Mounts `disk`, runs `argv` inside the mounted root with `stdin`
    /// supplied as its input, and unmounts again. Fails if the mount or the
    /// command fails.
    fn exec(&self, disk: &Path, argv: &[&str], stdin: Option<&[u8]>)
    -> anyhow::Result<GuestOutput>;
}

impl<T: DiskMounter + ?Sized> DiskMounter for Box<T> {
    fn exec(
        &self,
        disk: &Path,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<GuestOutput> {
        (**self).exec(disk, argv, stdin)
    }
}

/// [`DiskMounter`] backed by cloud-image-utils' `mount-image-callback`.
///
/// The guest sees the host's system mounts and resolv.conf, so commands that
/// need DNS or `/proc` work inside the chroot.
#[derive(Debug, Clone)]
pub struct MountImageCallback {
    /// Run the helper through `sudo`. Mounting requires root.
    pub use_sudo: bool,
}

impl Default for MountImageCallback {
    fn default() -> Self {
        Self { use_sudo: true }
    }
}

impl MountImageCallback {
    fn command(&self, disk: &Path, argv: &[&str]) -> Command {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("mount-image-callback");
            cmd
        } else {
            Command::new("mount-image-callback")
        };
        cmd.args(["--system-mounts", "--system-resolvconf"])
            .arg(disk)
            .args(["--", "chroot", "_MOUNTPOINT_"])
            .args(argv);
        cmd
    }
}

impl DiskMounter for MountImageCallback {
    fn exec(
        &self,
        disk: &Path,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<GuestOutput> {
        let output = run_host_cmd(self.command(disk, argv), stdin)
            .and_then(HostOutput::check)
            .map_err(|source| GuestError::Exec {
                disk: disk.to_owned(),
                command: argv.join(" "),
                source,
            })?;
        Ok(GuestOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// File transfer and command execution against offline guest disks.
pub struct GuestFileBridge<M> {
    mounter: M,
    busy: Mutex<HashSet<PathBuf>>,
}

impl<M: DiskMounter> GuestFileBridge<M> {
    /// Creates a bridge that mounts disks with `mounter`.
    pub fn new(mounter: M) -> Self {
        Self {
            mounter,
            busy: Mutex::new(HashSet::new()),
        }
    }

    /// Writes the contents of the host file `local_path` to `remote_path`
    /// inside `disk`.
    pub fn push(&self, local_path: &Path, remote_path: &str, disk: &Path) -> anyhow::Result<()> {
        tracing::debug!(local = %local_path.display(), remote_path, "pushing file");
        let data = fs_err::read(local_path)?;
        self.mounted_exec(
            disk,
            &["sh", "-c", r#"exec cat >"$1""#, "write_data", remote_path],
            Some(&data),
        )
        .with_context(|| format!("failed to push {}", local_path.display()))?;
        Ok(())
    }

    /// Copies `remote_path` inside `disk` to the host file `local_path`,
    /// byte for byte.
    pub fn pull(&self, remote_path: &str, local_path: &Path, disk: &Path) -> anyhow::Result<()> {
        tracing::debug!(remote_path, local = %local_path.display(), "pulling file");
        let output = self
            .mounted_exec(
                disk,
                &["sh", "-c", r#"exec cat "$1""#, "read_data", remote_path],
                None,
            )
            .with_context(|| format!("failed to pull {remote_path}"))?;
        fs_err::write(local_path, output.stdout)?;
        Ok(())
    }

    /// Runs `argv` inside `disk`.
    pub fn exec(&self, argv: &[&str], disk: &Path) -> anyhow::Result<GuestOutput> {
        self.mounted_exec(disk, argv, None)
    }

    /// Lists the names of the regular files directly inside the guest
    /// directory `dir`, sorted. Subdirectories and other special entries are
    /// skipped.
    pub fn list_files(&self, dir: &str, disk: &Path) -> anyhow::Result<Vec<String>> {
        let output = self
            .mounted_exec(
                disk,
                &[
                    "find", dir, "-mindepth", "1", "-maxdepth", "1", "-type", "f", "-printf",
                    r"%f\n",
                ],
                None,
            )
            .with_context(|| format!("failed to list {dir}"))?;
        let mut files: Vec<String> = output
            .stdout_lossy()
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();
        files.sort();
        Ok(files)
    }

    fn mounted_exec(
        &self,
        disk: &Path,
        argv: &[&str],
        stdin: Option<&[u8]>,
    ) -> anyhow::Result<GuestOutput> {
        let _claim = self.claim(disk)?;
        self.mounter.exec(disk, argv, stdin)
    }

    fn claim(&self, disk: &Path) -> Result<DiskClaim<'_>, GuestError> {
        let disk = disk.to_owned();
        if !self.busy.lock().insert(disk.clone()) {
            return Err(GuestError::DiskBusy(disk));
        }
        Ok(DiskClaim {
            busy: &self.busy,
            disk,
        })
    }
}

/// Marks a disk as mounted until dropped.
struct DiskClaim<'a> {
    busy: &'a Mutex<HashSet<PathBuf>>,
    disk: PathBuf,
}

impl Drop for DiskClaim<'_> {
    fn drop(&mut self) {
        self.busy.lock().remove(&self.disk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DirMounter;

    #[test]
    fn mount_image_callback_command_line() {
        let cmd = MountImageCallback::default()
            .command(Path::new("/r/t/image.qcow"), &["netplan", "apply"]);
        let args: Vec<_> = cmd.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(cmd.get_program(), "sudo");
        assert_eq!(
            args,
            [
                "mount-image-callback",
                "--system-mounts",
                "--system-resolvconf",
                "/r/t/image.qcow",
                "--",
                "chroot",
                "_MOUNTPOINT_",
                "netplan",
                "apply"
            ]
        );

        let cmd = MountImageCallback { use_sudo: false }.command(Path::new("/d"), &["ls"]);
        assert_eq!(cmd.get_program(), "mount-image-callback");
    }

    #[test]
    fn push_then_pull_is_byte_identical() {
        let guest = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let bridge = GuestFileBridge::new(DirMounter::new(guest.path()));
        let disk = host.path().join("image.qcow");

        let config: Vec<u8> = (0..12 * 1024).map(|i| (i % 251) as u8).collect();
        let local = host.path().join("basic.yaml");
        fs_err::write(&local, &config).unwrap();

        bridge.push(&local, "/etc/netplan/netplan.yaml", &disk).unwrap();
        assert_eq!(
            fs_err::read(guest.path().join("etc/netplan/netplan.yaml")).unwrap(),
            config
        );

        let pulled = host.path().join("pulled.yaml");
        bridge.pull("/etc/netplan/netplan.yaml", &pulled, &disk).unwrap();
        assert_eq!(fs_err::read(pulled).unwrap(), config);
    }

    #[test]
    fn list_files_skips_directories() {
        let guest = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(guest.path().join("var/tmp/cloud-init")).unwrap();
        fs_err::create_dir_all(guest.path().join("var/tmp/systemd-private-1234")).unwrap();
        fs_err::write(guest.path().join("var/tmp/b.log"), b"b").unwrap();
        fs_err::write(guest.path().join("var/tmp/a.log"), b"a").unwrap();
        let bridge = GuestFileBridge::new(DirMounter::new(guest.path()));

        let entries = bridge.list_files("/var/tmp/", Path::new("image.qcow")).unwrap();
        assert_eq!(entries, ["a.log", "b.log"]);
    }

    #[test]
    fn errors_name_the_disk() {
        let err = GuestError::DiskBusy(PathBuf::from("/r/basic/image.qcow"));
        assert_eq!(
            err.to_string(),
            "disk /r/basic/image.qcow is already mounted by another operation"
        );
    }

    #[test]
    fn failures_propagate() {
        let guest = tempfile::tempdir().unwrap();
        let bridge = GuestFileBridge::new(DirMounter::new(guest.path()));
        let host = tempfile::tempdir().unwrap();
        let err = bridge
            .pull("/does/not/exist", &host.path().join("x"), Path::new("image.qcow"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("/does/not/exist"));
        assert!(!host.path().join("x").exists());
    }

    #[test]
    fn concurrent_mount_of_same_disk_is_refused() {
        let guest = tempfile::tempdir().unwrap();
        let bridge = GuestFileBridge::new(DirMounter::new(guest.path()));
        let disk = Path::new("image.qcow");

        let claim = bridge.claim(disk).unwrap();
        assert!(matches!(
            bridge.exec(&["true"], disk).unwrap_err().downcast::<GuestError>(),
            Ok(GuestError::DiskBusy(_))
        ));
        // Other disks are unaffected.
        bridge.exec(&["true"], Path::new("other.qcow")).unwrap();
        drop(claim);
        bridge.exec(&["true"], disk).unwrap();
    }
}
