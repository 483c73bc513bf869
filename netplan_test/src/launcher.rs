// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Booting the guest under QEMU with a bounded execution window.

use crate::OVERLAY_FILE_NAME;
use crate::SEED_FILE_NAME;
use anyhow::Context;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Child;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

/// How long the guest may run before it is terminated.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
/// How long an interrupted guest gets to exit before it is killed.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// MAC addresses of the guest's four NICs, in PCI order.
const NIC_MACS: [&str; 4] = [
    "52:54:00:12:34:04",
    "52:54:00:12:34:05",
    "52:54:00:12:34:06",
    "52:54:00:12:34:07",
];

/// The disks and log path for a single boot.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    /// The primary boot disk.
    pub overlay: &'a Path,
    /// The NoCloud seed disk.
    pub seed: &'a Path,
    /// Where the guest serial console is written.
    pub console_log: &'a Path,
}

/// How a launched guest stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    /// The guest powered off on its own.
    Exited(ExitStatus),
    /// The guest ran past its deadline and was terminated.
    TimedOut,
}

impl LaunchOutcome {
    /// Whether the guest had to be terminated.
    pub fn timed_out(&self) -> bool {
        matches!(self, Self::TimedOut)
    }
}

/// Boots a guest and blocks until it has stopped.
pub trait VmLauncher {
    /// Boots the guest described by `request`. When this returns, no process
    /// started for the guest is still running.
    fn launch(&self, request: &LaunchRequest<'_>) -> anyhow::Result<LaunchOutcome>;
}

/// Emulator settings.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// The emulator binary.
    pub emulator: String,
    /// Use KVM acceleration.
    pub enable_kvm: bool,
    /// Guest memory, in QEMU's `-m` syntax.
    pub memory: String,
    /// Virtual CPU count.
    pub cpus: u32,
    /// Wall-clock budget for the boot.
    pub timeout: Duration,
    /// Time allowed between the interrupt and the kill on overrun.
    pub kill_grace: Duration,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            emulator: "qemu-system-x86_64".into(),
            enable_kvm: true,
            memory: "2G".into(),
            cpus: 2,
            timeout: DEFAULT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// [`VmLauncher`] that runs QEMU directly.
#[derive(Debug, Clone, Default)]
pub struct Qemu {
    config: LaunchConfig,
}

impl Qemu {
    /// Creates a launcher with the given settings.
    pub fn new(config: LaunchConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &LaunchRequest<'_>) -> Command {
        let LaunchConfig {
            emulator,
            enable_kvm,
            memory,
            cpus,
            timeout: _,
            kill_grace: _,
        } = &self.config;

        let mut cmd = Command::new(emulator);
        if *enable_kvm {
            cmd.arg("-enable-kvm");
        }
        cmd.args(["-vnc", "none", "-nographic", "-serial"])
            .arg(format!("file:{}", qemu_path(request.console_log)))
            .args(["-m", memory.as_str(), "-smp", cpus.to_string().as_str()]);

        // storage
        cmd.args(["-device", "virtio-scsi-pci,id=virtio-scsi"])
            .arg("-drive")
            .arg(format!(
                "file={},id=disk00,if=none,format=qcow2,index=0,cache=unsafe",
                qemu_path(request.overlay)
            ))
            .arg("-device")
            .arg(format!("virtio-blk,drive=disk00,serial={OVERLAY_FILE_NAME}"))
            .arg("-drive")
            .arg(format!(
                "file={},id=disk01,if=none,format=raw,index=1,cache=unsafe",
                qemu_path(request.seed)
            ))
            .arg("-device")
            .arg(format!("virtio-blk,drive=disk01,serial={SEED_FILE_NAME}"));

        // network
        for (i, mac) in NIC_MACS.iter().enumerate() {
            cmd.arg("-device")
                .arg(format!("virtio-net-pci,netdev=net{i:02},mac={mac}"))
                .arg("-netdev")
                .arg(format!("type=user,id=net{i:02}"));
        }
        cmd
    }
}

/// Renders `path` for a QEMU option value, where `,` separates options and a
/// literal comma is written `,,`.
fn qemu_path(path: &Path) -> String {
    path.display().to_string().replace(',', ",,")
}

impl VmLauncher for Qemu {
    fn launch(&self, request: &LaunchRequest<'_>) -> anyhow::Result<LaunchOutcome> {
        tracing::debug!(
            overlay = %request.overlay.display(),
            seed = %request.seed.display(),
            timeout_secs = self.config.timeout.as_secs(),
            "launching image"
        );
        run_with_deadline(
            self.command(request),
            self.config.timeout,
            self.config.kill_grace,
        )
        .context("failed to run emulator")
    }
}

/// Runs `cmd` in a new process group and waits up to `timeout` for it to
/// exit.
///
/// On overrun the whole group is sent SIGINT, then SIGKILL if it is still
/// alive after `grace`. Anything left in the group once the leader has been
/// reaped is killed as well, and this waits briefly for the group to empty.
pub fn run_with_deadline(
    mut cmd: Command,
    timeout: Duration,
    grace: Duration,
) -> anyhow::Result<LaunchOutcome> {
    cmd.process_group(0)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to launch {:?}", cmd.get_program()))?;
    let pgid = Pid::from_raw(child.id() as i32);
    let stderr_task = child.stderr.take().map(|mut stderr| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf);
            buf
        })
    });

    let start = Instant::now();
    let outcome = match wait_until(&mut child, start + timeout) {
        Ok(Some(status)) => LaunchOutcome::Exited(status),
        Ok(None) => {
            tracing::warn!(
                timeout_secs = timeout.as_secs(),
                "guest did not shut down in time, interrupting process group"
            );
            signal_group(pgid, Signal::SIGINT);
            if wait_until(&mut child, Instant::now() + grace)?.is_none() {
                tracing::warn!("guest ignored interrupt, killing process group");
                signal_group(pgid, Signal::SIGKILL);
                child.wait()?;
            }
            LaunchOutcome::TimedOut
        }
        Err(err) => {
            signal_group(pgid, Signal::SIGKILL);
            let _ = child.wait();
            return Err(err.into());
        }
    };
    signal_group(pgid, Signal::SIGKILL);
    wait_group_exit(pgid, GROUP_EXIT_TIMEOUT);

    if let Some(stderr) = stderr_task.and_then(|task| task.join().ok()) {
        if !stderr.is_empty() {
            tracing::debug!(stderr = %String::from_utf8_lossy(&stderr), "emulator stderr");
        }
    }
    tracing::debug!(
        ?outcome,
        "guest stopped after {:.1}s",
        start.elapsed().as_secs_f64()
    );
    Ok(outcome)
}

/// Polls `child` until it exits or `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) -> std::io::Result<Option<ExitStatus>> {
    const POLL_INTERVAL: Duration = Duration::from_millis(50);
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
}

/// How long to wait for killed group members to disappear.
const GROUP_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Waits until no process in `pgid` remains, or `timeout` passes.
///
/// Orphaned members are reaped by init, so they can linger briefly as
/// zombies after the kill.
fn wait_group_exit(pgid: Pid, timeout: Duration) {
    const POLL_INTERVAL: Duration = Duration::from_millis(10);
    let deadline = Instant::now() + timeout;
    loop {
        match killpg(pgid, None) {
            Err(Errno::ESRCH) => return,
            _ if Instant::now() >= deadline => {
                tracing::debug!(%pgid, "process group still present after kill");
                return;
            }
            _ => std::thread::sleep(POLL_INTERVAL),
        }
    }
}

fn signal_group(pgid: Pid, signal: Signal) {
    match killpg(pgid, signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => tracing::warn!(%err, ?signal, "failed to signal process group"),
    }
}
