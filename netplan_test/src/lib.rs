// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A VM-backed functional test harness for netplan.
//!
//! Each test case is a netplan YAML file. For every case, a copy-on-write
//! overlay is derived from a batch-wide base image, the configuration is
//! written into the powered-off guest disk, the guest is booted once under
//! QEMU with a NoCloud seed, and the guest's log directory is pulled back
//! into the results tree once the VM has stopped.

#![forbid(unsafe_code)]

pub mod base_image;
pub mod command;
pub mod guest;
pub mod image_stream;
pub mod launcher;
pub mod overlay;
pub mod results;
pub mod runner;
pub mod seed;
pub mod test_image;
#[cfg(test)]
mod testing;
mod tracing;

pub use crate::tracing::*;
pub use base_image::BaseImage;
pub use command::CommandError;
pub use command::HostOutput;
pub use command::run_host_cmd;
pub use command::run_host_cmd_checked;
pub use guest::DiskMounter;
pub use guest::GuestFileBridge;
pub use launcher::LaunchOutcome;
pub use launcher::VmLauncher;
pub use overlay::OverlayBuilder;
pub use seed::SeedBuilder;
pub use test_image::TestImage;
pub use test_image::Toolkit;

/// Path inside the guest that the test configuration is written to.
pub const GUEST_NETPLAN_PATH: &str = "/etc/netplan/netplan.yaml";
/// Guest directory whose entries are collected after the VM shuts down.
pub const GUEST_LOG_DIR: &str = "/var/tmp/";
/// File name of the per-test overlay disk.
pub const OVERLAY_FILE_NAME: &str = "image.qcow";
/// File name of the per-test NoCloud seed disk.
pub const SEED_FILE_NAME: &str = "seed.img";
/// File name of the guest serial console log.
pub const CONSOLE_LOG_FILE_NAME: &str = "console.log";
