// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Running commands on the host.

use std::io::ErrorKind;
use std::io::Write;
use std::process::Command;
use std::process::ExitStatus;
use std::process::Stdio;
use std::time::Instant;
use thiserror::Error;

/// Error running command
#[derive(Error, Debug)]
pub enum CommandError {
    /// failed to launch command
    #[error("failed to launch command")]
    Launch(#[from] std::io::Error),
    /// command exited with non-zero status
    #[error("command exited with non-zero status ({0}): {1}")]
    Command(ExitStatus, String),
    /// command output is not utf-8
    #[error("command output is not utf-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// The captured result of a host command.
#[derive(Debug)]
pub struct HostOutput {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Raw standard output.
    pub stdout: Vec<u8>,
    /// Raw standard error.
    pub stderr: Vec<u8>,
}

impl HostOutput {
    /// Standard output, decoded lossily.
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Standard error, decoded lossily.
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Fails if the command exited with a non-zero status.
    pub fn check(self) -> Result<Self, CommandError> {
        if !self.status.success() {
            return Err(CommandError::Command(
                self.status,
                self.stderr_lossy().trim().to_owned(),
            ));
        }
        Ok(self)
    }
}

/// Run a command on the host, optionally feeding `stdin` to it, and capture
/// its output.
///
/// A non-zero exit status is not an error here; see [`HostOutput::check`].
pub fn run_host_cmd(mut cmd: Command, stdin: Option<&[u8]>) -> Result<HostOutput, CommandError> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    });

    let cmd_debug = format!("{cmd:?}");
    tracing::debug!(cmd = cmd_debug, "executing command");

    let start = Instant::now();
    let mut child = cmd.spawn()?;
    let output = match (stdin, child.stdin.take()) {
        (Some(data), Some(mut pipe)) => std::thread::scope(|s| {
            // Feed stdin from a separate thread so a child that fills its
            // stdout pipe before draining stdin cannot deadlock us.
            let writer = s.spawn(move || match pipe.write_all(data) {
                Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
                r => r,
            });
            let output = child.wait_with_output();
            let written = writer
                .join()
                .unwrap_or_else(|_| Err(std::io::Error::other("stdin writer panicked")));
            let output = output?;
            written?;
            Ok::<_, std::io::Error>(output)
        })?,
        _ => child.wait_with_output()?,
    };
    let time_elapsed = start.elapsed();

    let output = HostOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    };
    tracing::debug!(
        cmd = cmd_debug,
        stdout_len = output.stdout.len(),
        stderr_str = output.stderr_lossy(),
        "command exited in {:.3}s with status {}",
        time_elapsed.as_secs_f64(),
        output.status
    );

    Ok(output)
}

/// Run a command on the host, fail on a non-zero exit, and return its
/// trimmed standard output.
pub fn run_host_cmd_checked(cmd: Command, stdin: Option<&[u8]>) -> Result<String, CommandError> {
    let output = run_host_cmd(cmd, stdin)?.check()?;
    Ok(String::from_utf8(output.stdout)?.trim().to_owned())
}
