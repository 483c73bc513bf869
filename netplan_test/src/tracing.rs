// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::Path;
use tracing::Span;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

/// Logging context handed to each component at construction.
///
/// Carries the span that events from the component are attributed to.
#[derive(Debug, Clone)]
pub struct LogSource {
    span: Span,
}

impl LogSource {
    /// Creates the batch-level log source for the batch in `results_dir`.
    pub fn new(results_dir: &Path) -> Self {
        Self {
            span: tracing::info_span!("batch", dir = %results_dir.display()),
        }
    }

    /// Creates a child log source for a single test case.
    pub fn for_test(&self, test_name: &str) -> Self {
        Self {
            span: tracing::info_span!(parent: &self.span, "test", name = test_name),
        }
    }

    /// The span events should be recorded under.
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Logs the final result of a test case.
    pub fn log_test_result<T>(&self, name: &str, r: &anyhow::Result<T>) {
        let _enter = self.span.enter();
        match r {
            Ok(_) => tracing::info!(name, "test passed"),
            Err(err) => tracing::error!(
                name,
                error = err.as_ref() as &dyn std::error::Error,
                "test failed"
            ),
        }
    }
}

/// Installs the process-wide tracing subscriber.
///
/// Only the binary entry point should call this. `RUST_LOG` overrides the
/// default level, which is `debug` when `verbose` is set and `info`
/// otherwise.
pub fn try_init_tracing(verbose: bool) -> anyhow::Result<()> {
    let default_level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install tracing subscriber: {err}"))
}
