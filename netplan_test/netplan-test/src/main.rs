// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Command-line entry point for the netplan VM test harness.

use clap::Args;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use netplan_test::Toolkit;
use netplan_test::image_stream::MirrorConfig;
use netplan_test::launcher::LaunchConfig;
use netplan_test::results::BatchReport;
use netplan_test::runner;
use netplan_test::runner::BatchOptions;
use netplan_test::seed::CloudLocalds;
use netplan_test::seed::FatSeed;
use netplan_test::seed::SeedErrorPolicy;
use netplan_test::try_init_tracing;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Exit code for a batch that could not run.
const EXIT_BATCH_FAILED: u8 = 1;
/// Exit code for a batch that ran with failing tests.
const EXIT_TESTS_FAILED: u8 = 2;

/// Functional tests for netplan, run in disposable cloud-image VMs.
#[derive(Parser)]
#[clap(name = "netplan-test")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Collect results, then verify them
    Run(CollectArgs),
    /// Boot a VM per configuration and collect the guest's logs
    Collect(CollectArgs),
    /// Verify a results directory
    Verify {
        /// Results directory of the batch to verify.
        #[clap(long)]
        results: PathBuf,
        /// Enable debug logging.
        #[clap(long)]
        verbose: bool,
    },
}

impl Command {
    fn verbose(&self) -> bool {
        match self {
            Command::Run(args) | Command::Collect(args) => args.verbose,
            Command::Verify { verbose, .. } => *verbose,
        }
    }
}

#[derive(Args)]
struct CollectArgs {
    /// Directory to store results in. Defaults to `results`.
    #[clap(long)]
    results: Option<PathBuf>,
    /// Configuration to test. May be repeated. Defaults to every `*.yaml`
    /// file in the configs directory.
    #[clap(long = "test")]
    tests: Vec<PathBuf>,
    /// Ubuntu release to test. Defaults to the latest release.
    #[clap(long, conflicts_with = "image")]
    release: Option<String>,
    /// Pristine image to test with instead of a mirrored one.
    #[clap(long)]
    image: Option<PathBuf>,
    /// Enable debug logging.
    #[clap(long)]
    verbose: bool,

    /// Directory searched for configurations.
    #[clap(long, env = "NETPLAN_TEST_CONFIGS", default_value = "configs")]
    configs: PathBuf,
    /// Image stream to mirror pristine images from.
    #[clap(
        long,
        env = "NETPLAN_TEST_MIRROR_URL",
        default_value = "https://cloud-images.ubuntu.com/daily"
    )]
    mirror_url: String,
    /// Local mirror directory.
    #[clap(long, env = "NETPLAN_TEST_MIRROR_DIR", default_value = "/srv/netplan/")]
    mirror_dir: PathBuf,
    /// Keyring that signs the image stream.
    #[clap(
        long,
        env = "NETPLAN_TEST_KEYRING",
        default_value = "/usr/share/keyrings/ubuntu-cloudimage-keyring.gpg"
    )]
    keyring: PathBuf,
    /// Seconds a guest may run before it is terminated.
    #[clap(long, env = "NETPLAN_TEST_TIMEOUT", default_value_t = 300)]
    timeout: u64,
    /// What to do when seed generation reports an error.
    #[clap(long, value_enum, env = "NETPLAN_TEST_SEED_POLICY", default_value_t)]
    seed_policy: SeedErrorPolicy,
    /// How seed disks are built.
    #[clap(long, value_enum, env = "NETPLAN_TEST_SEED_BUILDER", default_value_t)]
    seed_builder: SeedBuilderKind,
    /// Run the disk mount helper without sudo.
    #[clap(long, env = "NETPLAN_TEST_NO_SUDO")]
    no_sudo: bool,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum SeedBuilderKind {
    /// `cloud-localds` from cloud-image-utils
    #[default]
    CloudLocalds,
    /// An in-process FAT volume
    Fat,
}

impl CollectArgs {
    fn options(&self) -> BatchOptions {
        BatchOptions {
            results_root: self.results.clone(),
            tests: self.tests.clone(),
            configs_dir: self.configs.clone(),
            release: self.release.clone(),
            image: self.image.clone(),
            mirror: MirrorConfig {
                url: self.mirror_url.clone(),
                directory: self.mirror_dir.clone(),
                keyring: self.keyring.clone(),
            },
        }
    }

    fn toolkit(&self) -> Toolkit {
        let launch = LaunchConfig {
            timeout: Duration::from_secs(self.timeout),
            ..Default::default()
        };
        let use_sudo = !self.no_sudo;
        match self.seed_builder {
            SeedBuilderKind::CloudLocalds => Toolkit::host(
                launch,
                CloudLocalds {
                    policy: self.seed_policy,
                },
                use_sudo,
            ),
            SeedBuilderKind::Fat => Toolkit::host(launch, FatSeed, use_sudo),
        }
    }
}

fn exit_code(report: &BatchReport) -> ExitCode {
    if report.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_TESTS_FAILED)
    }
}

fn do_main(command: Command) -> anyhow::Result<ExitCode> {
    let code = match command {
        Command::Run(args) => exit_code(&runner::run(&args.options(), &args.toolkit())?),
        Command::Collect(args) => exit_code(&runner::collect(&args.options(), &args.toolkit())?),
        Command::Verify { results, .. } => match runner::verify(&results)? {
            Some(report) => exit_code(&report),
            None => ExitCode::SUCCESS,
        },
    };
    Ok(code)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = try_init_tracing(cli.command.verbose()) {
        eprintln!("error: {err:#}");
        return ExitCode::from(EXIT_BATCH_FAILED);
    }

    match do_main(cli.command) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(
                error = err.as_ref() as &dyn std::error::Error,
                "batch failed"
            );
            ExitCode::from(EXIT_BATCH_FAILED)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }

    #[test]
    fn release_and_image_conflict() {
        let result = Cli::try_parse_from([
            "netplan-test",
            "collect",
            "--release",
            "focal",
            "--image",
            "focal.img",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn collect_options() {
        let cli = Cli::try_parse_from([
            "netplan-test",
            "run",
            "--test",
            "configs/vlan.yaml",
            "--test",
            "configs/basic.yaml",
            "--image",
            "focal.img",
            "--seed-policy",
            "warn",
            "--seed-builder",
            "fat",
            "--timeout",
            "60",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        let options = args.options();
        assert_eq!(options.tests.len(), 2);
        assert_eq!(options.image, Some(PathBuf::from("focal.img")));
        assert_eq!(args.seed_policy, SeedErrorPolicy::Warn);
        assert!(matches!(args.seed_builder, SeedBuilderKind::Fat));
        assert_eq!(args.timeout, 60);
        assert!(!args.verbose);
    }

    #[test]
    fn verify_requires_results() {
        assert!(Cli::try_parse_from(["netplan-test", "verify"]).is_err());
        let cli = Cli::try_parse_from(["netplan-test", "verify", "--results", "r/1", "--verbose"])
            .unwrap();
        assert!(cli.command.verbose());
    }
}
