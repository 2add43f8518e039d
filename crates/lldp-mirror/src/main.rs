//! lldp-mirror entry point
//!
//! Invoked by the hypervisor hook script with a guest id and a phase.
//! Exit status: 0 when every pair reconciled (or there was nothing to do),
//! 1 when at least one pair failed or the run stopped on a non-fatal
//! error, 2 on fatal errors (environment, privilege, unknown guest,
//! invalid configuration).

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use lldp_mirror::cli::Args;
use lldp_mirror::config_file::MirrorConfig;
use lldp_mirror::hook;
use lldp_mirror::types::Phase;
use lldp_mirror_common::{CommandRunner, MirrorError, ShellRunner};
use nix::unistd::geteuid;
use tracing::{error, warn};

const EXIT_PAIR_FAILED: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level());

    match run(&args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(EXIT_PAIR_FAILED),
        Err(e) => {
            let code = exit_code_for(&e);
            error!(
                error = %format!("{:#}", e),
                fatal = code == EXIT_FATAL,
                "lldp-mirror: run aborted"
            );
            ExitCode::from(code)
        }
    }
}

/// Exit status for an error that ended the run
///
/// Errors outside the mirror taxonomy (privilege check, setup) are fatal.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.chain().find_map(|cause| cause.downcast_ref::<MirrorError>()) {
        Some(mirror) if !mirror.is_fatal() => EXIT_PAIR_FAILED,
        _ => EXIT_FATAL,
    }
}

fn init_logging(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .compact(),
        )
        .init();
}

/// Returns whether every pair reconciled
async fn run(args: &Args) -> Result<bool> {
    let request = args.request();
    if matches!(request.phase, Phase::Other(_)) {
        // Unknown phases never touch the system, so no privilege is needed
        let config = MirrorConfig::default();
        hook::run(Arc::new(ShellRunner), &config, &request).await?;
        return Ok(true);
    }

    if !geteuid().is_root() {
        bail!("lldp-mirror must run as root (effective uid {})", geteuid());
    }

    let config = MirrorConfig::load_or_default(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
    let report = hook::run(runner, &config, &request)
        .await
        .with_context(|| format!("guest {} {}", request.guest_id, request.phase))?;

    for (mirror, e) in &report.failed {
        warn!(guest = request.guest_id, mirror = %mirror, error = %e, "Mirror not reconciled");
    }
    Ok(report.is_success())
}
