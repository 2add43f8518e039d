//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config_file::DEFAULT_CONFIG_PATH;
use crate::hook::HookRequest;
use crate::types::{GuestKind, Phase};

/// Guest kind as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Vm,
    Ct,
}

impl From<KindArg> for GuestKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Vm => GuestKind::Vm,
            KindArg::Ct => GuestKind::Container,
        }
    }
}

/// Mirror LLDP frames between a guest NIC and its physical interface
#[derive(Parser, Debug)]
#[command(name = "lldp-mirror")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Numeric guest id
    pub guest_id: u32,

    /// Lifecycle phase (activate, deactivate, post-start, pre-stop)
    pub phase: String,

    /// Configuration file
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Guest kind; detected from the hypervisor config when omitted
    #[arg(long, value_enum)]
    pub kind: Option<KindArg>,

    /// Mirror file to read instead of `<mirror_dir>/<guest>.conf`
    #[arg(long)]
    pub mirror_file: Option<PathBuf>,

    /// State directory overriding the configured one
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Default log filter for the verbosity
    pub fn log_level(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    pub fn request(&self) -> HookRequest {
        HookRequest {
            guest_id: self.guest_id,
            phase: Phase::parse(&self.phase),
            kind: self.kind.map(GuestKind::from),
            mirror_file: self.mirror_file.clone(),
            state_dir: self.state_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_args_are_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_minimal() {
        let args = Args::try_parse_from(["lldp-mirror", "100", "post-start"]).unwrap();
        let request = args.request();
        assert_eq!(request.guest_id, 100);
        assert_eq!(request.phase, Phase::Activate);
        assert_eq!(request.kind, None);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.log_level(), "info");
    }

    #[test]
    fn test_parse_overrides() {
        let args = Args::try_parse_from([
            "lldp-mirror",
            "-vv",
            "--kind",
            "ct",
            "--state-dir",
            "/tmp/state",
            "--mirror-file",
            "/tmp/m.conf",
            "205",
            "pre-stop",
        ])
        .unwrap();
        let request = args.request();
        assert_eq!(request.kind, Some(GuestKind::Container));
        assert_eq!(request.phase, Phase::Deactivate);
        assert_eq!(request.state_dir, Some(PathBuf::from("/tmp/state")));
        assert_eq!(args.log_level(), "trace");
    }

    #[test]
    fn test_unknown_phase_is_accepted() {
        let args = Args::try_parse_from(["lldp-mirror", "100", "pre-start"]).unwrap();
        assert_eq!(args.request().phase, Phase::Other("pre-start".to_string()));
    }

    #[test]
    fn test_rejects_non_numeric_guest() {
        assert!(Args::try_parse_from(["lldp-mirror", "abc", "activate"]).is_err());
    }
}
