//! Daemon command line.

use std::path::PathBuf;

use clap::Parser;

/// Arguments the launcher passes, plus `--config-file` for standalone use.
#[derive(Parser, Debug, Clone, Default, PartialEq, Eq)]
#[command(name = "bus-daemon", version, about = "local message bus daemon")]
pub struct DaemonArgs {
    /// Take the busconfig XML payload from the embedding service (stdin for the binary).
    #[arg(long)]
    pub config_service: bool,

    /// Stay in the foreground. The daemon never forks; accepted for compatibility.
    #[arg(long)]
    pub nofork: bool,

    /// Disable the Bluetooth transport. There is none; accepted for compatibility.
    #[arg(long)]
    pub no_bt: bool,

    /// Read the busconfig XML payload from a file. Overrides every other source.
    #[arg(long, value_name = "PATH")]
    pub config_file: Option<PathBuf>,
}

impl DaemonArgs {
    /// Parse a full argv, program name first.
    pub fn from_argv<I, T>(argv: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(argv)
    }
}

/// Argv the launcher hands to the daemon entry point.
pub fn launcher_argv() -> Vec<String> {
    ["bus-daemon", "--config-service", "--nofork", "--no-bt"]
        .into_iter()
        .map(String::from)
        .collect()
}
