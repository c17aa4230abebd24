//! Command line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::action::PunchKind;
use crate::config::CONFIG_PATH_ENV;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = CONFIG_PATH_ENV)]
    pub config: Option<PathBuf>,

    /// Directory for rolling log files (overrides `logging.directory`)
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    /// Log filter directives, e.g. `punch_clock=debug` (overrides `logging.filter`)
    #[arg(long, global = true)]
    pub log_filter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler until Ctrl-C or SIGTERM
    Run,

    /// Send a test message through every enabled notification provider
    TestNotifications,

    /// Print the next fire time of each job
    NextRuns,

    /// Punch once right now through the full retry and notification pipeline
    Punch {
        #[arg(value_enum)]
        kind: PunchArg,
    },

    /// Validate the configuration and print a summary
    CheckConfig,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchArg {
    ClockIn,
    ClockOut,
}

impl From<PunchArg> for PunchKind {
    fn from(arg: PunchArg) -> Self {
        match arg {
            PunchArg::ClockIn => PunchKind::ClockIn,
            PunchArg::ClockOut => PunchKind::ClockOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_cli_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_punch() {
        let args = Args::try_parse_from([
            "punch-clock",
            "--config",
            "/etc/punch.toml",
            "punch",
            "clock-out",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/etc/punch.toml")));
        match args.command {
            Commands::Punch { kind } => assert_eq!(PunchKind::from(kind), PunchKind::ClockOut),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["punch-clock", "run", "--log-filter", "punch_clock=debug"])
                .unwrap();
        assert!(matches!(args.command, Commands::Run));
        assert_eq!(args.log_filter.as_deref(), Some("punch_clock=debug"));
    }

    #[test]
    fn test_unknown_punch_kind_rejected() {
        assert!(Args::try_parse_from(["punch-clock", "punch", "lunch"]).is_err());
    }
}
