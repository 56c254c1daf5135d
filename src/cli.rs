//! Command-line interface of the `settle` demo binary, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (demo, lines, config)
//! and the global flags (--config, --verbose).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// settle — coalesce bursts of events into one settled action.
#[derive(Debug, Parser)]
#[command(name = "settle", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (defaults to ./settle.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Simulates a burst of restarts and reports how the epoch resolved.
    Demo(DemoArgs),

    /// Treats each stdin line as a keystroke; prints the line once input settles.
    Lines {
        /// Quiet interval in milliseconds (overrides the configuration).
        #[arg(long)]
        interval_ms: Option<u64>,
    },

    /// Prints the effective configuration as TOML.
    Config,
}

#[derive(Debug, Clone, Args)]
pub struct DemoArgs {
    /// Quiet interval in milliseconds (overrides the configuration).
    #[arg(long)]
    pub interval_ms: Option<u64>,

    /// Number of restart requests in the burst.
    #[arg(long, default_value_t = 5)]
    pub restarts: u32,

    /// Delay between consecutive restarts in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub spacing_ms: u64,

    /// Finalization items queued when the epoch wins.
    #[arg(long, default_value_t = 0)]
    pub finalizers: u32,

    /// Duration of each finalization item in milliseconds.
    #[arg(long, default_value_t = 100)]
    pub finalizer_ms: u64,

    /// Cancels the epoch this many milliseconds after the first restart.
    #[arg(long)]
    pub cancel_after_ms: Option<u64>,

    /// Prints the epoch record as JSON only.
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_demo_defaults() {
        let cli = Cli::parse_from(["settle", "demo"]);
        match cli.command {
            Command::Demo(args) => {
                assert_eq!(args.restarts, 5);
                assert_eq!(args.spacing_ms, 100);
                assert_eq!(args.finalizers, 0);
                assert!(args.interval_ms.is_none());
                assert!(args.cancel_after_ms.is_none());
                assert!(!args.json);
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_demo_flags() {
        let cli = Cli::parse_from([
            "settle",
            "demo",
            "--interval-ms",
            "250",
            "--finalizers",
            "3",
            "--cancel-after-ms",
            "120",
            "--json",
        ]);
        match cli.command {
            Command::Demo(args) => {
                assert_eq!(args.interval_ms, Some(250));
                assert_eq!(args.finalizers, 3);
                assert_eq!(args.cancel_after_ms, Some(120));
                assert!(args.json);
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["settle", "--config", "custom.toml", "--verbose", "config"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert!(matches!(cli.command, Command::Config));
    }

    #[test]
    fn cli_parses_lines_subcommand() {
        let cli = Cli::parse_from(["settle", "lines", "--interval-ms", "300"]);
        match cli.command {
            Command::Lines { interval_ms } => assert_eq!(interval_ms, Some(300)),
            _ => panic!("expected Lines command"),
        }
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
