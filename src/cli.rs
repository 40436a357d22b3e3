use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about = "masterd process supervisor")]
pub struct Args {
    /// Sub‑commands (run, test, reload, stop)
    #[command(subcommand)]
    pub sub: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Supervise the configured services (default if no sub‑command)
    Run {
        /// Do not detach from the terminal
        #[arg(long)]
        foreground: bool,

        /// Path to configuration file
        #[arg(long, short = 'c')]
        config: Option<String>,

        /// Use system-wide config (/etc/masterd/master.toml)
        #[arg(long, conflicts_with = "config")]
        system: bool,

        /// More logging; also passed on to workers
        #[arg(short = 'v', action = clap::ArgAction::Count)]
        verbose: u8,

        /// Exit after this many seconds (debugging)
        #[arg(long, value_name = "SECS")]
        exit_after: Option<u64>,
    },
    /// Exit 0 when no supervisor is running, 1 otherwise
    Test {
        #[arg(long, short = 'c')]
        config: Option<String>,

        #[arg(long, conflicts_with = "config")]
        system: bool,
    },
    /// Ask the running supervisor to reload its configuration
    Reload {
        #[arg(long, short = 'c')]
        config: Option<String>,

        #[arg(long, conflicts_with = "config")]
        system: bool,
    },
    /// Terminate the running supervisor and its workers
    Stop {
        #[arg(long, short = 'c')]
        config: Option<String>,

        #[arg(long, conflicts_with = "config")]
        system: bool,
    },
}

impl Default for Cmd {
    fn default() -> Self {
        Cmd::Run {
            foreground: false,
            config: None,
            system: false,
            verbose: 0,
            exit_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_invocation_means_run() {
        let args = Args::try_parse_from(["masterd"]).unwrap();
        assert!(args.sub.is_none());
        assert!(matches!(Cmd::default(), Cmd::Run { foreground: false, .. }));
    }

    #[test]
    fn run_counts_verbosity() {
        let args = Args::try_parse_from(["masterd", "run", "-vv", "--exit-after", "5"]).unwrap();
        match args.sub {
            Some(Cmd::Run { verbose, exit_after, .. }) => {
                assert_eq!(verbose, 2);
                assert_eq!(exit_after, Some(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn config_and_system_conflict() {
        assert!(Args::try_parse_from(["masterd", "stop", "-c", "x.toml", "--system"]).is_err());
    }
}
