//! The worker side of the command-line contract.
//!
//! Worker frameworks parse their argument vector with [`WorkerOptions`] to
//! learn how the supervisor started them.

use clap::{ArgAction, Parser};

use crate::service::TransportType;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(disable_help_flag = true, disable_version_flag = true)]
pub struct WorkerOptions {
    /// Service name, when it differs from the program name.
    #[arg(short = 'n')]
    pub service_name: Option<String>,

    #[arg(short = 't')]
    pub transport: TransportType,

    /// Must run with a process limit of exactly 1.
    #[arg(short = 'l')]
    pub solitary: bool,

    /// Runs with no process limit.
    #[arg(short = 'z')]
    pub unlimited: bool,

    /// Number of listening descriptors inherited from the supervisor.
    #[arg(short = 's', default_value_t = 1)]
    pub listen_fd_count: u32,

    /// `name=value` configuration overrides.
    #[arg(short = 'o', action = ArgAction::Append)]
    pub overrides: Vec<String>,

    #[arg(short = 'v', action = ArgAction::Count)]
    pub verbose: u8,

    #[arg(short = 'c')]
    pub chroot: bool,

    #[arg(short = 'u')]
    pub unprivileged: bool,

    #[arg(short = 'D')]
    pub debug: bool,
}

impl WorkerOptions {
    /// Parse a full argument vector, `argv[0]` included.
    pub fn parse_argv<I, T>(argv: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Self::try_parse_from(argv)
    }

    /// Value of the last `-o name=value` for `name`.
    pub fn override_value(&self, name: &str) -> Option<&str> {
        self.overrides
            .iter()
            .rev()
            .filter_map(|o| o.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    /// Whether the supervisor started this worker in stress mode.
    pub fn stress(&self) -> bool {
        self.override_value("stress") == Some("yes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_supervisor_flags() {
        let opts = WorkerOptions::parse_argv([
            "smtpd", "-n", "smtp", "-t", "inet", "-u", "-v", "-v", "-s", "2", "-o", "stress=yes",
            "-o", "smtpd_tls_security_level=may",
        ])
        .unwrap();

        assert_eq!(opts.service_name.as_deref(), Some("smtp"));
        assert_eq!(opts.transport, TransportType::Inet);
        assert!(opts.unprivileged && !opts.chroot);
        assert_eq!(opts.verbose, 2);
        assert_eq!(opts.listen_fd_count, 2);
        assert!(opts.stress());
        assert_eq!(opts.override_value("smtpd_tls_security_level"), Some("may"));
    }

    #[test]
    fn empty_stress_value_means_not_stressed() {
        let opts = WorkerOptions::parse_argv(["qmgr", "-l", "-t", "fifo", "-o", "stress="]).unwrap();
        assert!(opts.solitary);
        assert!(!opts.stress());
        assert_eq!(opts.listen_fd_count, 1);
    }

    #[test]
    fn transport_is_mandatory() {
        assert!(WorkerOptions::parse_argv(["cleanup", "-z"]).is_err());
    }
}
