//! Error taxonomy for the supervisor.
//!
//! Nothing here is returned to a "caller" in the usual sense: the supervisor
//! has no caller. Every error is either absorbed with a log line or escalated
//! to process termination, and which of the two happens is decided by the
//! error kind and the phase it occurred in, never at the call site.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::listener::EndpointAddr;

/// When an error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Initial configuration load, before the event loop runs.
    Startup,
    /// A SIGHUP-triggered configuration reload.
    Reload,
    /// Normal event-loop operation.
    Runtime,
}

/// What an error means for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged; the supervisor keeps running on its current state.
    Recoverable,
    /// The supervisor exits.
    Fatal,
}

#[derive(Debug, Error)]
pub enum MasterError {
    #[error("cannot read configuration {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot parse configuration {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("service {service}: unknown transport type \"{keyword}\"")]
    BadTransport { service: String, keyword: String },

    #[error("service {service}: {reason}")]
    InvalidService { service: String, reason: String },

    #[error("service {service}: process limit {configured} conflicts with required process limit {required}")]
    ProcessLimitConflict {
        service: String,
        configured: u32,
        required: u32,
    },

    #[error("duplicate service {name}/{transport}")]
    DuplicateService { name: String, transport: String },

    #[error("services {first} and {second} both use endpoint {addr}")]
    DuplicateEndpoint {
        first: String,
        second: String,
        addr: EndpointAddr,
    },

    #[error("service {service}: cannot resolve {what}: {reason}")]
    Resolve {
        service: String,
        what: String,
        reason: String,
    },

    #[error("service {service}: cannot open endpoint {endpoint}: {source}")]
    Listen {
        service: String,
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("service {service}: cannot create status pipe: {source}")]
    StatusPipe {
        service: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot create {what}: {source}")]
    Setup {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("service {service}: cannot spawn {command}: {source}")]
    Spawn {
        service: String,
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("lock file {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("the supervisor is already running (pid {pid})")]
    AlreadyRunning { pid: String },

    #[error("the supervisor is not running")]
    NotRunning,

    #[error("cannot signal supervisor pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("event loop wait failed: {source}")]
    EventLoop {
        #[source]
        source: io::Error,
    },
}

impl MasterError {
    /// Fixed classification per error kind.
    ///
    /// Configuration and resource-acquisition errors kill the supervisor only
    /// while it is starting up; after that they abort the reload that hit
    /// them and the previous configuration stays in force.
    pub fn severity(&self, phase: Phase) -> Severity {
        match self {
            MasterError::Spawn { .. } => Severity::Recoverable,
            MasterError::AlreadyRunning { .. }
            | MasterError::Lock { .. }
            | MasterError::Setup { .. }
            | MasterError::EventLoop { .. } => Severity::Fatal,
            MasterError::NotRunning | MasterError::Signal { .. } => Severity::Recoverable,
            MasterError::ConfigRead { .. }
            | MasterError::ConfigParse { .. }
            | MasterError::BadTransport { .. }
            | MasterError::InvalidService { .. }
            | MasterError::ProcessLimitConflict { .. }
            | MasterError::DuplicateService { .. }
            | MasterError::DuplicateEndpoint { .. }
            | MasterError::Resolve { .. }
            | MasterError::Listen { .. }
            | MasterError::StatusPipe { .. } => match phase {
                Phase::Startup => Severity::Fatal,
                Phase::Reload | Phase::Runtime => Severity::Recoverable,
            },
        }
    }
}

pub type Result<T, E = MasterError> = std::result::Result<T, E>;
