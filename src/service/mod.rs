//! The service table: one [`ServiceDescriptor`] per configured service.

pub mod names;
pub mod reconcile;
pub mod spec;

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use nix::unistd::Pid;

use crate::listener::Endpoint;
use crate::status::StatusChannel;

pub use spec::{ServiceKey, ServiceSpec};

/// Stable handle for a descriptor, never reused within one supervisor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceId(pub u64);

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportType {
    Unix,
    Inet,
    Fifo,
    FdPassing,
}

impl TransportType {
    /// Name used on the worker command line (`-t`).
    pub fn as_str(self) -> &'static str {
        match self {
            TransportType::Unix => "unix",
            TransportType::Inet => "inet",
            TransportType::Fifo => "fifo",
            TransportType::FdPassing => "fd-passing",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(TransportType::Unix),
            "inet" => Ok(TransportType::Inet),
            "fifo" => Ok(TransportType::Fifo),
            "pass" | "fd-passing" => Ok(TransportType::FdPassing),
            other => Err(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Active,
    /// Removed by a reload; kept until its last worker is reaped.
    Draining,
}

/// A configured service plus its live resources and counters.
///
/// Counters only cover workers of the current incarnation; retired workers
/// still being reaped stay in `children` but are not counted.
#[derive(Debug)]
pub struct ServiceDescriptor {
    pub id: ServiceId,
    pub spec: ServiceSpec,
    pub state: ServiceState,
    /// Bumped whenever the configuration workers run under changes.
    pub generation: u32,
    pub listen_endpoints: Vec<Endpoint>,
    pub status: StatusChannel,
    /// Pids of every worker of this service still in the process table.
    pub children: HashSet<Pid>,
    pub available_worker_count: u32,
    /// Spawned but not yet reported in.
    pub starting_worker_count: u32,
    pub total_worker_count: u32,
    pub is_throttled: bool,
    pub is_listening: bool,
    pub stress_active_until: Option<Instant>,
    pub last_busy_warning_time: Option<Instant>,
    pub last_ceiling_hit: Option<Instant>,
    /// Whether the previous listen decision was "ceiling reached".
    pub at_ceiling: bool,
    /// Set on the first spawn; conditional wakeups wait for it.
    pub ever_used: bool,
}

impl ServiceDescriptor {
    pub fn new(
        id: ServiceId,
        spec: ServiceSpec,
        listen_endpoints: Vec<Endpoint>,
        status: StatusChannel,
    ) -> Self {
        Self {
            id,
            spec,
            state: ServiceState::Active,
            generation: 0,
            listen_endpoints,
            status,
            children: HashSet::new(),
            available_worker_count: 0,
            starting_worker_count: 0,
            total_worker_count: 0,
            is_throttled: false,
            is_listening: false,
            stress_active_until: None,
            last_busy_warning_time: None,
            last_ceiling_hit: None,
            at_ceiling: false,
            ever_used: false,
        }
    }

    /// `name/transport`, the form used in log lines.
    pub fn label(&self) -> String {
        format!("{}/{}", self.spec.external_name, self.spec.transport)
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceState::Active
    }

    /// Whether one more worker fits under the process limit.
    pub fn below_ceiling(&self) -> bool {
        self.spec.max_concurrency == 0 || self.total_worker_count < self.spec.max_concurrency
    }

    pub fn stress_active(&self, now: Instant) -> bool {
        self.stress_active_until.is_some_and(|until| until > now)
    }
}
