//! Validated, side-effect free form of one service definition.
//!
//! Building a [`ServiceSpec`] touches no OS resources beyond name lookups, so
//! a whole configuration can be checked before anything is committed.

use std::collections::{HashMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{GlobalSettings, MasterConfig, ServiceDefinition};
use crate::error::{MasterError, Result};
use crate::listener::EndpointAddr;

use super::TransportType;
use super::names::ServiceNames;

/// Identity used to match services across reloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub canonical_name: String,
    pub transport: TransportType,
}

/// Everything the configuration says about a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub external_name: String,
    pub canonical_name: String,
    pub transport: TransportType,
    pub endpoints: Vec<EndpointAddr>,
    /// 0 means unlimited.
    pub max_concurrency: u32,
    pub command_path: PathBuf,
    pub argument_vector: Vec<String>,
    /// Seconds; 0 disables wakeups.
    pub wakeup_interval: u64,
    pub conditional_wakeup: bool,
    pub stress_capable: bool,
    pub unprivileged: bool,
    pub chroot: bool,
    pub throttle_backoff_seconds: u64,
    pub backlog: u32,
}

impl ServiceSpec {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            canonical_name: self.canonical_name.clone(),
            transport: self.transport,
        }
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_secs(self.throttle_backoff_seconds)
    }

    /// Whether running workers were started with a different command line or
    /// environment than this spec would produce.
    pub fn differs_for_workers(&self, other: &ServiceSpec) -> bool {
        self.command_path != other.command_path
            || self.argument_vector != other.argument_vector
            || self.max_concurrency != other.max_concurrency
            || self.stress_capable != other.stress_capable
            || self.unprivileged != other.unprivileged
            || self.chroot != other.chroot
            || self.canonical_name != other.canonical_name
    }

    pub fn from_definition(
        def: &ServiceDefinition,
        global: &GlobalSettings,
        names: &ServiceNames,
    ) -> Result<ServiceSpec> {
        let invalid = |reason: &str| MasterError::InvalidService {
            service: def.name.clone(),
            reason: reason.to_string(),
        };

        if def.name.trim().is_empty() {
            return Err(invalid("empty service name"));
        }
        if def.command.trim().is_empty() {
            return Err(invalid("empty command"));
        }

        let transport: TransportType =
            def.transport
                .parse()
                .map_err(|keyword: String| MasterError::BadTransport {
                    service: def.name.clone(),
                    keyword,
                })?;

        let max_concurrency = def.process_limit.unwrap_or(global.default_process_limit);
        if let Some(required) = def.required_process_limit
            && required != max_concurrency
        {
            return Err(MasterError::ProcessLimitConflict {
                service: def.name.clone(),
                configured: max_concurrency,
                required,
            });
        }

        let (canonical_name, endpoints) = match transport {
            TransportType::Inet => inet_endpoints(def, global, names)?,
            TransportType::Unix | TransportType::FdPassing | TransportType::Fifo => {
                if def.name.contains('/') {
                    return Err(invalid("local service names must not contain '/'"));
                }
                let dir = if def.private { "private" } else { "public" };
                let path = global.socket_directory.join(dir).join(&def.name);
                let addr = if transport == TransportType::Fifo {
                    EndpointAddr::Fifo(path)
                } else {
                    EndpointAddr::Unix(path)
                };
                (def.name.clone(), vec![addr])
            }
        };

        Ok(ServiceSpec {
            external_name: def.name.clone(),
            canonical_name,
            transport,
            endpoints,
            max_concurrency,
            command_path: resolve_command(&def.command, &global.daemon_directory),
            argument_vector: def.args.clone(),
            wakeup_interval: def.wakeup,
            conditional_wakeup: def.wakeup_conditional,
            stress_capable: def.stress_capable,
            unprivileged: def.unprivileged,
            chroot: def.chroot,
            throttle_backoff_seconds: global.service_throttle_time,
            backlog: max_concurrency.max(global.default_backlog),
        })
    }
}

/// Validate a whole configuration into specs, rejecting duplicate
/// identities and endpoints shared between services.
pub fn build_specs(cfg: &MasterConfig, names: &ServiceNames) -> Result<Vec<ServiceSpec>> {
    let mut specs: Vec<ServiceSpec> = Vec::with_capacity(cfg.services.len());
    let mut seen_keys = HashSet::new();
    for def in &cfg.services {
        let spec = ServiceSpec::from_definition(def, &cfg.global, names)?;
        if !seen_keys.insert(spec.key()) {
            return Err(MasterError::DuplicateService {
                name: spec.canonical_name.clone(),
                transport: spec.transport.to_string(),
            });
        }
        specs.push(spec);
    }

    let mut claimed: HashMap<Claim<'_>, String> = HashMap::new();
    for spec in &specs {
        for addr in &spec.endpoints {
            if let Some(first) = claimed.insert(Claim::of(addr), spec.external_name.clone()) {
                return Err(MasterError::DuplicateEndpoint {
                    first,
                    second: spec.external_name.clone(),
                    addr: addr.clone(),
                });
            }
        }
    }
    Ok(specs)
}

/// What an endpoint occupies: a filesystem name (whatever the node type) or
/// a local socket address.
#[derive(PartialEq, Eq, Hash)]
enum Claim<'a> {
    Path(&'a Path),
    Inet(SocketAddr),
}

impl<'a> Claim<'a> {
    fn of(addr: &'a EndpointAddr) -> Self {
        match addr {
            EndpointAddr::Unix(path) | EndpointAddr::Fifo(path) => Claim::Path(path),
            EndpointAddr::Inet(sock) => Claim::Inet(*sock),
        }
    }
}

/// Split `[host:]port`, canonicalise the port name and resolve the local
/// addresses to bind.
fn inet_endpoints(
    def: &ServiceDefinition,
    global: &GlobalSettings,
    names: &ServiceNames,
) -> Result<(String, Vec<EndpointAddr>)> {
    let (host, port_text) = match def.name.rsplit_once(':') {
        Some((host, port)) => {
            let host = host.trim_start_matches('[').trim_end_matches(']');
            (Some(host), port)
        }
        None => (None, def.name.as_str()),
    };

    let unresolved = |what: String, reason: &str| MasterError::Resolve {
        service: def.name.clone(),
        what,
        reason: reason.to_string(),
    };

    let (port, port_name) = match port_text.parse::<u16>() {
        Ok(port) => (
            port,
            names
                .name_of(port)
                .map(str::to_string)
                .unwrap_or_else(|| port.to_string()),
        ),
        Err(_) => {
            let port = names
                .port_of(port_text)
                .ok_or_else(|| unresolved(format!("port {port_text}"), "unknown service name"))?;
            let canonical = names.name_of(port).unwrap_or(port_text);
            (port, canonical.to_string())
        }
    };

    let canonical = match host {
        Some(host) if !host.is_empty() => format!("{host}:{port_name}"),
        _ => port_name,
    };

    let hosts: Vec<&str> = match host {
        Some(host) if !host.is_empty() => vec![host],
        _ => global.inet_interfaces.iter().map(String::as_str).collect(),
    };

    let mut addrs: Vec<SocketAddr> = Vec::new();
    for host in hosts {
        let host = match host {
            "all" => "0.0.0.0",
            "loopback-only" => "127.0.0.1",
            other => other,
        };
        let resolved = (host, port)
            .to_socket_addrs()
            .map_err(|e| unresolved(format!("host {host}"), &e.to_string()))?;
        for addr in resolved {
            if !addrs.contains(&addr) {
                addrs.push(addr);
            }
        }
    }
    if addrs.is_empty() {
        return Err(unresolved("listen addresses".into(), "no addresses found"));
    }

    Ok((canonical, addrs.into_iter().map(EndpointAddr::Inet).collect()))
}

/// Commands without a slash live in the daemon directory; if they are not
/// there, fall back to a PATH search.
fn resolve_command(command: &str, daemon_directory: &Path) -> PathBuf {
    if command.contains('/') {
        return PathBuf::from(command);
    }
    let in_daemon_dir = daemon_directory.join(command);
    if in_daemon_dir.exists() {
        return in_daemon_dir;
    }
    which::which(command).unwrap_or_else(|_| {
        log::warn!(
            "{command} not found in {} or PATH, using {}",
            daemon_directory.display(),
            in_daemon_dir.display()
        );
        in_daemon_dir
    })
}
