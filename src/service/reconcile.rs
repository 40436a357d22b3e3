//! Configuration reconciliation.
//!
//! A new configuration is applied in two phases. Everything that can fail
//! (validation, opening endpoints, creating status pipes) happens first and
//! touches no live state; a failure drops what was acquired and leaves the
//! running configuration alone. The commit phase cannot fail.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::os::fd::AsRawFd;

use log::{debug, info};

use crate::admission::set_listening;
use crate::config::MasterConfig;
use crate::error::{MasterError, Result};
use crate::event::{TimerKind, Token};
use crate::listener::{Endpoint, EndpointAddr, close_endpoints, open_endpoints};
use crate::process::ProcessControl;
use crate::status::StatusChannel;
use crate::supervisor::{Settings, Supervisor};

use super::spec::build_specs;
use super::{ServiceDescriptor, ServiceId, ServiceKey, ServiceSpec, ServiceState};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ReloadSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.updated == 0 && self.removed == 0
    }
}

impl fmt::Display for ReloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} added, {} updated, {} removed, {} unchanged",
            self.added, self.updated, self.removed, self.unchanged
        )
    }
}

/// Where one endpoint of a staged service comes from.
enum EndpointSource {
    Opened(Endpoint),
    /// Moved over from a live service that gives it up in this reload.
    Taken(EndpointAddr),
}

enum Staged {
    New {
        spec: ServiceSpec,
        endpoints: Vec<EndpointSource>,
        status: StatusChannel,
    },
    Existing {
        id: ServiceId,
        spec: ServiceSpec,
        /// Present when the endpoint set changes.
        endpoints: Option<Vec<EndpointSource>>,
    },
}

impl<P: ProcessControl> Supervisor<P> {
    /// Bring the service table in line with `cfg`, all or nothing.
    pub fn apply_config(&mut self, cfg: &MasterConfig) -> Result<ReloadSummary> {
        let settings =
            Settings::from_config(self.settings.config_path.clone(), &cfg.global, self.settings.verbosity)?;
        let specs = build_specs(cfg, &self.names)?;

        let by_key: HashMap<ServiceKey, ServiceId> = self
            .services
            .values()
            .filter(|svc| svc.is_active())
            .map(|svc| (svc.spec.key(), svc.id))
            .collect();
        let wanted: HashSet<ServiceKey> = specs.iter().map(ServiceSpec::key).collect();

        // Endpoints held by services that are going away or moving elsewhere
        // can be handed to whoever wants the same address.
        let mut releasable: HashSet<EndpointAddr> = HashSet::new();
        for svc in self.services.values().filter(|svc| svc.is_active()) {
            let keeps_endpoints = specs
                .iter()
                .any(|spec| spec.key() == svc.spec.key() && spec.endpoints == svc.spec.endpoints);
            if !keeps_endpoints {
                releasable.extend(svc.listen_endpoints.iter().map(|ep| ep.addr().clone()));
            }
        }

        let owner = settings.owner;
        // Each released endpoint goes to one claimant; anyone else asking
        // for the same address opens its own and fails at bind.
        let mut acquire = |spec: &ServiceSpec| -> Result<Vec<EndpointSource>> {
            let mut sources = Vec::with_capacity(spec.endpoints.len());
            for addr in &spec.endpoints {
                if releasable.remove(addr) {
                    sources.push(EndpointSource::Taken(addr.clone()));
                } else {
                    let mut opened =
                        open_endpoints(&spec.external_name, std::slice::from_ref(addr), spec.backlog, owner)?;
                    sources.extend(opened.pop().map(EndpointSource::Opened));
                }
            }
            Ok(sources)
        };

        let mut staged = Vec::with_capacity(specs.len());
        for spec in specs {
            match by_key.get(&spec.key()) {
                Some(&id) => {
                    let current = &self.services[&id];
                    let endpoints = if current.spec.endpoints != spec.endpoints {
                        Some(acquire(&spec)?)
                    } else {
                        None
                    };
                    staged.push(Staged::Existing { id, spec, endpoints });
                }
                None => {
                    let endpoints = acquire(&spec)?;
                    let status = StatusChannel::new().map_err(|source| MasterError::StatusPipe {
                        service: spec.external_name.clone(),
                        source,
                    })?;
                    staged.push(Staged::New {
                        spec,
                        endpoints,
                        status,
                    });
                }
            }
        }

        Ok(self.commit(settings, staged, &by_key, &wanted))
    }

    fn commit(
        &mut self,
        settings: Settings,
        staged: Vec<Staged>,
        by_key: &HashMap<ServiceKey, ServiceId>,
        wanted: &HashSet<ServiceKey>,
    ) -> ReloadSummary {
        let mut summary = ReloadSummary::default();
        let mut pool: HashMap<EndpointAddr, Endpoint> = HashMap::new();

        self.events.set_max_wait(settings.max_wait);
        self.settings = settings;

        let mut removed: Vec<ServiceId> = by_key
            .iter()
            .filter(|(key, _)| !wanted.contains(*key))
            .map(|(_, &id)| id)
            .collect();
        removed.sort();
        for id in removed {
            summary.removed += 1;
            self.retire_service(id, &mut pool);
        }

        for entry in &staged {
            if let Staged::Existing {
                id,
                endpoints: Some(_),
                ..
            } = entry
                && let Some(svc) = self.services.get_mut(id)
            {
                set_listening(&mut self.events, svc, false);
                for endpoint in svc.listen_endpoints.drain(..) {
                    pool.insert(endpoint.addr().clone(), endpoint);
                }
            }
        }

        let mut take = |sources: Vec<EndpointSource>| -> Vec<Endpoint> {
            sources
                .into_iter()
                .map(|source| match source {
                    EndpointSource::Opened(endpoint) => endpoint,
                    EndpointSource::Taken(addr) => pool
                        .remove(&addr)
                        .unwrap_or_else(|| panic!("endpoint {addr} vanished during reload")),
                })
                .collect()
        };

        let mut touched = Vec::new();
        for entry in staged {
            match entry {
                Staged::New {
                    spec,
                    endpoints,
                    status,
                } => {
                    let endpoints = take(endpoints);
                    let id = self.allocate_id();
                    let svc = ServiceDescriptor::new(id, spec, endpoints, status);
                    info!("{}: added", svc.label());
                    self.events.enable_read(svc.status.as_raw_fd(), Token::Status(id));
                    self.services.insert(id, svc);
                    summary.added += 1;
                    touched.push((id, false));
                }
                Staged::Existing { id, spec, endpoints } => {
                    let svc = self
                        .services
                        .get_mut(&id)
                        .unwrap_or_else(|| panic!("staged service {id} vanished during reload"));
                    if svc.spec == spec && endpoints.is_none() {
                        summary.unchanged += 1;
                        continue;
                    }
                    let restart = svc.spec.differs_for_workers(&spec) || endpoints.is_some();
                    if svc.spec.external_name != spec.external_name {
                        info!(
                            "{}: now known as {}",
                            svc.label(),
                            spec.external_name
                        );
                    }
                    svc.spec = spec;
                    if let Some(endpoints) = endpoints {
                        svc.listen_endpoints = take(endpoints);
                    }
                    debug!("{}: updated{}", svc.label(), if restart { ", restarting" } else { "" });
                    summary.updated += 1;
                    touched.push((id, restart));
                }
            }
        }

        let leftover: Vec<Endpoint> = pool.into_values().collect();
        if !leftover.is_empty() {
            close_endpoints("reload", leftover);
        }

        for (id, restart) in touched {
            if restart {
                self.restart_service(id, true);
            } else {
                self.arm_wakeup(id);
                self.reconcile_listen_state(id);
            }
        }
        summary
    }

    /// Take a service out of the table: its workers are told to go, its
    /// endpoints are handed to `pool` and the descriptor lingers as
    /// draining until the last worker is reaped.
    fn retire_service(&mut self, id: ServiceId, pool: &mut HashMap<EndpointAddr, Endpoint>) {
        self.deactivate(id);
        self.events.cancel_timer(TimerKind::Unthrottle(id));
        self.events.cancel_timer(TimerKind::Wakeup(id));
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        info!("{}: removed", svc.label());
        svc.state = ServiceState::Draining;
        svc.is_throttled = false;
        for endpoint in svc.listen_endpoints.drain(..) {
            pool.insert(endpoint.addr().clone(), endpoint);
        }
        if svc.children.is_empty() {
            self.free_service(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use nix::unistd::Pid;

    use super::*;
    use crate::process::ExitReport;
    use crate::service::TransportType;
    use crate::service::spec::tests::definition;
    use crate::status::{Availability, StatusRecord};
    use crate::supervisor::tests::{config, harness, service_id, spawn_via_listen};

    fn available(sup: &mut Supervisor<crate::process::fake::FakeProcessControl>, id: ServiceId, pid: Pid) {
        sup.apply_status(
            id,
            StatusRecord {
                pid: pid.as_raw(),
                generation: sup.services[&id].generation,
                availability: Availability::Available,
            },
        );
    }

    #[test]
    fn same_configuration_twice_changes_nothing() {
        let defs = vec![definition("echo", "unix"), definition("pickup", "fifo")];
        let (mut sup, dir) = harness(defs.clone());
        let ids: Vec<ServiceId> = sup.services.keys().copied().collect();
        let fds: Vec<i32> = sup
            .services
            .values()
            .map(|svc| svc.listen_endpoints[0].as_raw_fd())
            .collect();

        let summary = sup.apply_config(&config(dir.path(), defs)).unwrap();
        assert!(summary.is_noop(), "{summary}");
        assert_eq!(summary.unchanged, 2);
        assert_eq!(sup.services.keys().copied().collect::<Vec<_>>(), ids);
        let after: Vec<i32> = sup
            .services
            .values()
            .map(|svc| svc.listen_endpoints[0].as_raw_fd())
            .collect();
        assert_eq!(after, fds);
        assert!(sup.control().terminated.is_empty());
    }

    #[test]
    fn renamed_service_is_merged_in_place() {
        let mut old = definition("25", "inet");
        old.name = "127.0.0.1:0".into();
        let (mut sup, dir) = harness(vec![old.clone()]);
        let id = *sup.services.keys().next().unwrap();
        let workers: Vec<Pid> = (0..3)
            .map(|_| {
                sup.spawn_worker(id);
                sup.control().last_pid()
            })
            .collect();
        for &pid in &workers {
            available(&mut sup, id, pid);
        }
        assert_eq!(sup.services[&id].available_worker_count, 3);

        // Same identity under another spelling: port 0 has no service name.
        let mut renamed = old;
        renamed.name = "127.0.0.1:00".into();
        let summary = sup.apply_config(&config(dir.path(), vec![renamed])).unwrap();

        assert_eq!(summary.updated, 1);
        assert_eq!(summary.added + summary.removed, 0);
        let svc = &sup.services[&id];
        assert_eq!(svc.spec.external_name, "127.0.0.1:00");
        assert_eq!(svc.generation, 0);
        assert_eq!(svc.total_worker_count, 3);
        assert!(sup.control().terminated.is_empty());
        for pid in workers {
            assert!(!sup.worker(pid).unwrap().retired);
        }
        sup.check_invariants();
    }

    #[test]
    fn changed_command_restarts_with_new_generation() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        let pid = spawn_via_listen(&mut sup, id);

        let mut def = definition("echo", "unix");
        def.args = vec!["-o".into(), "echo_greeting=hi".into()];
        let summary = sup.apply_config(&config(dir.path(), vec![def])).unwrap();

        assert_eq!(summary.updated, 1);
        let svc = &sup.services[&id];
        assert_eq!(svc.generation, 1);
        assert_eq!(svc.total_worker_count, 0);
        assert!(svc.is_listening, "new connections go to new workers");
        assert_eq!(sup.control().terminated, vec![pid]);
        sup.check_invariants();
    }

    #[test]
    fn removed_service_drains_then_disappears() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix"), definition("relay", "unix")]);
        let id = service_id(&sup, "relay");
        let pid = spawn_via_listen(&mut sup, id);
        let status_fd = sup.services[&id].status.as_raw_fd();

        let summary = sup
            .apply_config(&config(dir.path(), vec![definition("echo", "unix")]))
            .unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.unchanged, 1);

        let svc = &sup.services[&id];
        assert_eq!(svc.state, ServiceState::Draining);
        assert!(svc.listen_endpoints.is_empty());
        assert!(!svc.is_listening);
        assert_eq!(sup.control().terminated, vec![pid]);
        assert!(sup.service("relay", TransportType::Unix).is_none());
        sup.check_invariants();

        sup.control_mut().exit(pid, ExitReport::Signaled(nix::sys::signal::Signal::SIGTERM));
        sup.reap_children();
        assert!(!sup.services.contains_key(&id));
        assert!(!sup.events.is_registered(status_fd));
        assert_eq!(sup.worker_count(), 0);
    }

    #[test]
    fn idle_removed_service_is_freed_at_once() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix"), definition("relay", "unix")]);
        let id = service_id(&sup, "relay");
        sup.apply_config(&config(dir.path(), vec![definition("echo", "unix")]))
            .unwrap();
        assert!(!sup.services.contains_key(&id));
    }

    #[test]
    fn failed_reload_leaves_everything_running() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        let pid = spawn_via_listen(&mut sup, id);

        // "relay" opens fine, "fresh" cannot: public/ is gone.
        let mut fresh = definition("fresh", "unix");
        fresh.private = false;
        std::fs::remove_dir(dir.path().join("public")).unwrap();
        let defs = vec![definition("echo", "unix"), definition("relay", "unix"), fresh];

        let err = sup.apply_config(&config(dir.path(), defs)).unwrap_err();
        assert!(matches!(err, MasterError::Listen { .. }), "{err}");

        assert_eq!(sup.services.len(), 1);
        assert!(sup.service("relay", TransportType::Unix).is_none());
        let svc = &sup.services[&id];
        assert!(svc.is_active());
        assert_eq!(svc.total_worker_count, 1);
        assert!(!sup.worker(pid).unwrap().retired);
        assert!(sup.control().terminated.is_empty());
        sup.check_invariants();
    }

    #[test]
    fn two_names_for_one_released_address_abort_the_reload() {
        let (mut sup, dir) = harness(vec![definition("0", "inet")]);
        let id = service_id(&sup, "0");
        let pid = spawn_via_listen(&mut sup, id);

        let defs = vec![definition("127.0.0.1:0", "inet"), definition("localhost:0", "inet")];
        let err = sup.apply_config(&config(dir.path(), defs)).unwrap_err();
        assert!(matches!(err, MasterError::DuplicateEndpoint { .. }), "{err}");
        assert_eq!(err.severity(crate::error::Phase::Reload), crate::error::Severity::Recoverable);

        assert_eq!(sup.services.len(), 1);
        assert!(sup.services[&id].is_active());
        assert_eq!(sup.services[&id].listen_endpoints.len(), 1);
        assert!(!sup.worker(pid).unwrap().retired);
        assert!(sup.control().terminated.is_empty());
        sup.check_invariants();
    }

    #[test]
    fn global_settings_follow_the_reloaded_file() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix")]);
        let mut cfg = config(dir.path(), vec![definition("echo", "unix")]);
        cfg.global.max_wait = 7;
        cfg.global.watchdog_timeout = 60;
        cfg.global.import_environment = Some(vec!["PATH".into()]);

        let summary = sup.apply_config(&cfg).unwrap();
        assert!(summary.is_noop());
        assert_eq!(sup.settings.max_wait, Duration::from_secs(7));
        assert_eq!(sup.settings.watchdog_timeout, Duration::from_secs(60));
        assert_eq!(sup.settings.import_environment, Some(vec!["PATH".to_string()]));
        assert_eq!(sup.events.next_wait(sup.now), Duration::from_secs(7));
        assert_eq!(sup.settings.config_path, dir.path().join("master.toml"));
    }

    #[test]
    fn unknown_owner_keeps_previous_settings() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix")]);
        let before = sup.settings.max_wait;
        let mut cfg = config(dir.path(), vec![definition("echo", "unix")]);
        cfg.global.mail_owner = Some("masterd-no-such-user".into());
        cfg.global.max_wait = 3;

        let err = sup.apply_config(&cfg).unwrap_err();
        assert!(matches!(err, MasterError::Resolve { .. }), "{err}");
        assert_eq!(sup.settings.max_wait, before);
        assert!(sup.settings.owner.is_none());
    }

    #[test]
    fn invalid_definition_aborts_before_any_change() {
        let (mut sup, dir) = harness(vec![definition("echo", "unix")]);
        let err = sup
            .apply_config(&config(dir.path(), vec![definition("echo", "tcp")]))
            .unwrap_err();
        assert!(matches!(err, MasterError::BadTransport { .. }), "{err}");
        assert!(sup.service("echo", TransportType::Unix).unwrap().is_active());
    }

    #[test]
    fn endpoint_moves_between_services_on_transport_change() {
        let (mut sup, dir) = harness(vec![definition("relay", "unix")]);
        let old = service_id(&sup, "relay");
        let fd = sup.services[&old].listen_endpoints[0].as_raw_fd();

        let summary = sup
            .apply_config(&config(dir.path(), vec![definition("relay", "pass")]))
            .unwrap();
        assert_eq!((summary.added, summary.removed), (1, 1));

        let new = sup.service("relay", TransportType::FdPassing).unwrap();
        assert_eq!(new.listen_endpoints[0].as_raw_fd(), fd, "socket reused, not reopened");
        assert!(new.is_listening);
        assert!(!sup.services.contains_key(&old));
        sup.check_invariants();
    }
}
