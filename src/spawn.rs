//! Worker lifecycle: spawning, reaping, throttling and mass termination.

use std::env;
use std::ffi::OsString;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::unistd::Pid;

use crate::error::MasterError;
use crate::event::TimerKind;
use crate::fd::{FLOW_READ_FD, FLOW_WRITE_FD, LISTEN_FD_BASE, STATUS_FD};
use crate::process::{ExitReport, ProcessControl, SpawnRequest, WorkerProcess, WorkerState};
use crate::service::{ServiceId, ServiceSpec, ServiceState};
use crate::status::GENERATION_ENV;
use crate::supervisor::Supervisor;

/// Build a worker's argument vector. `stress` is `None` for services that
/// do not take the stress override.
pub fn worker_argv(spec: &ServiceSpec, verbosity: u8, stress: Option<bool>) -> Vec<String> {
    let mut argv = vec![spec.command_path.display().to_string()];

    match spec.max_concurrency {
        0 => argv.push("-z".into()),
        1 => argv.push("-l".into()),
        _ => {}
    }
    let program = spec
        .command_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    if program != spec.canonical_name {
        argv.extend(["-n".into(), spec.canonical_name.clone()]);
    }
    if spec.unprivileged {
        argv.push("-u".into());
    }
    if spec.chroot {
        argv.push("-c".into());
    }
    argv.extend(["-t".into(), spec.transport.as_str().into()]);
    argv.extend((0..verbosity).map(|_| "-v".to_string()));
    if spec.endpoints.len() > 1 {
        argv.extend(["-s".into(), spec.endpoints.len().to_string()]);
    }
    if let Some(active) = stress {
        let value = if active { "yes" } else { "" };
        argv.extend(["-o".into(), format!("stress={value}")]);
    }
    argv.extend(spec.argument_vector.iter().cloned());
    argv
}

/// Worker environment: either ours plus `GENERATION`, or only the imported
/// variables plus `GENERATION`.
pub fn worker_env(import: Option<&[String]>, generation: u32) -> (bool, Vec<(OsString, OsString)>) {
    let mut vars: Vec<(OsString, OsString)> = match import {
        Some(names) => names
            .iter()
            .filter_map(|name| env::var_os(name).map(|value| (OsString::from(name), value)))
            .collect(),
        None => Vec::new(),
    };
    vars.push((GENERATION_ENV.into(), generation.to_string().into()));
    (import.is_some(), vars)
}

impl<P: ProcessControl> Supervisor<P> {
    /// Start one worker for `id`.
    ///
    /// # Panics
    ///
    /// If the service is already at its process limit.
    pub(crate) fn spawn_worker(&mut self, id: ServiceId) {
        let now = self.now;
        let Some(svc) = self.services.get(&id) else {
            return;
        };
        if !svc.below_ceiling() {
            panic!(
                "{}: spawn at process limit {}",
                svc.label(),
                svc.total_worker_count
            );
        }

        let stress = svc.spec.stress_capable.then(|| svc.stress_active(now));
        let argv = worker_argv(&svc.spec, self.settings.verbosity, stress);
        let (env_clear, env) = worker_env(self.settings.import_environment.as_deref(), svc.generation);

        let mut inherit: Vec<(BorrowedFd<'_>, RawFd)> = vec![
            (self.flow.read.as_fd(), FLOW_READ_FD),
            (self.flow.write.as_fd(), FLOW_WRITE_FD),
            (svc.status.write_end(), STATUS_FD),
        ];
        inherit.extend(
            svc.listen_endpoints
                .iter()
                .zip(LISTEN_FD_BASE..)
                .map(|(endpoint, slot)| (endpoint.as_fd(), slot)),
        );

        let label = svc.label();
        let request = SpawnRequest {
            service: &label,
            command: &svc.spec.command_path,
            argv: &argv,
            env_clear,
            env,
            inherit,
        };
        let generation = svc.generation;
        let result = self.control.spawn(&request);
        drop(request);

        match result {
            Ok(pid) => {
                debug!("{label}: spawned pid {pid}: {}", argv.join(" "));
                self.procs.insert(WorkerProcess::new(pid, id, generation));
                if let Some(svc) = self.services.get_mut(&id) {
                    svc.children.insert(pid);
                    svc.total_worker_count += 1;
                    svc.starting_worker_count += 1;
                    svc.ever_used = true;
                }
                self.reconcile_listen_state(id);
            }
            Err(source) => {
                let err = MasterError::Spawn {
                    service: label,
                    command: argv[0].clone(),
                    source,
                };
                error!("{err} -- throttling");
                self.throttle(id);
            }
        }
    }

    /// Collect every terminated child.
    pub fn reap_children(&mut self) {
        loop {
            match self.control.reap() {
                Ok(Some((pid, report))) => self.on_child_exit(pid, report),
                Ok(None) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid: {e}");
                    break;
                }
            }
        }
    }

    fn on_child_exit(&mut self, pid: Pid, report: ExitReport) {
        let Some(proc) = self.procs.remove(pid) else {
            debug!("reaped unknown pid {pid} ({report})");
            return;
        };
        let id = proc.service;
        let svc = self
            .services
            .get_mut(&id)
            .unwrap_or_else(|| panic!("reaped pid {pid} of unknown service {id}"));
        if !svc.children.remove(&pid) {
            panic!("{}: reaped pid {pid} missing from its children", svc.label());
        }

        let label = svc.label();
        let crashed_on_startup = !proc.retired && !proc.ever_available;
        if !report.is_normal() && !(proc.retired && report.is_sigterm()) {
            warn!("process {} pid {pid} {report}", svc.spec.command_path.display());
        }

        if !proc.retired {
            svc.total_worker_count -= 1;
            match proc.state {
                WorkerState::Available => svc.available_worker_count -= 1,
                WorkerState::Spawning => svc.starting_worker_count -= 1,
                WorkerState::Busy => {}
            }
        }

        if svc.state == ServiceState::Draining {
            if svc.children.is_empty() {
                info!("{label}: last worker gone, service released");
                self.free_service(id);
            }
            return;
        }

        if crashed_on_startup {
            warn!("{label}: pid {pid} exited before becoming available");
            self.throttle(id);
        }
        self.reconcile_listen_state(id);
    }

    /// Stop accepting for a while after a failure.
    pub(crate) fn throttle(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        if !svc.is_throttled {
            svc.is_throttled = true;
            let delay = svc.spec.throttle_delay();
            warn!("{}: bad command startup -- throttling for {}s", svc.label(), delay.as_secs());
            self.events.arm_timer(TimerKind::Unthrottle(id), delay, self.now);
        }
        self.reconcile_listen_state(id);
    }

    pub(crate) fn unthrottle(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        if svc.is_throttled {
            svc.is_throttled = false;
            info!("{}: throttle released", svc.label());
        }
        self.reconcile_listen_state(id);
    }

    /// Ask every current worker of `id` to terminate. Workers stay in the
    /// process table until reaped but stop counting towards the service.
    pub(crate) fn delete_children(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        let mut pids: Vec<Pid> = svc.children.iter().copied().collect();
        pids.sort_by_key(|pid| pid.as_raw());
        for pid in pids {
            let Some(proc) = self.procs.get_mut(pid) else {
                panic!("{}: child {pid} missing from the process table", svc.label());
            };
            if proc.retired {
                continue;
            }
            proc.retired = true;
            match self.control.terminate(pid) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!("{}: kill {pid}: {e}", svc.label()),
            }
        }
        svc.total_worker_count = 0;
        svc.available_worker_count = 0;
        svc.starting_worker_count = 0;
        svc.at_ceiling = false;
    }

    /// Replace every worker of `id`. Existing workers drain on their own
    /// schedule; new ones start under the current configuration and a new
    /// generation. After a reload, listening resumes right away.
    pub(crate) fn restart_service(&mut self, id: ServiceId, reload_occurred: bool) {
        self.delete_children(id);
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        svc.generation = svc.generation.wrapping_add(1);
        debug!("{}: restarted, generation {}", svc.label(), svc.generation);
        self.arm_wakeup(id);
        if reload_occurred {
            self.reconcile_listen_state(id);
        }
    }

    /// Drop a descriptor for good.
    pub(crate) fn free_service(&mut self, id: ServiceId) {
        if let Some(svc) = self.services.remove(&id) {
            self.events.disable_read(svc.status.as_raw_fd());
            for endpoint in &svc.listen_endpoints {
                self.events.disable_read(endpoint.as_raw_fd());
            }
            self.events.cancel_timer(TimerKind::Unthrottle(id));
            self.events.cancel_timer(TimerKind::Wakeup(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::event::{Event, Token};
    use crate::service::spec::tests::definition;
    use crate::status::{Availability, StatusRecord};
    use crate::supervisor::tests::{harness, service_id, spawn_via_listen};
    use crate::worker::WorkerOptions;

    fn spec_for(name: &str, transport: &str, limit: u32) -> ServiceSpec {
        let mut def = definition(name, transport);
        def.process_limit = Some(limit);
        let global = crate::config::GlobalSettings {
            inet_interfaces: vec!["127.0.0.1".into()],
            ..Default::default()
        };
        ServiceSpec::from_definition(&def, &global, &crate::service::spec::tests::names()).unwrap()
    }

    #[test]
    fn solitary_and_unlimited_flags() {
        let argv = worker_argv(&spec_for("qmgr", "fifo", 1), 0, None);
        assert!(argv.contains(&"-l".to_string()), "{argv:?}");
        assert!(!argv.contains(&"-z".to_string()));

        let argv = worker_argv(&spec_for("proxymap", "unix", 0), 0, None);
        assert!(argv.contains(&"-z".to_string()), "{argv:?}");
        assert!(!argv.contains(&"-l".to_string()));
    }

    #[test]
    fn name_flag_only_when_program_differs() {
        let mut spec = spec_for("worker", "unix", 5);
        assert!(!worker_argv(&spec, 0, None).contains(&"-n".to_string()));

        spec.canonical_name = "cleanup".into();
        let argv = worker_argv(&spec, 0, None);
        assert!(argv.windows(2).any(|w| w == ["-n", "cleanup"]), "{argv:?}");
    }

    #[test]
    fn argv_parses_back_with_the_worker_parser() {
        let mut spec = spec_for("25", "inet", 1);
        spec.argument_vector = vec!["-o".into(), "smtpd_tls_security_level=may".into()];
        let argv = worker_argv(&spec, 2, Some(true));
        let opts = WorkerOptions::parse_argv(&argv).unwrap();

        assert_eq!(opts.transport, spec.transport);
        assert_eq!(opts.service_name.as_deref(), Some("smtp"));
        assert!(opts.solitary);
        assert!(!opts.unlimited);
        assert!(opts.unprivileged);
        assert_eq!(opts.verbose, 2);
        assert!(opts.stress());
        assert_eq!(opts.override_value("smtpd_tls_security_level"), Some("may"));

        let opts = WorkerOptions::parse_argv(worker_argv(&spec, 0, Some(false))).unwrap();
        assert!(!opts.stress());
    }

    #[test]
    fn environment_carries_the_generation() {
        let (clear, env) = worker_env(None, 7);
        assert!(!clear);
        assert_eq!(env, vec![(OsString::from("GENERATION"), OsString::from("7"))]);

        let (clear, env) = worker_env(Some(&["MASTERD_TEST_SURELY_UNSET".to_string()]), 0);
        assert!(clear);
        assert_eq!(env.len(), 1);
    }

    #[test]
    fn spawned_worker_gets_the_fd_contract() {
        let (mut sup, _dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        spawn_via_listen(&mut sup, id);

        let spawned = sup.control().spawned.last().unwrap();
        assert_eq!(spawned.slots, vec![3, 4, 5, 6]);
        assert!(spawned.env.contains(&(OsString::from("GENERATION"), OsString::from("0"))));
        let svc = &sup.services[&id];
        assert_eq!(svc.total_worker_count, 1);
        assert_eq!(svc.starting_worker_count, 1);
        assert!(svc.children.contains(&spawned.pid));
        sup.check_invariants();
    }

    #[test]
    fn crash_on_startup_throttles_until_the_timer_fires() {
        let (mut sup, _dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        let pid = spawn_via_listen(&mut sup, id);

        sup.control_mut().exit(pid, ExitReport::Exited(1));
        sup.reap_children();

        let svc = &sup.services[&id];
        assert!(svc.is_throttled);
        assert!(!svc.is_listening);
        assert_eq!(svc.total_worker_count, 0);
        assert!(sup.worker(pid).is_none());
        let deadline = sup.events.timer_deadline(TimerKind::Unthrottle(id)).unwrap();
        assert_eq!(deadline, sup.now() + Duration::from_secs(60));
        sup.check_invariants();

        sup.handle_event(Event::Timer(TimerKind::Unthrottle(id)));
        let svc = &sup.services[&id];
        assert!(!svc.is_throttled);
        assert!(svc.is_listening);
    }

    #[test]
    fn exit_after_serving_is_not_a_crash() {
        let (mut sup, _dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        let pid = spawn_via_listen(&mut sup, id);
        sup.apply_status(
            id,
            StatusRecord {
                pid: pid.as_raw(),
                generation: 0,
                availability: Availability::Available,
            },
        );

        sup.control_mut().exit(pid, ExitReport::Exited(0));
        sup.reap_children();

        let svc = &sup.services[&id];
        assert!(!svc.is_throttled);
        assert_eq!(svc.available_worker_count, 0);
        assert!(svc.is_listening);
        sup.check_invariants();
    }

    #[test]
    fn spawn_failure_throttles() {
        let (mut sup, _dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        sup.control_mut().fail_spawns = true;
        sup.handle_event(Event::Readable(Token::Listen(id)));

        let svc = &sup.services[&id];
        assert!(svc.is_throttled);
        assert_eq!(svc.total_worker_count, 0);
        assert!(sup.control().spawned.is_empty());
    }

    #[test]
    fn restart_retires_workers_and_bumps_generation() {
        let (mut sup, _dir) = harness(vec![definition("echo", "unix")]);
        let id = service_id(&sup, "echo");
        let old = spawn_via_listen(&mut sup, id);

        sup.restart_service(id, true);
        let svc = &sup.services[&id];
        assert_eq!(svc.generation, 1);
        assert_eq!(svc.total_worker_count, 0);
        assert!(svc.is_listening);
        assert_eq!(sup.control().terminated, vec![old]);
        assert!(sup.worker(old).unwrap().retired);
        sup.check_invariants();

        let new = spawn_via_listen(&mut sup, id);
        let spawned = sup.control().spawned.last().unwrap();
        assert_eq!(spawned.pid, new);
        assert!(spawned.env.contains(&(OsString::from("GENERATION"), OsString::from("1"))));

        // The retired worker goes away without throttling anything.
        sup.control_mut().exit(old, ExitReport::Signaled(nix::sys::signal::Signal::SIGTERM));
        sup.reap_children();
        let svc = &sup.services[&id];
        assert!(!svc.is_throttled);
        assert_eq!(svc.total_worker_count, 1);
        assert!(!svc.children.contains(&old));
        sup.check_invariants();
    }
}
