//! Admission control: when a service's listening endpoints are watched by
//! the supervisor, and the stress escalation that kicks in when a service
//! keeps running into its process limit.

use std::os::fd::AsRawFd;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use nix::unistd::Pid;

use crate::event::{EventLoop, Token};
use crate::process::{ProcessControl, WorkerState};
use crate::service::{ServiceDescriptor, ServiceId};
use crate::supervisor::Supervisor;

/// Length of a stress period, and the window for the busy warning and for
/// counting repeated ceiling hits.
pub const STRESS_WINDOW: Duration = Duration::from_secs(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Throttled,
    /// An idle worker will accept by itself.
    IdleWorkers,
    /// A freshly spawned worker will pick up the pending connection.
    Starting,
    Accept,
    /// Process limit reached and nobody idle.
    Ceiling,
}

fn decide(svc: &ServiceDescriptor) -> Decision {
    if svc.is_throttled {
        Decision::Throttled
    } else if svc.available_worker_count > 0 {
        Decision::IdleWorkers
    } else if svc.starting_worker_count > 0 {
        Decision::Starting
    } else if svc.below_ceiling() {
        Decision::Accept
    } else {
        Decision::Ceiling
    }
}

/// Turn readiness notification for the whole endpoint set on or off. Only
/// touches the event loop on an actual change.
pub(crate) fn set_listening(events: &mut EventLoop, svc: &mut ServiceDescriptor, on: bool) {
    if svc.is_listening == on {
        return;
    }
    for endpoint in &svc.listen_endpoints {
        if on {
            events.enable_read(endpoint.as_raw_fd(), Token::Listen(svc.id));
        } else {
            events.disable_read(endpoint.as_raw_fd());
        }
    }
    svc.is_listening = on;
}

fn older_than(then: Option<Instant>, now: Instant, window: Duration) -> bool {
    then.is_none_or(|t| now.saturating_duration_since(t) >= window)
}

impl<P: ProcessControl> Supervisor<P> {
    /// Bring the listen state of `id` in line with its counters. Idempotent;
    /// call after every counter change.
    pub(crate) fn reconcile_listen_state(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        if !svc.is_active() {
            set_listening(&mut self.events, svc, false);
            return;
        }

        let decision = decide(svc);
        debug!(
            "{}: avail {} starting {} total {} max {} -> {decision:?}",
            svc.label(),
            svc.available_worker_count,
            svc.starting_worker_count,
            svc.total_worker_count,
            svc.spec.max_concurrency
        );
        let hit = decision == Decision::Ceiling && !svc.at_ceiling;
        svc.at_ceiling = decision == Decision::Ceiling;
        set_listening(&mut self.events, svc, decision == Decision::Accept);

        if hit && svc.spec.stress_capable && self.ceiling_hit(id) {
            self.reconcile_listen_state(id);
        }
    }

    /// Record one more entry into the ceiling state. Returns whether the
    /// service was restarted in stress mode.
    fn ceiling_hit(&mut self, id: ServiceId) -> bool {
        let now = self.now;
        let Some(svc) = self.services.get_mut(&id) else {
            return false;
        };

        if older_than(svc.last_busy_warning_time, now, STRESS_WINDOW) {
            svc.last_busy_warning_time = Some(now);
            warn!(
                "service \"{}\" ({}) has reached its process limit \"{}\": new clients may be delayed",
                svc.spec.external_name, svc.spec.canonical_name, svc.spec.max_concurrency
            );
            warn!("to avoid this condition, increase the process limit or reduce the service time per client");
        }

        let previous = svc.last_ceiling_hit.replace(now);
        if svc.stress_active(now) {
            svc.stress_active_until = Some(now + STRESS_WINDOW);
            return false;
        }
        if older_than(previous, now, STRESS_WINDOW) {
            return false;
        }

        svc.stress_active_until = Some(now + STRESS_WINDOW);
        info!("{}: process limit reached repeatedly, restarting in stress mode", svc.label());
        self.restart_service(id, false);
        true
    }

    /// A worker reported itself idle.
    ///
    /// # Panics
    ///
    /// If the worker is already available, or is not owned by a known service.
    pub(crate) fn register_worker_available(&mut self, pid: Pid) {
        let proc = self
            .procs
            .get_mut(pid)
            .unwrap_or_else(|| panic!("register_worker_available: unknown pid {pid}"));
        let previous = proc.state;
        if previous == WorkerState::Available {
            panic!("register_worker_available: pid {pid} is already available");
        }
        let id = proc.service;
        proc.state = WorkerState::Available;
        proc.ever_available = true;

        let svc = self
            .services
            .get_mut(&id)
            .unwrap_or_else(|| panic!("pid {pid} belongs to unknown service {id}"));
        if previous == WorkerState::Spawning {
            svc.starting_worker_count -= 1;
        }
        svc.available_worker_count += 1;
        self.reconcile_listen_state(id);
    }

    /// A worker reported that it took a request.
    ///
    /// # Panics
    ///
    /// If the worker is already busy, or is not owned by a known service.
    pub(crate) fn register_worker_busy(&mut self, pid: Pid) {
        let proc = self
            .procs
            .get_mut(pid)
            .unwrap_or_else(|| panic!("register_worker_busy: unknown pid {pid}"));
        let previous = proc.state;
        let id = proc.service;
        match previous {
            WorkerState::Busy => panic!("register_worker_busy: pid {pid} is not available"),
            WorkerState::Available => proc.request_count += 1,
            WorkerState::Spawning => {}
        }
        proc.state = WorkerState::Busy;

        let svc = self
            .services
            .get_mut(&id)
            .unwrap_or_else(|| panic!("pid {pid} belongs to unknown service {id}"));
        match previous {
            WorkerState::Available => svc.available_worker_count -= 1,
            WorkerState::Spawning => svc.starting_worker_count -= 1,
            WorkerState::Busy => {}
        }
        self.reconcile_listen_state(id);
    }

    /// Stop a service: terminate its workers and stop listening no matter
    /// what the counters say.
    pub(crate) fn deactivate(&mut self, id: ServiceId) {
        self.delete_children(id);
        if let Some(svc) = self.services.get_mut(&id) {
            set_listening(&mut self.events, svc, false);
            svc.at_ceiling = false;
        }
    }
}
