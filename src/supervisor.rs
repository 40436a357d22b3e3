//! Process-wide supervisor state and the main loop.
//!
//! Everything mutable lives in [`Supervisor`] and is only touched from the
//! loop's thread. Components are `impl` blocks on it, spread over
//! `admission`, `spawn`, `wakeup` and `service::reconcile`.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::unistd::Pid;

use crate::config::{GlobalSettings, MasterConfig};
use crate::error::{MasterError, Phase, Result, Severity};
use crate::event::{Event, EventLoop, TimerKind, Token};
use crate::fd::FlowPipe;
use crate::listener::Owner;
use crate::process::{ProcessControl, ProcessTable, WorkerProcess, WorkerState};
use crate::service::names::ServiceNames;
use crate::service::{ServiceDescriptor, ServiceId, TransportType};
use crate::signals::{self, SignalPipe};
use crate::status::{Availability, StatusRead, StatusRecord};
use crate::watchdog::Watchdog;

/// Runtime settings derived from the global configuration section and the
/// command line.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Re-read on every reload.
    pub config_path: PathBuf,
    /// Passed to workers as repeated `-v`.
    pub verbosity: u8,
    pub import_environment: Option<Vec<String>>,
    pub owner: Option<Owner>,
    pub max_wait: Duration,
    pub watchdog_timeout: Duration,
}

impl Settings {
    pub fn from_config(config_path: PathBuf, global: &GlobalSettings, verbosity: u8) -> Result<Self> {
        let owner = global.mail_owner.as_deref().map(Owner::lookup).transpose()?;
        let mut max_wait = global.max_wait.max(1);
        if max_wait >= global.watchdog_timeout {
            let clamped = (global.watchdog_timeout / 2).max(1);
            warn!(
                "max_wait {max_wait}s is not below watchdog_timeout {}s, using {clamped}s",
                global.watchdog_timeout
            );
            max_wait = clamped;
        }
        Ok(Self {
            config_path,
            verbosity,
            import_environment: global.import_environment.clone(),
            owner,
            max_wait: Duration::from_secs(max_wait),
            watchdog_timeout: Duration::from_secs(global.watchdog_timeout),
        })
    }
}

pub struct Supervisor<P: ProcessControl> {
    pub(crate) services: BTreeMap<ServiceId, ServiceDescriptor>,
    pub(crate) procs: ProcessTable,
    pub(crate) events: EventLoop,
    pub(crate) control: P,
    pub(crate) settings: Settings,
    pub(crate) names: ServiceNames,
    pub(crate) flow: FlowPipe,
    /// Time of the current loop iteration.
    pub(crate) now: Instant,
    next_id: u64,
}

impl<P: ProcessControl> Supervisor<P> {
    pub fn new(control: P, settings: Settings, names: ServiceNames) -> Result<Self> {
        let flow = FlowPipe::new().map_err(|source| MasterError::Setup {
            what: "flow control pipe",
            source,
        })?;
        Ok(Self {
            services: BTreeMap::new(),
            procs: ProcessTable::default(),
            events: EventLoop::new(settings.max_wait),
            control,
            settings,
            names,
            flow,
            now: Instant::now(),
            next_id: 1,
        })
    }

    pub(crate) fn allocate_id(&mut self) -> ServiceId {
        let id = ServiceId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn services(&self) -> impl Iterator<Item = &ServiceDescriptor> {
        self.services.values()
    }

    /// The active service with this canonical name and transport.
    pub fn service(&self, canonical_name: &str, transport: TransportType) -> Option<&ServiceDescriptor> {
        self.services.values().find(|svc| {
            svc.is_active() && svc.spec.canonical_name == canonical_name && svc.spec.transport == transport
        })
    }

    /// Any descriptor, draining ones included.
    pub fn service_by_id(&self, id: ServiceId) -> Option<&ServiceDescriptor> {
        self.services.get(&id)
    }

    pub fn worker(&self, pid: Pid) -> Option<&WorkerProcess> {
        self.procs.get(pid)
    }

    pub fn worker_count(&self) -> usize {
        self.procs.len()
    }

    pub fn control(&self) -> &P {
        &self.control
    }

    pub fn control_mut(&mut self) -> &mut P {
        &mut self.control
    }

    pub fn events(&self) -> &EventLoop {
        &self.events
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Override the loop clock; timers armed afterwards count from `now`.
    pub fn set_now(&mut self, now: Instant) {
        self.now = now;
    }

    /// Dispatch one event from the event loop.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Readable(Token::Listen(id)) => self.on_listen_ready(id),
            Event::Readable(Token::Status(id)) => self.on_status_ready(id),
            Event::Readable(Token::Signal) => signals::drain(),
            Event::Timer(TimerKind::Unthrottle(id)) => self.unthrottle(id),
            Event::Timer(TimerKind::Wakeup(id)) => self.on_wakeup(id),
            Event::Timer(TimerKind::Exit) => {}
        }
    }

    /// A connection (or fifo data) is waiting and no worker is idle.
    fn on_listen_ready(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get(&id) else {
            return;
        };
        // A readiness report can be stale when several endpoints of one
        // service fired in the same pass.
        if !svc.is_listening {
            return;
        }
        self.spawn_worker(id);
    }

    fn on_status_ready(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get_mut(&id) else {
            return;
        };
        let label = svc.label();
        match svc.status.read_one() {
            Ok(StatusRead::Record(record)) => self.apply_status(id, record),
            Ok(StatusRead::Empty) => {}
            Ok(StatusRead::Partial { len, pid: Some(pid) }) => {
                warn!("{label}: partial status update ({len} bytes) from pid {pid}")
            }
            Ok(StatusRead::Partial { len, pid: None }) => {
                warn!("{label}: partial status update ({len} bytes)")
            }
            Ok(StatusRead::Garbled { pid, value }) => {
                warn!("{label}: pid {pid}: ignoring unknown status {value}")
            }
            Err(e) => warn!("{label}: read status pipe: {e}"),
        }
    }

    /// Apply one decoded status record received on `id`'s pipe.
    ///
    /// # Panics
    ///
    /// If the sender belongs to a different service.
    pub(crate) fn apply_status(&mut self, id: ServiceId, record: StatusRecord) {
        let pid = Pid::from_raw(record.pid);
        let Some(proc) = self.procs.get(pid) else {
            debug!("status from unknown pid {pid}, probably already reaped");
            return;
        };
        if proc.service != id {
            panic!(
                "pid {pid} of service {} reported on the status pipe of {id}",
                proc.service
            );
        }
        if proc.retired {
            return;
        }
        if record.generation != proc.generation {
            debug!(
                "pid {pid}: ignoring status from generation {} (current {})",
                record.generation, proc.generation
            );
            return;
        }
        match (record.availability, proc.state) {
            (Availability::Available, WorkerState::Available) | (Availability::Busy, WorkerState::Busy) => {}
            (Availability::Available, _) => self.register_worker_available(pid),
            (Availability::Busy, _) => self.register_worker_busy(pid),
        }
    }

    /// Read the configuration again and reconcile.
    fn reload(&mut self) {
        info!("reload requested, reading {}", self.settings.config_path.display());
        let result = MasterConfig::load(&self.settings.config_path).and_then(|cfg| self.apply_config(&cfg));
        match result {
            Ok(summary) => info!("reload: {summary}"),
            Err(e) => match e.severity(Phase::Reload) {
                Severity::Recoverable => error!("reload aborted, keeping current configuration: {e}"),
                Severity::Fatal => panic!("reload: {e}"),
            },
        }
    }

    /// Run until the optional exit timer fires. Termination signals end the
    /// process from the signal handler instead.
    pub fn run(&mut self, signal_pipe: &SignalPipe, watchdog: &Watchdog, exit_after: Option<Duration>) -> Result<()> {
        self.events.enable_read(signal_pipe.as_raw_fd(), Token::Signal);
        self.now = Instant::now();
        if let Some(delay) = exit_after {
            self.events.arm_timer(TimerKind::Exit, delay, self.now);
        }

        loop {
            watchdog.arm();
            let events = self
                .events
                .run_once()
                .map_err(|source| MasterError::EventLoop { source })?;
            self.now = Instant::now();

            for event in events {
                if event == Event::Timer(TimerKind::Exit) {
                    info!("exit timer expired, shutting down");
                    watchdog.disarm();
                    return Ok(());
                }
                self.handle_event(event);
            }

            if signals::take_reload() {
                self.reload();
                watchdog.set_timeout(self.settings.watchdog_timeout);
            }
            if signals::take_child_exit() {
                self.reap_children();
            }
            watchdog.disarm();
        }
    }

    /// Check every counter and index against the process table.
    ///
    /// # Panics
    ///
    /// On the first violation found.
    pub fn check_invariants(&self) {
        let mut counted: HashMap<ServiceId, (u32, u32, u32)> = HashMap::new();
        for proc in self.procs.iter() {
            let svc = self
                .services
                .get(&proc.service)
                .unwrap_or_else(|| panic!("pid {} owned by missing service {}", proc.pid, proc.service));
            assert!(
                svc.children.contains(&proc.pid),
                "{}: pid {} missing from children",
                svc.label(),
                proc.pid
            );
            if !proc.retired {
                let entry = counted.entry(proc.service).or_default();
                entry.0 += 1;
                match proc.state {
                    WorkerState::Available => entry.1 += 1,
                    WorkerState::Spawning => entry.2 += 1,
                    WorkerState::Busy => {}
                }
            }
        }

        for svc in self.services.values() {
            let label = svc.label();
            for pid in &svc.children {
                let proc = self
                    .procs
                    .get(*pid)
                    .unwrap_or_else(|| panic!("{label}: child {pid} not in process table"));
                assert_eq!(proc.service, svc.id, "{label}: child {pid} owned by {}", proc.service);
            }
            let (total, available, starting) = counted.get(&svc.id).copied().unwrap_or_default();
            assert_eq!(svc.total_worker_count, total, "{label}: total");
            assert_eq!(svc.available_worker_count, available, "{label}: available");
            assert_eq!(svc.starting_worker_count, starting, "{label}: starting");
            if svc.spec.max_concurrency > 0 {
                assert!(svc.total_worker_count <= svc.spec.max_concurrency, "{label}: over limit");
            }
            if svc.is_listening {
                assert!(
                    svc.available_worker_count == 0
                        && svc.starting_worker_count == 0
                        && !svc.is_throttled
                        && svc.below_ceiling()
                        && svc.is_active(),
                    "{label}: listening against policy"
                );
            }
            for endpoint in &svc.listen_endpoints {
                assert_eq!(
                    self.events.is_registered(endpoint.as_raw_fd()),
                    svc.is_listening,
                    "{label}: {} watch state",
                    endpoint.addr()
                );
            }
            assert!(
                self.events.is_registered(svc.status.as_raw_fd()),
                "{label}: status pipe not watched"
            );
        }
    }
}
