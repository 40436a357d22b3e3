//! End-to-end scenarios: a configuration file on disk, a supervisor over a
//! recording process layer, and status records written through the real
//! status pipes the workers would inherit.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File};
use std::io;
use std::path::Path;

use nix::unistd::Pid;
use tempfile::TempDir;

use masterd::config::MasterConfig;
use masterd::event::{Event, TimerKind, Token};
use masterd::fd::STATUS_FD;
use masterd::process::{ExitReport, ProcessControl, SpawnRequest};
use masterd::service::names::ServiceNames;
use masterd::service::{ServiceId, TransportType};
use masterd::status::{Availability, GENERATION_ENV, StatusRecord, send_status};
use masterd::{Settings, Supervisor};

/// Stands in for fork/exec: keeps each worker's copy of the status pipe so
/// the test can speak for it.
#[derive(Default)]
struct Recorder {
    next_pid: i32,
    argv: HashMap<Pid, Vec<String>>,
    generation: HashMap<Pid, u32>,
    status: HashMap<Pid, File>,
    exits: VecDeque<(Pid, ExitReport)>,
    terminated: Vec<Pid>,
}

impl ProcessControl for Recorder {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> io::Result<Pid> {
        self.next_pid += 1;
        let pid = Pid::from_raw(2000 + self.next_pid);
        let (status, _) = request
            .inherit
            .iter()
            .find(|(_, slot)| *slot == STATUS_FD)
            .ok_or_else(|| io::Error::other("no status descriptor"))?;
        self.status.insert(pid, File::from(status.try_clone_to_owned()?));
        let generation = request
            .env
            .iter()
            .find(|(key, _)| key == GENERATION_ENV)
            .and_then(|(_, value)| value.to_str()?.parse().ok())
            .ok_or_else(|| io::Error::other("no GENERATION"))?;
        self.generation.insert(pid, generation);
        self.argv.insert(pid, request.argv.to_vec());
        Ok(pid)
    }

    fn terminate(&mut self, pid: Pid) -> nix::Result<()> {
        self.terminated.push(pid);
        Ok(())
    }

    fn reap(&mut self) -> nix::Result<Option<(Pid, ExitReport)>> {
        Ok(self.exits.pop_front())
    }
}

impl Recorder {
    fn report(&mut self, pid: Pid, availability: Availability) {
        let record = StatusRecord {
            pid: pid.as_raw(),
            generation: self.generation[&pid],
            availability,
        };
        let pipe = self.status.get_mut(&pid).expect("unknown worker");
        send_status(pipe, &record).unwrap();
    }
}

fn write_config(dir: &Path, services: &str) -> MasterConfig {
    let path = dir.join("master.toml");
    let text = format!(
        r#"
        [global]
        pid_file = "{dir}/masterd.pid"
        socket_directory = "{dir}"
        inet_interfaces = ["127.0.0.1"]
        service_throttle_time = 30

        {services}
        "#,
        dir = dir.display()
    );
    fs::write(&path, text).unwrap();
    MasterConfig::load(&path).unwrap()
}

fn start(services: &str) -> (Supervisor<Recorder>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("private")).unwrap();
    fs::create_dir(dir.path().join("public")).unwrap();
    let cfg = write_config(dir.path(), services);
    let settings = Settings::from_config(dir.path().join("master.toml"), &cfg.global, 1).unwrap();
    let mut sup = Supervisor::new(Recorder::default(), settings, ServiceNames::default()).unwrap();
    let summary = sup.apply_config(&cfg).unwrap();
    assert_eq!(summary.added, cfg.services.len());
    sup.check_invariants();
    (sup, dir)
}

fn id_of(sup: &Supervisor<Recorder>, name: &str, transport: TransportType) -> ServiceId {
    sup.service(name, transport).expect("service not configured").id
}

fn connect(sup: &mut Supervisor<Recorder>, id: ServiceId) -> Pid {
    sup.handle_event(Event::Readable(Token::Listen(id)));
    let pid = Pid::from_raw(2000 + sup.control().next_pid);
    assert!(sup.worker(pid).is_some(), "no worker spawned");
    pid
}

fn report(sup: &mut Supervisor<Recorder>, id: ServiceId, pid: Pid, availability: Availability) {
    sup.control_mut().report(pid, availability);
    sup.handle_event(Event::Readable(Token::Status(id)));
    sup.check_invariants();
}

const CLEANUP: &str = r#"
    [[services]]
    name = "cleanup"
    transport = "unix"
    command = "/usr/libexec/masterd/cleanup"
    process_limit = 2
"#;

#[test]
fn worker_availability_drives_listening() {
    let (mut sup, _dir) = start(CLEANUP);
    let id = id_of(&sup, "cleanup", TransportType::Unix);
    assert!(sup.service_by_id(id).unwrap().is_listening);

    let first = connect(&mut sup, id);
    assert!(!sup.service_by_id(id).unwrap().is_listening, "starting worker takes the next client");
    assert!(sup.control().argv[&first].iter().any(|arg| arg == "-v"), "verbosity passed on");

    report(&mut sup, id, first, Availability::Available);
    assert!(!sup.service_by_id(id).unwrap().is_listening, "idle worker accepts itself");

    report(&mut sup, id, first, Availability::Busy);
    assert!(sup.service_by_id(id).unwrap().is_listening, "room for a second worker");

    let second = connect(&mut sup, id);
    report(&mut sup, id, second, Availability::Busy);
    let svc = sup.service_by_id(id).unwrap();
    assert_eq!(svc.total_worker_count, 2);
    assert!(!svc.is_listening, "at the process limit");
}

#[test]
fn crash_before_first_report_throttles_the_service() {
    let (mut sup, _dir) = start(CLEANUP);
    let id = id_of(&sup, "cleanup", TransportType::Unix);
    let pid = connect(&mut sup, id);

    sup.control_mut().exits.push_back((pid, ExitReport::Exited(1)));
    sup.reap_children();
    sup.check_invariants();
    let svc = sup.service_by_id(id).unwrap();
    assert!(svc.is_throttled);
    assert!(!svc.is_listening);
    let deadline = sup.events().timer_deadline(TimerKind::Unthrottle(id)).unwrap();
    assert_eq!(deadline - sup.now(), std::time::Duration::from_secs(30));

    sup.handle_event(Event::Timer(TimerKind::Unthrottle(id)));
    let svc = sup.service_by_id(id).unwrap();
    assert!(!svc.is_throttled);
    assert!(svc.is_listening);
    sup.check_invariants();
}

#[test]
fn worker_that_served_exits_without_throttling() {
    let (mut sup, _dir) = start(CLEANUP);
    let id = id_of(&sup, "cleanup", TransportType::Unix);
    let pid = connect(&mut sup, id);
    report(&mut sup, id, pid, Availability::Available);

    sup.control_mut().exits.push_back((pid, ExitReport::Exited(0)));
    sup.reap_children();
    sup.check_invariants();
    let svc = sup.service_by_id(id).unwrap();
    assert!(!svc.is_throttled);
    assert!(svc.is_listening);
    assert_eq!(sup.worker_count(), 0);
}

#[test]
fn reload_from_disk_swaps_services() {
    let (mut sup, dir) = start(CLEANUP);
    let cleanup = id_of(&sup, "cleanup", TransportType::Unix);
    let busy = connect(&mut sup, cleanup);
    report(&mut sup, cleanup, busy, Availability::Busy);

    let cfg = write_config(
        dir.path(),
        r#"
        [[services]]
        name = "pickup"
        transport = "fifo"
        command = "/usr/libexec/masterd/pickup"
        process_limit = 1
        wakeup = 60
        "#,
    );
    let summary = sup.apply_config(&cfg).unwrap();
    assert_eq!((summary.added, summary.removed), (1, 1));
    sup.check_invariants();

    assert!(sup.service("cleanup", TransportType::Unix).is_none());
    assert_eq!(sup.control().terminated, vec![busy], "removed service's worker told to stop");
    let pickup = id_of(&sup, "pickup", TransportType::Fifo);
    assert!(sup.events().timer_deadline(TimerKind::Wakeup(pickup)).is_some());

    sup.control_mut().exits.push_back((busy, ExitReport::Exited(0)));
    sup.reap_children();
    sup.check_invariants();
    assert!(sup.service_by_id(cleanup).is_none(), "drained service freed");
    assert_eq!(sup.services().count(), 1);
}

#[test]
fn broken_reload_keeps_the_running_table() {
    let (mut sup, dir) = start(CLEANUP);
    let id = id_of(&sup, "cleanup", TransportType::Unix);

    let path = dir.path().join("master.toml");
    fs::write(&path, "[[services]]\nname = \"x\"\ntransport = \"carrier-pigeon\"\ncommand = \"x\"\n").unwrap();
    let err = MasterConfig::load(&path).and_then(|cfg| sup.apply_config(&cfg)).unwrap_err();
    assert_eq!(err.severity(masterd::Phase::Reload), masterd::Severity::Recoverable);

    assert_eq!(id_of(&sup, "cleanup", TransportType::Unix), id);
    assert!(sup.service_by_id(id).unwrap().is_listening);
    sup.check_invariants();
}
