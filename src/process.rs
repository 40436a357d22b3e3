//! The process table and the OS primitives behind spawning and reaping.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use crate::service::ServiceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Spawned, no status record seen yet.
    Spawning,
    Busy,
    Available,
}

/// One live worker process.
#[derive(Debug, Clone)]
pub struct WorkerProcess {
    pub pid: Pid,
    pub generation: u32,
    pub state: WorkerState,
    pub service: ServiceId,
    /// Requests served, counted on each Available → Busy transition.
    pub request_count: u64,
    pub ever_available: bool,
    /// Told to terminate by the supervisor; no longer counted by its service.
    pub retired: bool,
}

impl WorkerProcess {
    pub fn new(pid: Pid, service: ServiceId, generation: u32) -> Self {
        Self {
            pid,
            generation,
            state: WorkerState::Spawning,
            service,
            request_count: 0,
            ever_available: false,
            retired: false,
        }
    }
}

/// Owns every [`WorkerProcess`]; services only keep pids.
#[derive(Debug, Default)]
pub struct ProcessTable {
    procs: HashMap<Pid, WorkerProcess>,
}

impl ProcessTable {
    pub fn insert(&mut self, proc: WorkerProcess) {
        if let Some(old) = self.procs.insert(proc.pid, proc) {
            panic!("process table: duplicate pid {}", old.pid);
        }
    }

    pub fn get(&self, pid: Pid) -> Option<&WorkerProcess> {
        self.procs.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut WorkerProcess> {
        self.procs.get_mut(&pid)
    }

    pub fn remove(&mut self, pid: Pid) -> Option<WorkerProcess> {
        self.procs.remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.procs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerProcess> {
        self.procs.values()
    }
}

/// Everything needed to start one worker.
#[derive(Debug)]
pub struct SpawnRequest<'a> {
    pub service: &'a str,
    pub command: &'a Path,
    /// Full argument vector, `argv[0]` included.
    pub argv: &'a [String],
    /// Replace the environment with `env` instead of extending it.
    pub env_clear: bool,
    pub env: Vec<(OsString, OsString)>,
    /// Descriptors to place on fixed slots in the child: `(source, slot)`.
    pub inherit: Vec<(BorrowedFd<'a>, RawFd)>,
}

/// How a reaped process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReport {
    Exited(i32),
    Signaled(Signal),
}

impl ExitReport {
    pub fn is_normal(self) -> bool {
        matches!(self, ExitReport::Exited(0))
    }

    pub fn is_sigterm(self) -> bool {
        matches!(self, ExitReport::Signaled(Signal::SIGTERM))
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReport::Exited(code) => write!(f, "exit status {code}"),
            ExitReport::Signaled(sig) => write!(f, "killed by signal {}", sig.as_str()),
        }
    }
}

/// The OS-process operations the lifecycle manager needs.
pub trait ProcessControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> io::Result<Pid>;

    /// Ask a worker to terminate gracefully.
    fn terminate(&mut self, pid: Pid) -> nix::Result<()>;

    /// Collect one terminated child without blocking.
    fn reap(&mut self) -> nix::Result<Option<(Pid, ExitReport)>>;
}

/// fork/exec based implementation.
#[derive(Debug, Default)]
pub struct OsProcessControl;

impl ProcessControl for OsProcessControl {
    fn spawn(&mut self, request: &SpawnRequest<'_>) -> io::Result<Pid> {
        let mut cmd = Command::new(request.command);
        if let Some((arg0, rest)) = request.argv.split_first() {
            cmd.arg0(arg0).args(rest);
        }
        if request.env_clear {
            cmd.env_clear();
        }
        cmd.envs(request.env.iter().map(|(k, v)| (k, v)));
        cmd.stdin(Stdio::null());

        let moves: Vec<(RawFd, RawFd)> = request
            .inherit
            .iter()
            .map(|(fd, slot)| (fd.as_raw_fd(), *slot))
            .collect();
        let highest_slot = moves.iter().map(|&(_, slot)| slot).max().unwrap_or(2);
        let mut scratch: Vec<RawFd> = vec![-1; moves.len()];

        // SAFETY: the closure runs between fork and exec and only calls
        // async-signal-safe functions on preallocated storage.
        unsafe {
            cmd.pre_exec(move || renumber_fds(&moves, &mut scratch, highest_slot + 1));
        }

        // `spawn` opens its exec-error pipe in the parent; it must not land
        // on a slot the child overwrites before exec.
        let reserved = reserve_slots(highest_slot)?;
        let child = cmd.spawn();
        drop(reserved);
        Ok(Pid::from_raw(child?.id() as i32))
    }

    fn terminate(&mut self, pid: Pid) -> nix::Result<()> {
        signal::kill(pid, Signal::SIGTERM)
    }

    fn reap(&mut self) -> nix::Result<Option<(Pid, ExitReport)>> {
        loop {
            return match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => Ok(Some((pid, ExitReport::Exited(code)))),
                Ok(WaitStatus::Signaled(pid, sig, _)) => Ok(Some((pid, ExitReport::Signaled(sig)))),
                Ok(_) => Ok(None),
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => Ok(None),
                Err(e) => Err(e),
            };
        }
    }
}

/// Occupy every free descriptor up to `highest` with close-on-exec
/// placeholders until dropped.
fn reserve_slots(highest: RawFd) -> io::Result<Vec<OwnedFd>> {
    let mut held = Vec::new();
    loop {
        let fd = OwnedFd::from(File::open("/dev/null")?);
        if fd.as_raw_fd() > highest {
            return Ok(held);
        }
        held.push(fd);
    }
}

/// Move inherited descriptors onto their slots in the child.
///
/// Sources may already sit on a target slot, so every source is first copied
/// above the highest slot and only then duplicated into place.
fn renumber_fds(moves: &[(RawFd, RawFd)], scratch: &mut [RawFd], above: RawFd) -> io::Result<()> {
    for (i, &(src, _)) in moves.iter().enumerate() {
        // SAFETY: async-signal-safe fcntl on descriptors inherited from the parent.
        let tmp = unsafe { libc::fcntl(src, libc::F_DUPFD_CLOEXEC, above) };
        if tmp < 0 {
            return Err(io::Error::last_os_error());
        }
        scratch[i] = tmp;
    }
    for (i, &(_, slot)) in moves.iter().enumerate() {
        // SAFETY: dup2 clears close-on-exec on the slot copy; the scratch
        // copy is closed right after.
        unsafe {
            if libc::dup2(scratch[i], slot) < 0 {
                return Err(io::Error::last_os_error());
            }
            libc::close(scratch[i]);
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`ProcessControl`] for driving the supervisor without forking.

    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Clone)]
    pub struct Spawned {
        pub pid: Pid,
        pub service: String,
        pub argv: Vec<String>,
        pub env: Vec<(OsString, OsString)>,
        pub slots: Vec<RawFd>,
    }

    #[derive(Debug)]
    pub struct FakeProcessControl {
        next_pid: i32,
        pub spawned: Vec<Spawned>,
        pub terminated: Vec<Pid>,
        pub exits: VecDeque<(Pid, ExitReport)>,
        pub fail_spawns: bool,
    }

    impl Default for FakeProcessControl {
        fn default() -> Self {
            Self {
                next_pid: 1001,
                spawned: Vec::new(),
                terminated: Vec::new(),
                exits: VecDeque::new(),
                fail_spawns: false,
            }
        }
    }

    impl FakeProcessControl {
        pub fn exit(&mut self, pid: Pid, report: ExitReport) {
            self.exits.push_back((pid, report));
        }

        pub fn last_pid(&self) -> Pid {
            self.spawned.last().expect("nothing spawned").pid
        }
    }

    impl ProcessControl for FakeProcessControl {
        fn spawn(&mut self, request: &SpawnRequest<'_>) -> io::Result<Pid> {
            if self.fail_spawns {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            let pid = Pid::from_raw(self.next_pid);
            self.next_pid += 1;
            self.spawned.push(Spawned {
                pid,
                service: request.service.to_string(),
                argv: request.argv.to_vec(),
                env: request.env.clone(),
                slots: request.inherit.iter().map(|&(_, slot)| slot).collect(),
            });
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
}
