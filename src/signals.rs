//! Asynchronous signal handling.
//!
//! Handlers only set atomic flags and poke a self-pipe; the main loop reads
//! and clears the flags after each event-loop pass. Termination is the one
//! exception and happens directly in the handler.

use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use once_cell::sync::OnceCell;

use crate::error::{MasterError, Result};
use crate::fd::{cloexec_pipe, set_nonblocking};

static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);
static CHILD_EXITED: AtomicBool = AtomicBool::new(false);
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

static PIPE: OnceCell<SignalPipe> = OnceCell::new();

/// Read end of the self-pipe. Lives for the rest of the process once
/// installed, so handlers never write to a recycled descriptor.
#[derive(Debug)]
pub struct SignalPipe {
    read: File,
    write: OwnedFd,
}

impl SignalPipe {
    fn new() -> io::Result<Self> {
        let (read, write) = cloexec_pipe()?;
        set_nonblocking(&read)?;
        set_nonblocking(&write)?;
        Ok(Self {
            read: File::from(read),
            write,
        })
    }

    /// Swallow pending wakeup bytes.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.read).read(&mut buf) {
                Ok(n) if n > 0 => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                _ => break,
            }
        }
    }
}

impl AsRawFd for SignalPipe {
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

fn wake() {
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        // SAFETY: write(2) is async-signal-safe; the descriptor is never
        // closed once published. A full pipe already guarantees a wakeup.
        unsafe {
            libc::write(fd, b"x".as_ptr().cast(), 1);
        }
    }
}

extern "C" fn on_hangup(_: libc::c_int) {
    RELOAD_REQUESTED.store(true, Ordering::SeqCst);
    wake();
}

extern "C" fn on_child(_: libc::c_int) {
    CHILD_EXITED.store(true, Ordering::SeqCst);
    wake();
}

extern "C" fn on_terminate(sig: libc::c_int) {
    const MSG: &[u8] = b"masterd: terminating on signal\n";
    // SAFETY: only async-signal-safe calls. Re-raising with the default
    // disposition ends the process with the original signal.
    unsafe {
        libc::write(libc::STDERR_FILENO, MSG.as_ptr().cast(), MSG.len());
        kill_process_group();
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

/// Deliver SIGTERM to every member of our process group except ourselves.
///
/// # Safety
///
/// Changes the process-wide SIGTERM disposition to "ignore".
unsafe fn kill_process_group() {
    unsafe {
        libc::signal(libc::SIGTERM, libc::SIG_IGN);
        libc::kill(0, libc::SIGTERM);
    }
}

/// Terminate all workers at once. Used on the way out after an invariant
/// violation.
pub fn terminate_process_group() {
    // SAFETY: the caller is about to exit; nothing relies on SIGTERM after this.
    unsafe { kill_process_group() }
}

/// Lead a session and process group of our own, so that terminating the
/// group reaches our workers and never whoever started us.
///
/// Already leading the session is fine. Leading only a process group (a
/// shell job) is not: `setsid` is refused and the group may hold our parent
/// or pipeline peers.
pub fn lead_process_group() -> Result<()> {
    let setup = |errno: Errno| MasterError::Setup {
        what: "session and process group",
        source: io::Error::from(errno),
    };
    match unistd::setsid() {
        Ok(_) => Ok(()),
        Err(Errno::EPERM) if unistd::getsid(None).map_err(setup)? == unistd::getpid() => Ok(()),
        Err(errno) => Err(setup(errno)),
    }
}

fn install_handler(sig: Signal, handler: SigHandler, flags: SaFlags) -> Result<()> {
    let action = SigAction::new(handler, flags, SigSet::empty());
    // SAFETY: the handlers only touch atomics and make async-signal-safe calls.
    unsafe { signal::sigaction(sig, &action) }.map_err(|e| MasterError::Setup {
        what: "signal handler",
        source: io::Error::from(e),
    })?;
    Ok(())
}

/// Install the supervisor's handlers and return the self-pipe to watch.
/// Safe to call more than once; the pipe is created only the first time.
pub fn install() -> Result<&'static SignalPipe> {
    let pipe = PIPE.get_or_try_init(|| {
        SignalPipe::new().map_err(|source| MasterError::Setup {
            what: "signal pipe",
            source,
        })
    })?;
    WAKE_FD.store(pipe.write.as_raw_fd(), Ordering::SeqCst);

    install_handler(Signal::SIGHUP, SigHandler::Handler(on_hangup), SaFlags::SA_RESTART)?;
    install_handler(
        Signal::SIGCHLD,
        SigHandler::Handler(on_child),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
    )?;
    install_handler(Signal::SIGTERM, SigHandler::Handler(on_terminate), SaFlags::empty())?;
    install_handler(Signal::SIGINT, SigHandler::Handler(on_terminate), SaFlags::empty())?;
    install_handler(Signal::SIGPIPE, SigHandler::SigIgn, SaFlags::empty())?;
    Ok(pipe)
}

/// Read and clear the reload flag.
pub fn take_reload() -> bool {
    RELOAD_REQUESTED.swap(false, Ordering::AcqRel)
}

/// Read and clear the child-exit flag. Several SIGCHLDs coalesce into one.
pub fn take_child_exit() -> bool {
    CHILD_EXITED.swap(false, Ordering::AcqRel)
}

/// Drain the self-pipe, if installed.
pub fn drain() {
    if let Some(pipe) = PIPE.get() {
        pipe.drain();
    }
}
