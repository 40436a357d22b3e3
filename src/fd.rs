//! Descriptor flag helpers and the pipes every worker inherits.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::unistd::pipe;

/// Descriptor slots a worker finds its inherited handles on.
pub const FLOW_READ_FD: i32 = 3;
pub const FLOW_WRITE_FD: i32 = 4;
pub const STATUS_FD: i32 = 5;
pub const LISTEN_FD_BASE: i32 = 6;

fn update_flags(fd: &impl AsRawFd, get: i32, set: i32, flag: i32) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: F_GETFL/F_GETFD and their setters on a descriptor the caller
    // keeps open for the duration of the call.
    unsafe {
        let flags = libc::fcntl(fd, get);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, set, flags | flag) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn set_nonblocking(fd: &impl AsRawFd) -> io::Result<()> {
    update_flags(fd, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK)
}

pub fn set_cloexec(fd: &impl AsRawFd) -> io::Result<()> {
    update_flags(fd, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC)
}

/// A pipe whose ends are both close-on-exec; workers receive copies through
/// renumbering, which clears the flag on the copy only.
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read, write) = pipe()?;
    set_cloexec(&read)?;
    set_cloexec(&write)?;
    Ok((read, write))
}

/// The flow-control pipe shared by all workers on descriptors 3 and 4. Its
/// token protocol belongs to the worker frameworks; the supervisor only
/// creates it and hands it down.
#[derive(Debug)]
pub struct FlowPipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl FlowPipe {
    pub fn new() -> io::Result<Self> {
        let (read, write) = cloexec_pipe()?;
        set_nonblocking(&read)?;
        set_nonblocking(&write)?;
        Ok(Self { read, write })
    }
}
