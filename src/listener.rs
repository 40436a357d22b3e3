//! Listener manager: the shared listening endpoints of each service.
//!
//! Endpoints are created non-blocking and close-on-exec. Workers get their
//! own copies through the descriptor renumbering done at spawn time; only
//! the supervisor ever closes the originals.

use std::fmt;
use std::fs::{self, OpenOptions, Permissions};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt as _, OpenOptionsExt as _, PermissionsExt as _};
use std::path::{Path, PathBuf};

use nix::sys::stat::Mode;
use nix::unistd::{Gid, Uid, User, getegid, geteuid, mkfifo, setegid, seteuid};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{MasterError, Result};

/// Where a service listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EndpointAddr {
    /// Stream socket bound to a filesystem path (unix and fd-passing services).
    Unix(PathBuf),
    /// Named pipe.
    Fifo(PathBuf),
    Inet(SocketAddr),
}

impl EndpointAddr {
    pub fn path(&self) -> Option<&Path> {
        match self {
            EndpointAddr::Unix(path) | EndpointAddr::Fifo(path) => Some(path),
            EndpointAddr::Inet(_) => None,
        }
    }
}

impl fmt::Display for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            EndpointAddr::Fifo(path) => write!(f, "fifo:{}", path.display()),
            EndpointAddr::Inet(addr) => write!(f, "inet:{addr}"),
        }
    }
}

/// One open listening handle.
#[derive(Debug)]
pub struct Endpoint {
    addr: EndpointAddr,
    fd: OwnedFd,
}

impl Endpoint {
    pub fn addr(&self) -> &EndpointAddr {
        &self.addr
    }

    /// Address actually bound; differs from the configured one for port 0.
    pub fn local_addr(&self) -> io::Result<EndpointAddr> {
        match &self.addr {
            EndpointAddr::Inet(_) => {
                let sock = socket2::SockRef::from(&self.fd);
                sock.local_addr()?
                    .as_socket()
                    .map(EndpointAddr::Inet)
                    .ok_or_else(|| io::Error::other("not an inet socket"))
            }
            other => Ok(other.clone()),
        }
    }
}

impl AsFd for Endpoint {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Account that owns unix and fifo endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: Uid,
    pub gid: Gid,
}

impl Owner {
    pub fn lookup(name: &str) -> Result<Owner> {
        let user = User::from_name(name)
            .map_err(|e| MasterError::Resolve {
                service: "global".into(),
                what: format!("user {name}"),
                reason: e.to_string(),
            })?
            .ok_or_else(|| MasterError::Resolve {
                service: "global".into(),
                what: format!("user {name}"),
                reason: "no such user".into(),
            })?;
        Ok(Owner {
            uid: user.uid,
            gid: user.gid,
        })
    }
}

/// Open every endpoint of a service.
///
/// Either all endpoints open or none stay open: handles opened before a
/// failure are closed when the partial set is dropped.
pub fn open_endpoints(
    service: &str,
    addrs: &[EndpointAddr],
    backlog: u32,
    owner: Option<Owner>,
) -> Result<Vec<Endpoint>> {
    let mut endpoints = Vec::with_capacity(addrs.len());
    for addr in addrs {
        let fd = match addr {
            EndpointAddr::Unix(path) => open_unix(path, backlog, owner),
            EndpointAddr::Fifo(path) => open_fifo(path, owner),
            EndpointAddr::Inet(sa) => open_inet(*sa, backlog),
        }
        .map_err(|source| MasterError::Listen {
            service: service.to_string(),
            endpoint: addr.to_string(),
            source,
        })?;
        log::debug!("{service}: listening on {addr} (fd {})", fd.as_raw_fd());
        endpoints.push(Endpoint {
            addr: addr.clone(),
            fd,
        });
    }
    Ok(endpoints)
}

/// Close a service's endpoints. Socket files are left in place; the next
/// open of the same path replaces them.
pub fn close_endpoints(service: &str, endpoints: Vec<Endpoint>) {
    for endpoint in endpoints {
        log::debug!("{service}: closing {}", endpoint.addr);
        drop(endpoint);
    }
}

fn backlog_arg(backlog: u32) -> i32 {
    i32::try_from(backlog).unwrap_or(i32::MAX)
}

fn open_unix(path: &Path, backlog: u32, owner: Option<Owner>) -> io::Result<OwnedFd> {
    ensure_unix_socket_free(path)?;
    let sock = with_effective_owner(owner, || {
        let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;
        sock.bind(&SockAddr::unix(path)?)?;
        Ok(sock)
    })?;
    fs::set_permissions(path, Permissions::from_mode(0o666))?;
    sock.listen(backlog_arg(backlog))?;
    sock.set_nonblocking(true)?;
    Ok(OwnedFd::from(sock))
}

fn open_inet(addr: SocketAddr, backlog: u32) -> io::Result<OwnedFd> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    if addr.is_ipv6() {
        sock.set_only_v6(true)?;
    }
    sock.bind(&addr.into())?;
    sock.listen(backlog_arg(backlog))?;
    sock.set_nonblocking(true)?;
    Ok(OwnedFd::from(sock))
}

fn open_fifo(path: &Path, owner: Option<Owner>) -> io::Result<OwnedFd> {
    let file = with_effective_owner(owner, || {
        match mkfifo(path, Mode::from_bits_truncate(0o622)) {
            Ok(()) | Err(nix::errno::Errno::EEXIST) => {}
            Err(e) => return Err(io::Error::from(e)),
        }
        if !fs::metadata(path)?.file_type().is_fifo() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "path already exists and is not a fifo",
            ));
        }
        // Read-write so that the pipe never reports EOF when the last writer
        // goes away.
        OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
    })?;
    fs::set_permissions(path, Permissions::from_mode(0o622))?;
    Ok(OwnedFd::from(file))
}

/// Remove a stale socket file left by a previous run. Anything that is not a
/// socket is left alone and reported.
fn ensure_unix_socket_free(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) => {
            if !metadata.file_type().is_socket() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    "path already exists and is not a Unix domain socket",
                ));
            }
            fs::remove_file(path)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// Run `f` with the effective uid/gid switched to `owner`.
///
/// Only the filesystem-creating calls run inside the window. Without an
/// owner, or when not running as root, `f` runs unchanged.
fn with_effective_owner<T>(
    owner: Option<Owner>,
    f: impl FnOnce() -> io::Result<T>,
) -> io::Result<T> {
    let Some(owner) = owner else {
        return f();
    };
    let (saved_uid, saved_gid) = (geteuid(), getegid());
    if !saved_uid.is_root() {
        return f();
    }

    setegid(owner.gid)?;
    if let Err(e) = seteuid(owner.uid) {
        if let Err(restore) = setegid(saved_gid) {
            panic!("cannot restore effective gid {saved_gid}: {restore}");
        }
        return Err(e.into());
    }

    let result = f();

    if let Err(e) = seteuid(saved_uid) {
        panic!("cannot restore effective uid {saved_uid}: {e}");
    }
    if let Err(e) = setegid(saved_gid) {
        panic!("cannot restore effective gid {saved_gid}: {e}");
    }
    result
}
