//! Periodic wakeup requests for services that need a nudge (queue scans and
//! the like): a single `W` written to the service's own endpoint.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::Path;
use std::time::Duration;

use log::{debug, warn};
use socket2::{Domain, SockAddr, Socket, Type};

use crate::event::TimerKind;
use crate::listener::{Endpoint, EndpointAddr};
use crate::process::ProcessControl;
use crate::service::ServiceId;
use crate::supervisor::Supervisor;

pub const WAKEUP_REQUEST: &[u8] = b"W";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

fn trigger_unix(path: &Path) -> io::Result<()> {
    let sock = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    sock.set_nonblocking(true)?;
    sock.connect(&SockAddr::unix(path)?)?;
    (&sock).write_all(WAKEUP_REQUEST)
}

fn trigger_fifo(path: &Path) -> io::Result<()> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?;
    fifo.write_all(WAKEUP_REQUEST)
}

fn trigger_inet(mut addr: SocketAddr) -> io::Result<()> {
    if addr.ip().is_unspecified() {
        addr.set_ip(match addr {
            SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        });
    }
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    sock.connect_timeout(&addr.into(), CONNECT_TIMEOUT)?;
    (&sock).write_all(WAKEUP_REQUEST)
}

/// Send one wakeup request to a listening endpoint.
pub fn trigger(endpoint: &Endpoint) -> io::Result<()> {
    match endpoint.local_addr()? {
        EndpointAddr::Unix(path) => trigger_unix(&path),
        EndpointAddr::Fifo(path) => trigger_fifo(&path),
        EndpointAddr::Inet(addr) => trigger_inet(addr),
    }
}

impl<P: ProcessControl> Supervisor<P> {
    /// (Re)arm the wakeup timer of `id`, or cancel it when wakeups are off.
    pub(crate) fn arm_wakeup(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get(&id) else {
            return;
        };
        let kind = TimerKind::Wakeup(id);
        if svc.is_active() && svc.spec.wakeup_interval > 0 {
            let interval = Duration::from_secs(svc.spec.wakeup_interval);
            self.events.arm_timer(kind, interval, self.now);
        } else {
            self.events.cancel_timer(kind);
        }
    }

    pub(crate) fn on_wakeup(&mut self, id: ServiceId) {
        let Some(svc) = self.services.get(&id) else {
            return;
        };
        if !svc.is_active() {
            return;
        }
        if svc.spec.conditional_wakeup && !svc.ever_used {
            debug!("{}: not used yet, skipping wakeup", svc.label());
        } else if let Some(endpoint) = svc.listen_endpoints.first() {
            match trigger(endpoint) {
                Ok(()) => debug!("{}: wakeup sent", svc.label()),
                Err(e) => warn!("{}: wakeup to {}: {e}", svc.label(), endpoint.addr()),
            }
        }
        self.arm_wakeup(id);
    }
}
