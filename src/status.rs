//! Status channel: how workers tell the supervisor they are idle or busy.
//!
//! Every service owns one pipe. All of its workers share the write end; the
//! supervisor reads from the other end. Each message is one fixed-size record
//! in native byte order, small enough for the kernel to write atomically, so
//! concurrent writers never interleave.

use std::env;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use crate::fd::{STATUS_FD, cloexec_pipe, set_nonblocking};

/// Environment variable carrying the service generation at spawn time.
pub const GENERATION_ENV: &str = "GENERATION";

pub const RECORD_SIZE: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Availability {
    Busy = 0,
    Available = 1,
}

impl Availability {
    fn from_raw(value: i32) -> Option<Self> {
        match value {
            0 => Some(Availability::Busy),
            1 => Some(Availability::Available),
            _ => None,
        }
    }
}

/// `{ int32 pid; uint32 generation; int32 availability; }`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    pub pid: i32,
    pub generation: u32,
    pub availability: Availability,
}

impl StatusRecord {
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.generation.to_ne_bytes());
        buf[8..12].copy_from_slice(&(self.availability as i32).to_ne_bytes());
        buf
    }

    /// Decode one record. An availability value outside the enum is returned
    /// as `Err((pid, value))`.
    pub fn decode(buf: &[u8; RECORD_SIZE]) -> Result<Self, (i32, i32)> {
        let pid = i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let generation = u32::from_ne_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let raw = i32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let availability = Availability::from_raw(raw).ok_or((pid, raw))?;
        Ok(Self {
            pid,
            generation,
            availability,
        })
    }
}

/// Outcome of one read on a status pipe.
#[derive(Debug, PartialEq, Eq)]
pub enum StatusRead {
    Record(StatusRecord),
    /// A short read; `pid` is the sender when enough bytes arrived to tell.
    Partial { len: usize, pid: Option<i32> },
    /// A full record with an availability value we do not know.
    Garbled { pid: i32, value: i32 },
    /// Spurious wakeup, nothing to read.
    Empty,
}

/// The supervisor's side of a service's status pipe.
///
/// The write end is kept open here as well as in every worker, so the read
/// end can never see end-of-file.
#[derive(Debug)]
pub struct StatusChannel {
    read: File,
    write: OwnedFd,
}

impl StatusChannel {
    pub fn new() -> io::Result<Self> {
        let (read, write) = cloexec_pipe()?;
        // Only our end: the write end's file status flags are shared with
        // every worker holding a copy.
        set_nonblocking(&read)?;
        Ok(Self {
            read: File::from(read),
            write,
        })
    }

    /// The end workers inherit on [`STATUS_FD`].
    pub fn write_end(&self) -> BorrowedFd<'_> {
        self.write.as_fd()
    }

    /// One non-blocking read of at most one record.
    ///
    /// # Panics
    ///
    /// On end-of-file, which cannot happen while we hold the write end.
    pub fn read_one(&mut self) -> io::Result<StatusRead> {
        let mut buf = [0u8; RECORD_SIZE];
        let len = match self.read.read(&mut buf) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(StatusRead::Empty),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(StatusRead::Empty),
            Err(e) => return Err(e),
        };
        match len {
            0 => panic!("status pipe fd {}: unexpected EOF", self.read.as_raw_fd()),
            RECORD_SIZE => Ok(match StatusRecord::decode(&buf) {
                Ok(record) => StatusRead::Record(record),
                Err((pid, value)) => StatusRead::Garbled { pid, value },
            }),
            len => {
                let pid = (len >= 4).then(|| i32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]));
                Ok(StatusRead::Partial { len, pid })
            }
        }
    }
}

impl AsRawFd for StatusChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

/// Write exactly one record. Anything short of a full write is an error; for
/// a worker that means the supervisor is gone and it should exit.
pub fn send_status(pipe: &mut impl Write, record: &StatusRecord) -> io::Result<()> {
    let buf = record.encode();
    let written = pipe.write(&buf)?;
    if written != RECORD_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short status write: {written} of {RECORD_SIZE} bytes"),
        ));
    }
    Ok(())
}

/// Worker-side sender, for worker frameworks built on this crate.
#[derive(Debug)]
pub struct StatusReporter {
    pipe: File,
    pid: i32,
    generation: u32,
}

impl StatusReporter {
    pub fn new(pipe: OwnedFd, generation: u32) -> Self {
        Self {
            pipe: File::from(pipe),
            pid: std::process::id() as i32,
            generation,
        }
    }

    /// Adopt the status descriptor and generation handed down by the
    /// supervisor. Only valid in a process started by it.
    pub fn from_inherited() -> io::Result<Self> {
        let generation = env::var(GENERATION_ENV)
            .ok()
            .and_then(|g| g.parse::<u32>().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "GENERATION not set by supervisor")
            })?;
        // SAFETY: the supervisor places the status pipe on STATUS_FD before
        // exec and nothing else in the worker owns that slot.
        let pipe = unsafe { OwnedFd::from_raw_fd(STATUS_FD) };
        Ok(Self::new(pipe, generation))
    }

    pub fn report(&mut self, availability: Availability) -> io::Result<()> {
        let record = StatusRecord {
            pid: self.pid,
            generation: self.generation,
            availability,
        };
        send_status(&mut self.pipe, &record)
    }
}
