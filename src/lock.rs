//! The pid file: a single exclusively locked file holding the supervisor's
//! process id. A held lock is what "running" means.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt as _;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use crate::error::{MasterError, Result};

/// Held for the lifetime of the supervisor; the lock goes away with the
/// process.
#[derive(Debug)]
pub struct PidLock {
    _file: Flock<File>,
    path: PathBuf,
}

impl PidLock {
    /// Take the lock and record our pid.
    pub fn acquire(path: &Path) -> Result<PidLock> {
        let lock_err = |source: io::Error| MasterError::Lock {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(lock_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o644)
            .open(path)
            .map_err(lock_err)?;

        let mut file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, Errno::EWOULDBLOCK)) => {
                let pid = fs::read_to_string(path).unwrap_or_default();
                return Err(MasterError::AlreadyRunning {
                    pid: pid.trim().to_string(),
                });
            }
            Err((_, errno)) => return Err(lock_err(io::Error::from(errno))),
        };

        file.set_len(0).map_err(lock_err)?;
        file.seek(SeekFrom::Start(0)).map_err(lock_err)?;
        writeln!(file, "{}", std::process::id()).map_err(lock_err)?;
        file.sync_all().map_err(lock_err)?;

        Ok(PidLock {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Whether some process holds the lock. A missing file means not running.
pub fn is_locked(path: &Path) -> Result<bool> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(source) => {
            return Err(MasterError::Lock {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(_held) => Ok(false),
        Err((_, Errno::EWOULDBLOCK)) => Ok(true),
        Err((_, errno)) => Err(MasterError::Lock {
            path: path.to_path_buf(),
            source: io::Error::from(errno),
        }),
    }
}

/// Pid of the running supervisor.
pub fn running_pid(path: &Path) -> Result<Pid> {
    if !is_locked(path)? {
        return Err(MasterError::NotRunning);
    }
    let text = fs::read_to_string(path).map_err(|source| MasterError::Lock {
        path: path.to_path_buf(),
        source,
    })?;
    text.trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| MasterError::Lock {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, format!("bad pid {:?}", text.trim())),
        })
}

/// Send `sig` to the running supervisor.
pub fn signal_supervisor(path: &Path, sig: Signal) -> Result<Pid> {
    let pid = running_pid(path)?;
    signal::kill(pid, sig).map_err(|source| MasterError::Signal {
        pid: pid.as_raw(),
        source,
    })?;
    Ok(pid)
}
