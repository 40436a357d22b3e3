//! Control of an already running supervisor through its lock file.
//!
//! The pid file named in the configuration is both the liveness indicator
//! (a held lock means running) and the address for signals.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::sys::signal::Signal;

use masterd::config::MasterConfig;
use masterd::lock;

/// Pid file of the supervisor configured by `cfg_path`. A missing config
/// file means the defaults apply.
pub fn pid_file(cfg_path: &Path) -> Result<PathBuf> {
    if !cfg_path.exists() {
        return Ok(MasterConfig::default().global.pid_file);
    }
    let cfg = MasterConfig::load(cfg_path)
        .with_context(|| format!("Failed to load {}", cfg_path.display()))?;
    Ok(cfg.global.pid_file)
}

/// Ok(true) when a supervisor holds the lock.
pub fn check_running(pid_file: &Path) -> Result<bool> {
    lock::is_locked(pid_file).with_context(|| format!("Failed to check {}", pid_file.display()))
}

pub fn reload(pid_file: &Path) -> Result<()> {
    let pid = lock::signal_supervisor(pid_file, Signal::SIGHUP).context("Failed to request reload")?;
    log::info!("sent reload request to pid {pid}");
    Ok(())
}

pub fn stop(pid_file: &Path) -> Result<()> {
    let pid = lock::signal_supervisor(pid_file, Signal::SIGTERM).context("Failed to stop supervisor")?;
    log::info!("sent termination request to pid {pid}");
    Ok(())
}
