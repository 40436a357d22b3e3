//! Detaching from the terminal.

use std::fs::OpenOptions;

use anyhow::{Context, Result};
use nix::unistd::{ForkResult, chdir, dup2_stdin, dup2_stdout, fork};

use masterd::signals;

/// Fork into the background and start a new session, so the supervisor
/// leads the process group its workers inherit. The parent exits here.
///
/// Must run before any thread is started.
pub fn daemonise() -> Result<()> {
    // SAFETY: called from main before the watchdog thread exists.
    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }
    signals::lead_process_group()?;
    chdir("/").context("chdir / failed")?;

    // stderr stays open for the log backend.
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("cannot open /dev/null")?;
    dup2_stdin(&null).context("redirect stdin")?;
    dup2_stdout(&null).context("redirect stdout")?;
    log::debug!("detached, session leader pid {}", std::process::id());
    Ok(())
}
