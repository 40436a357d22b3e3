//! Guard against the main loop getting stuck.
//!
//! A helper thread waits for `Arm` and then for the matching `Disarm`. If
//! the disarm does not arrive within the timeout the expiry action runs; in
//! the daemon that logs and exits with status 1.

use std::thread;
use std::time::Duration;

use crossbeam_channel::{Sender, after, bounded, select};
use log::{debug, error};

use crate::error::{MasterError, Result};

enum Msg {
    Arm,
    Disarm,
    Timeout(Duration),
}

#[derive(Debug)]
pub struct Watchdog {
    tx: Sender<Msg>,
}

impl Watchdog {
    /// Start a watchdog that terminates the process on expiry.
    pub fn start(timeout: Duration) -> Result<Self> {
        Self::start_with(timeout, || {
            error!("watchdog expired, main loop stuck; exiting");
            std::process::exit(1);
        })
    }

    pub fn start_with(timeout: Duration, on_expire: impl FnOnce() + Send + 'static) -> Result<Self> {
        let (tx, rx) = bounded::<Msg>(16);
        thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                let mut on_expire = Some(on_expire);
                let mut timeout = timeout;
                loop {
                    // Idle until armed; a closed channel ends the thread.
                    match rx.recv() {
                        Ok(Msg::Arm) => {}
                        Ok(Msg::Disarm) => continue,
                        Ok(Msg::Timeout(t)) => {
                            timeout = t;
                            continue;
                        }
                        Err(_) => return,
                    }
                    'armed: loop {
                        select! {
                            recv(rx) -> msg => match msg {
                                Ok(Msg::Arm) => continue 'armed,
                                Ok(Msg::Disarm) => break 'armed,
                                Ok(Msg::Timeout(t)) => {
                                    timeout = t;
                                    continue 'armed;
                                }
                                Err(_) => return,
                            },
                            recv(after(timeout)) -> _ => {
                                if let Some(expire) = on_expire.take() {
                                    expire();
                                }
                                return;
                            }
                        }
                    }
                }
            })
            .map_err(|source| MasterError::Setup {
                what: "watchdog thread",
                source,
            })?;
        debug!("watchdog started, timeout {}s", timeout.as_secs());
        Ok(Self { tx })
    }

    /// Start (or restart) the countdown.
    pub fn arm(&self) {
        self.tx.send(Msg::Arm).ok();
    }

    pub fn disarm(&self) {
        self.tx.send(Msg::Disarm).ok();
    }

    /// Use `timeout` from the next countdown on. A running countdown
    /// restarts with it.
    pub fn set_timeout(&self, timeout: Duration) {
        self.tx.send(Msg::Timeout(timeout)).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn flagged(timeout: Duration) -> (Watchdog, Arc<AtomicBool>) {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let dog = Watchdog::start_with(timeout, move || flag.store(true, Ordering::SeqCst)).unwrap();
        (dog, fired)
    }

    #[test]
    fn fires_when_left_armed() {
        let (dog, fired) = flagged(Duration::from_millis(20));
        dog.arm();
        thread::sleep(Duration::from_millis(300));
        assert!(fired.load(Ordering::SeqCst), "watchdog did not fire");
    }

    #[test]
    fn disarm_in_time_keeps_it_quiet() {
        let (dog, fired) = flagged(Duration::from_millis(500));
        for _ in 0..5 {
            dog.arm();
            thread::sleep(Duration::from_millis(10));
            dog.disarm();
        }
        thread::sleep(Duration::from_millis(700));
        assert!(!fired.load(Ordering::SeqCst), "watchdog fired while disarmed");
    }

    #[test]
    fn shortened_timeout_applies_to_the_next_countdown() {
        let (dog, fired) = flagged(Duration::from_secs(3600));
        dog.set_timeout(Duration::from_millis(20));
        dog.arm();
        thread::sleep(Duration::from_millis(300));
        assert!(fired.load(Ordering::SeqCst), "new timeout not used");
    }
}
