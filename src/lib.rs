//! masterd library
//!
//! Supervises socket-activated worker daemons: opens each service's
//! listening endpoints, spawns workers on demand up to a per-service limit,
//! tracks their availability over a status pipe, throttles services whose
//! workers crash, and reconciles everything atomically on reload.

pub mod admission;
pub mod config;
pub mod error;
pub mod event;
pub mod fd;
pub mod listener;
pub mod lock;
pub mod process;
pub mod service;
pub mod signals;
pub mod spawn;
pub mod status;
pub mod supervisor;
pub mod wakeup;
pub mod watchdog;
pub mod worker;

pub use error::{MasterError, Phase, Result, Severity};
pub use supervisor::{Settings, Supervisor};
