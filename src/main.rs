mod cli;
mod control;
mod daemon;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use masterd::config::{MasterConfig, resolve_config_path};
use masterd::lock::PidLock;
use masterd::process::OsProcessControl;
use masterd::service::names::SYSTEM_SERVICE_NAMES;
use masterd::signals;
use masterd::supervisor::{Settings, Supervisor};
use masterd::watchdog::Watchdog;

fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    // Initialize logger with custom format for daemon
    env_logger::Builder::new()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() {
    let args = cli::Args::parse();
    let cmd = args.sub.unwrap_or_default();
    let verbose = match &cmd {
        cli::Cmd::Run { verbose, .. } => *verbose,
        _ => 0,
    };
    init_logger(verbose);

    let result = match cmd {
        cli::Cmd::Run {
            foreground,
            config,
            system,
            verbose,
            exit_after,
        } => run_supervisor(foreground, config, system, verbose, exit_after),
        cli::Cmd::Test { config, system } => handle_test(config, system),
        cli::Cmd::Reload { config, system } => {
            config_pid_file(config, system).and_then(|pid_file| control::reload(&pid_file))
        }
        cli::Cmd::Stop { config, system } => {
            config_pid_file(config, system).and_then(|pid_file| control::stop(&pid_file))
        }
    };
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn config_path(config: Option<String>, system: bool) -> Result<PathBuf> {
    resolve_config_path(config.as_deref(), system).map_err(anyhow::Error::msg)
}

fn config_pid_file(config: Option<String>, system: bool) -> Result<PathBuf> {
    control::pid_file(&config_path(config, system)?)
}

/// Handle test command - exit 0 when no supervisor is running
fn handle_test(config: Option<String>, system: bool) -> Result<()> {
    let pid_file = config_pid_file(config, system)?;
    if control::check_running(&pid_file)? {
        println!("masterd is running");
        std::process::exit(1);
    }
    println!("masterd is stopped");
    Ok(())
}

/// Write the example configuration on first start.
fn ensure_config(cfg_path: &Path) -> Result<()> {
    if cfg_path.exists() {
        return Ok(());
    }
    info!("Config not found at {}, creating default configuration", cfg_path.display());
    if let Some(parent) = cfg_path.parent() {
        fs::create_dir_all(parent).context("Failed to create config directory")?;
    }
    let default_toml =
        toml::to_string_pretty(&MasterConfig::example()).context("Failed to serialize default config")?;
    fs::write(cfg_path, default_toml).context("Failed to write config file")?;
    info!("Created default configuration at {}", cfg_path.display());
    Ok(())
}

/// Invariant violations panic; take the workers down with us.
fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("fatal: {info}");
        signals::terminate_process_group();
        std::process::abort();
    }));
}

fn run_supervisor(
    foreground: bool,
    config: Option<String>,
    system: bool,
    verbose: u8,
    exit_after: Option<u64>,
) -> Result<()> {
    let cfg_path = config_path(config, system)?;
    ensure_config(&cfg_path)?;
    let cfg = MasterConfig::load(&cfg_path).context("Failed to load configuration")?;

    if foreground {
        signals::lead_process_group()
            .context("run from a shell job: start without --foreground or under a service manager")?;
    } else {
        daemon::daemonise()?;
    }
    install_panic_hook();
    let signal_pipe = signals::install()?;
    let lock = PidLock::acquire(&cfg.global.pid_file)?;

    let settings = Settings::from_config(cfg_path.clone(), &cfg.global, verbose)?;
    let watchdog_timeout = settings.watchdog_timeout;
    let mut sup = Supervisor::new(OsProcessControl, settings, SYSTEM_SERVICE_NAMES.clone())?;
    let summary = sup.apply_config(&cfg)?;
    let watchdog = Watchdog::start(watchdog_timeout)?;

    info!(
        "masterd started (pid {}, config {}, lock {}): {summary}",
        std::process::id(),
        cfg_path.display(),
        lock.path().display()
    );
    sup.run(signal_pipe, &watchdog, exit_after.map(Duration::from_secs))?;
    info!("masterd exiting");
    Ok(())
}
