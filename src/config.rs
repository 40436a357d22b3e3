use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MasterError, Result};

/// Top‑level supervisor configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MasterConfig {
    #[serde(default)]
    pub global: GlobalSettings,
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/masterd.pid")
}

fn default_daemon_directory() -> PathBuf {
    PathBuf::from("/usr/libexec/masterd")
}

fn default_socket_directory() -> PathBuf {
    PathBuf::from("/var/spool/masterd")
}

fn default_process_limit() -> u32 {
    100
}

fn default_throttle_time() -> u64 {
    60
}

fn default_backlog() -> u32 {
    100
}

fn default_inet_interfaces() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_watchdog_timeout() -> u64 {
    1000
}

fn default_max_wait() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

/// Process-wide settings, the `[global]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,
    #[serde(default = "default_daemon_directory")]
    pub daemon_directory: PathBuf,
    /// Holds the `private/` and `public/` endpoint directories.
    #[serde(default = "default_socket_directory")]
    pub socket_directory: PathBuf,
    #[serde(default = "default_process_limit")]
    pub default_process_limit: u32,
    /// Seconds a crash-looping service stays throttled.
    #[serde(default = "default_throttle_time")]
    pub service_throttle_time: u64,
    #[serde(default = "default_backlog")]
    pub default_backlog: u32,
    #[serde(default = "default_inet_interfaces")]
    pub inet_interfaces: Vec<String>,
    /// Owner of unix and fifo endpoints; only honoured when running as root.
    pub mail_owner: Option<String>,
    /// When set, workers get only these variables from our environment.
    pub import_environment: Option<Vec<String>>,
    #[serde(default = "default_watchdog_timeout")]
    pub watchdog_timeout: u64,
    /// Hard ceiling, in seconds, for one event-loop wait.
    #[serde(default = "default_max_wait")]
    pub max_wait: u64,
    /// Directory of additional `*.toml` files, one service each.
    pub services_dir: Option<PathBuf>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            daemon_directory: default_daemon_directory(),
            socket_directory: default_socket_directory(),
            default_process_limit: default_process_limit(),
            service_throttle_time: default_throttle_time(),
            default_backlog: default_backlog(),
            inet_interfaces: default_inet_interfaces(),
            mail_owner: None,
            import_environment: None,
            watchdog_timeout: default_watchdog_timeout(),
            max_wait: default_max_wait(),
            services_dir: None,
        }
    }
}

/// On‑disk description of a single service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    /// External name; for inet services `[host:]port`.
    pub name: String,
    /// unix | inet | fifo | pass | fd-passing
    pub transport: String,
    #[serde(default = "default_true")]
    pub private: bool,
    #[serde(default = "default_true")]
    pub unprivileged: bool,
    #[serde(default)]
    pub chroot: bool,
    /// Seconds between wakeup triggers, 0 disables.
    #[serde(default)]
    pub wakeup: u64,
    #[serde(default)]
    pub wakeup_conditional: bool,
    /// Absent means the global default; 0 means unlimited.
    pub process_limit: Option<u32>,
    /// Some daemons only work with one specific limit (e.g. 1).
    pub required_process_limit: Option<u32>,
    #[serde(default)]
    pub stress_capable: bool,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl MasterConfig {
    /// Read and parse a configuration file, then append the services found in
    /// `services_dir`, if one is configured.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| MasterError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg: MasterConfig =
            toml::from_str(&text).map_err(|source| MasterError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        if let Some(dir) = cfg.global.services_dir.clone() {
            cfg.services.extend(load_services_dir(&dir)?);
        }
        Ok(cfg)
    }

    /// Default configuration written on first start.
    pub fn example() -> Self {
        Self {
            global: GlobalSettings::default(),
            services: vec![ServiceDefinition {
                name: "smtp".into(),
                transport: "inet".into(),
                private: false,
                unprivileged: true,
                chroot: false,
                wakeup: 0,
                wakeup_conditional: false,
                process_limit: None,
                required_process_limit: None,
                stress_capable: true,
                command: "smtpd".into(),
                args: Vec::new(),
            }],
        }
    }
}

/// Load every `*.toml` file in `dir` as one service definition.
///
/// Files are read in name order so that reloads see a stable sequence. Any
/// unreadable or malformed file fails the whole load; a service is never
/// dropped silently.
fn load_services_dir(dir: &Path) -> Result<Vec<ServiceDefinition>> {
    let entries = fs::read_dir(dir).map_err(|source| MasterError::ConfigRead {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().and_then(|s| s.to_str()) == Some("toml"))
        .collect();
    paths.sort();

    let mut services = Vec::with_capacity(paths.len());
    for path in paths {
        let content = fs::read_to_string(&path).map_err(|source| MasterError::ConfigRead {
            path: path.clone(),
            source,
        })?;
        let def: ServiceDefinition =
            toml::from_str(&content).map_err(|source| MasterError::ConfigParse {
                path: path.clone(),
                source,
            })?;
        log::debug!("Loaded service '{}' from {}", def.name, path.display());
        services.push(def);
    }
    Ok(services)
}

/// Resolve which configuration file to use, mirroring the CLI precedence:
/// explicit path, then the system file, then the per-user file.
pub fn resolve_config_path(explicit: Option<&str>, system: bool) -> Result<PathBuf, String> {
    if let Some(path) = explicit {
        return Ok(PathBuf::from(path));
    }
    if system {
        return Ok(PathBuf::from("/etc/masterd/master.toml"));
    }
    dirs::config_dir()
        .map(|dir| dir.join("masterd").join("master.toml"))
        .ok_or_else(|| "Could not determine config directory".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_service_gets_defaults() {
        let cfg: MasterConfig = toml::from_str(
            r#"
            [[services]]
            name = "cleanup"
            transport = "unix"
            command = "cleanup"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.global, GlobalSettings::default());
        let svc = &cfg.services[0];
        assert!(svc.private);
        assert!(svc.unprivileged);
        assert!(!svc.chroot);
        assert_eq!(svc.wakeup, 0);
        assert_eq!(svc.process_limit, None);
        assert!(svc.args.is_empty());
    }

    #[test]
    fn load_appends_services_dir_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let services = dir.path().join("services.d");
        fs::create_dir(&services).unwrap();
        fs::write(
            services.join("b.toml"),
            "name = \"b\"\ntransport = \"unix\"\ncommand = \"b\"\n",
        )
        .unwrap();
        fs::write(
            services.join("a.toml"),
            "name = \"a\"\ntransport = \"fifo\"\ncommand = \"a\"\n",
        )
        .unwrap();
        fs::write(services.join("ignored.txt"), "junk").unwrap();

        let main = dir.path().join("master.toml");
        fs::write(
            &main,
            format!(
                "[global]\nservices_dir = \"{}\"\n\n[[services]]\nname = \"main\"\ntransport = \"unix\"\ncommand = \"m\"\n",
                services.display()
            ),
        )
        .unwrap();

        let cfg = MasterConfig::load(&main).unwrap();
        let names: Vec<_> = cfg.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["main", "a", "b"]);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("master.toml");
        fs::write(&main, "[[services]]\nname = 25\n").unwrap();
        let err = MasterConfig::load(&main).unwrap_err();
        assert!(matches!(err, MasterError::ConfigParse { .. }), "{err}");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = MasterConfig::load(Path::new("/nonexistent/master.toml")).unwrap_err();
        assert!(matches!(err, MasterError::ConfigRead { .. }), "{err}");
    }

    #[test]
    fn example_config_round_trips_through_toml() {
        let text = toml::to_string_pretty(&MasterConfig::example()).unwrap();
        let back: MasterConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, MasterConfig::example());
    }

    #[test]
    fn explicit_config_path_wins() {
        let path = resolve_config_path(Some("/tmp/x.toml"), true).unwrap();
        assert_eq!(path, PathBuf::from("/tmp/x.toml"));
        let path = resolve_config_path(None, true).unwrap();
        assert_eq!(path, PathBuf::from("/etc/masterd/master.toml"));
    }
}
