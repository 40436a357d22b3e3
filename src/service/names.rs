//! Port number ↔ service name lookups backed by the system services database.

use std::collections::HashMap;
use std::fs;

use once_cell::sync::Lazy;

const SERVICES_FILE: &str = "/etc/services";

/// The system table, loaded on first use. A missing or unreadable file
/// yields an empty table: numeric ports still work, symbolic ones fail to
/// resolve with a configuration error.
pub static SYSTEM_SERVICE_NAMES: Lazy<ServiceNames> = Lazy::new(|| {
    match fs::read_to_string(SERVICES_FILE) {
        Ok(text) => ServiceNames::parse(&text),
        Err(e) => {
            log::warn!("cannot read {SERVICES_FILE}: {e}; only numeric inet ports will resolve");
            ServiceNames::default()
        }
    }
});

/// TCP entries of a services(5) style table.
#[derive(Debug, Default, Clone)]
pub struct ServiceNames {
    by_port: HashMap<u16, String>,
    by_name: HashMap<String, u16>,
}

impl ServiceNames {
    /// Parse `name port/proto [aliases...] [# comment]` lines, keeping tcp only.
    /// The first name listed for a port is its canonical name.
    pub fn parse(text: &str) -> Self {
        let mut names = Self::default();
        for line in text.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let (Some(name), Some(port_proto)) = (fields.next(), fields.next()) else {
                continue;
            };
            let Some((port, proto)) = port_proto.split_once('/') else {
                continue;
            };
            if proto != "tcp" {
                continue;
            }
            let Ok(port) = port.parse::<u16>() else {
                continue;
            };
            names.by_port.entry(port).or_insert_with(|| name.to_string());
            for alias in std::iter::once(name).chain(fields) {
                names.by_name.entry(alias.to_string()).or_insert(port);
            }
        }
        names
    }

    pub fn name_of(&self, port: u16) -> Option<&str> {
        self.by_port.get(&port).map(String::as_str)
    }

    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.by_name.get(name).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# comment line
smtp            25/tcp          mail
smtp            25/udp
submission      587/tcp                         # mail message submission
domain          53/udp
";

    #[test]
    fn maps_ports_to_canonical_names() {
        let names = ServiceNames::parse(SAMPLE);
        assert_eq!(names.name_of(25), Some("smtp"));
        assert_eq!(names.name_of(587), Some("submission"));
        assert_eq!(names.name_of(53), None, "udp-only entries are skipped");
    }

    #[test]
    fn aliases_resolve_to_the_same_port() {
        let names = ServiceNames::parse(SAMPLE);
        assert_eq!(names.port_of("smtp"), Some(25));
        assert_eq!(names.port_of("mail"), Some(25));
        assert_eq!(names.port_of("nope"), None);
    }
}
