use std::time::Duration;

use apartment_core::ApartmentConfigSnapshot;

pub const KEY_HOST: &str = "http.host";
pub const KEY_PORT: &str = "http.port";
pub const KEY_SHUTDOWN_GRACE_MS: &str = "http.shutdown_grace_ms";

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Listener settings for [`serve`](crate::serve).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// How long in-flight requests may run after a shutdown signal.
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl ServerConfig {
    pub fn from_snapshot(snapshot: &ApartmentConfigSnapshot) -> Self {
        let defaults = Self::default();
        Self {
            host: snapshot
                .get_string(KEY_HOST)
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.host),
            port: snapshot
                .get(KEY_PORT)
                .and_then(|p| p.trim().parse::<u16>().ok())
                .unwrap_or(defaults.port),
            shutdown_grace: snapshot
                .get_millis(KEY_SHUTDOWN_GRACE_MS)
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apartment_core::ApartmentConfig;

    #[test]
    fn defaults_and_overrides() {
        let cfg = ServerConfig::from_snapshot(&ApartmentConfig::new().snapshot());
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.shutdown_grace, Duration::from_secs(5));

        let mut config = ApartmentConfig::new();
        config.set(KEY_HOST, "0.0.0.0");
        config.set(KEY_PORT, "3030");
        config.set(KEY_SHUTDOWN_GRACE_MS, "250");
        let cfg = ServerConfig::from_snapshot(&config.snapshot());
        assert_eq!(cfg.addr(), "0.0.0.0:3030");
        assert_eq!(cfg.shutdown_grace, Duration::from_millis(250));
    }

    #[test]
    fn bad_port_falls_back() {
        let mut config = ApartmentConfig::new();
        config.set(KEY_PORT, "70000");
        assert_eq!(ServerConfig::from_snapshot(&config.snapshot()).port, DEFAULT_PORT);
    }
}
