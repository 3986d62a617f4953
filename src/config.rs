//! Runtime configuration.
//!
//! Everything is read once from the environment at startup and is immutable
//! afterwards.

use std::{
    env,
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use n0_error::{e, stack_error};

/// Default external port when `PORT` is unset.
pub const DEFAULT_PORT: u16 = 8080;

/// Identifier used when `UUID` is unset.
pub const DEFAULT_UUID: &str = "0dff8b4c-f778-4648-8817-3a434f7fa443";

/// Loopback port the backend listens on.
pub const INTERNAL_PORT: u16 = 12345;

/// Path on which WebSocket upgrades are spliced to the backend.
///
/// Must equal the path written into the backend config.
pub const WS_PATH: &str = "/vless";

/// Default backend working directory, relative to the current directory.
pub const DEFAULT_APP_DIR: &str = "sap_app";

/// Shortest idle timeout we accept; proxy sessions are long-lived.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// How much data to buffer for a request header section before giving up.
pub(crate) const HEADER_SECTION_MAX_LENGTH: usize = 8192;

/// Invalid startup configuration.
#[stack_error(derive, add_meta)]
#[non_exhaustive]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("invalid value for {key}: {value:?}")]
    InvalidVar {
        /// Variable name.
        key: &'static str,
        /// The rejected raw value.
        value: String,
    },

    /// The external port equals the backend port.
    #[error("external port {port} collides with the internal backend port")]
    PortCollision { port: u16 },

    /// The idle timeout is too short for long-lived sessions.
    #[error("idle timeout of {secs}s is below the minimum of {min}s")]
    IdleTimeoutTooShort { secs: u64, min: u64 },

    /// The WebSocket path is not absolute.
    #[error("websocket path {path:?} must start with '/'")]
    RelativeWsPath { path: String },
}

/// Immutable relay configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Client identifier (UUID form) shared by the backend config and the
    /// advertised URI.
    pub identifier: String,
    /// Port the relay listens on, on all interfaces.
    pub external_port: u16,
    /// Loopback port of the backend.
    pub internal_port: u16,
    /// Path whose WebSocket upgrades are spliced to the backend.
    pub ws_path: String,
    /// Directory holding the backend binary and its config.
    pub app_dir: PathBuf,
    /// Tear down spliced pairs after this much inactivity in both directions.
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            identifier: DEFAULT_UUID.to_string(),
            external_port: DEFAULT_PORT,
            internal_port: INTERNAL_PORT,
            ws_path: WS_PATH.to_string(),
            app_dir: PathBuf::from(DEFAULT_APP_DIR),
            idle_timeout: None,
        }
    }
}

impl Config {
    /// Loads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(port) = lookup("PORT") {
            config.external_port = match port.trim().parse::<u16>() {
                Ok(port) if port != 0 => port,
                _ => {
                    return Err(e!(ConfigError::InvalidVar {
                        key: "PORT",
                        value: port
                    }));
                }
            };
        }

        if let Some(identifier) = lookup("UUID") {
            let identifier = identifier.trim().to_string();
            if uuid::Uuid::try_parse(&identifier).is_err() {
                return Err(e!(ConfigError::InvalidVar {
                    key: "UUID",
                    value: identifier
                }));
            }
            config.identifier = identifier;
        }

        if let Some(dir) = lookup("APP_DIR").filter(|dir| !dir.trim().is_empty()) {
            config.app_dir = PathBuf::from(dir);
        }

        if let Some(secs) = lookup("IDLE_TIMEOUT_SECS") {
            let Ok(parsed) = secs.trim().parse::<u64>() else {
                return Err(e!(ConfigError::InvalidVar {
                    key: "IDLE_TIMEOUT_SECS",
                    value: secs
                }));
            };
            config.idle_timeout = Some(Duration::from_secs(parsed));
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants between fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.external_port == self.internal_port {
            return Err(e!(ConfigError::PortCollision {
                port: self.external_port
            }));
        }
        if !self.ws_path.starts_with('/') {
            return Err(e!(ConfigError::RelativeWsPath {
                path: self.ws_path.clone()
            }));
        }
        if let Some(timeout) = self.idle_timeout
            && timeout < MIN_IDLE_TIMEOUT
        {
            return Err(e!(ConfigError::IdleTimeoutTooShort {
                secs: timeout.as_secs(),
                min: MIN_IDLE_TIMEOUT.as_secs()
            }));
        }
        Ok(())
    }

    /// Address the external listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.external_port))
    }

    /// Loopback address of the backend.
    pub fn backend_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.internal_port))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.external_port, 8080);
        assert_eq!(config.internal_port, 12345);
        assert_eq!(config.identifier, DEFAULT_UUID);
        assert_eq!(config.ws_path, "/vless");
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.listen_addr().to_string(), "0.0.0.0:8080");
        assert_eq!(config.backend_addr().to_string(), "127.0.0.1:12345");
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("PORT", "3000"),
            ("UUID", "8c1f3a52-6d0e-4b7a-9f21-5e4d3c2b1a00"),
            ("APP_DIR", "/tmp/relay"),
            ("IDLE_TIMEOUT_SECS", "600"),
        ])
        .unwrap();
        assert_eq!(config.external_port, 3000);
        assert_eq!(config.identifier, "8c1f3a52-6d0e-4b7a-9f21-5e4d3c2b1a00");
        assert_eq!(config.app_dir, PathBuf::from("/tmp/relay"));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            load(&[("PORT", "0")]),
            Err(ConfigError::InvalidVar { key: "PORT", .. })
        ));
        assert!(matches!(
            load(&[("PORT", "http")]),
            Err(ConfigError::InvalidVar { key: "PORT", .. })
        ));
        assert!(matches!(
            load(&[("UUID", "not-a-uuid")]),
            Err(ConfigError::InvalidVar { key: "UUID", .. })
        ));
        assert!(matches!(
            load(&[("PORT", "12345")]),
            Err(ConfigError::PortCollision { port: 12345, .. })
        ));
        assert!(matches!(
            load(&[("IDLE_TIMEOUT_SECS", "30")]),
            Err(ConfigError::IdleTimeoutTooShort { secs: 30, .. })
        ));
    }

    #[test]
    fn ws_path_must_be_absolute() {
        let config = Config {
            ws_path: "vless".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativeWsPath { .. })
        ));
    }
}
