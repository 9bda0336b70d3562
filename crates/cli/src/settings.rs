//! Startup configuration.
//!
//! Values come from three layers: command-line flags (or their environment
//! variables), then the optional TOML file, then built-in defaults.

use futumcp_core::{AccountMode, Secret};
use futumcp_gateway::GatewayConfig;
use futumcp_tools::SessionSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "futu-mcp.toml";
pub const DEFAULT_BIND: &str = "127.0.0.1:8808";
pub const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// File layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub gateway: GatewaySection,
    pub logging: LoggingSection,
    pub server: ServerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewaySection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unlock_password: Option<String>,
    pub account_mode: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        let session = SessionSettings::default();
        Self {
            host: None,
            port: None,
            unlock_password: None,
            account_mode: None,
            connect_timeout_secs: session.connect_timeout.as_secs(),
            request_timeout_secs: session.request_timeout.as_secs(),
            keepalive_interval_secs: GatewayConfig::default().keepalive_interval_secs,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub file: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub bind: Option<String>,
}

impl FileConfig {
    /// Load the file at `explicit`, or the default path if it exists.
    ///
    /// An explicitly named file must exist; a missing default file yields
    /// the defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, SettingsError> {
        match explicit {
            Some(path) => Self::from_path(path),
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::from_path(path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, SettingsError> {
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ---------------------------------------------------------------------------
// Resolved settings
// ---------------------------------------------------------------------------

/// Values supplied on the command line or through the environment.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub unlock_password: Option<String>,
    pub account_mode: Option<AccountMode>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
    pub file: Option<PathBuf>,
    pub json: bool,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub session: SessionSettings,
    pub gateway: GatewayConfig,
    pub log: LogSettings,
    pub bind: String,
}

impl Settings {
    pub fn resolve(file: FileConfig, cli: Overrides) -> Result<Self, SettingsError> {
        let FileConfig {
            gateway,
            logging,
            server,
        } = file;
        let defaults = SessionSettings::default();

        let account_mode = match cli.account_mode {
            Some(mode) => mode,
            None => match gateway.account_mode.as_deref() {
                Some(raw) => raw.parse().map_err(|_| SettingsError::Invalid {
                    key: "gateway.account_mode",
                    reason: format!("expected REAL or SIMULATE, got {:?}", raw),
                })?,
                None => defaults.account_mode,
            },
        };

        // An empty password means "not set".
        let unlock_password = cli
            .unlock_password
            .or(gateway.unlock_password)
            .filter(|p| !p.is_empty())
            .map(Secret::new);

        let session = SessionSettings {
            host: cli.host.or(gateway.host).unwrap_or(defaults.host),
            port: cli.port.or(gateway.port).unwrap_or(defaults.port),
            unlock_password,
            account_mode,
            connect_timeout: Duration::from_secs(gateway.connect_timeout_secs),
            request_timeout: Duration::from_secs(gateway.request_timeout_secs),
        };

        let settings = Self {
            session,
            gateway: GatewayConfig {
                keepalive_interval_secs: gateway.keepalive_interval_secs,
                ..GatewayConfig::default()
            },
            log: LogSettings {
                level: cli
                    .log_level
                    .or(logging.level)
                    .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
                file: cli.log_file.or(logging.file),
                json: cli.log_json || logging.json,
            },
            bind: server.bind.unwrap_or_else(|| DEFAULT_BIND.to_string()),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.session.host.trim().is_empty() {
            return Err(SettingsError::Invalid {
                key: "gateway.host",
                reason: "must not be empty".into(),
            });
        }
        if self.session.port == 0 {
            return Err(SettingsError::Invalid {
                key: "gateway.port",
                reason: "must be between 1 and 65535".into(),
            });
        }
        if self.session.connect_timeout.is_zero() {
            return Err(SettingsError::Invalid {
                key: "gateway.connect_timeout_secs",
                reason: "must be positive".into(),
            });
        }
        if self.session.request_timeout.is_zero() {
            return Err(SettingsError::Invalid {
                key: "gateway.request_timeout_secs",
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
[gateway]
host = "10.0.0.5"
port = 11112
unlock_password = "246810"
account_mode = "real"
request_timeout_secs = 30

[logging]
level = "debug"
json = true

[server]
bind = "0.0.0.0:9000"
"#;

    #[test]
    fn test_parse_example_config() {
        let file: FileConfig = toml::from_str(EXAMPLE).unwrap();
        let settings = Settings::resolve(file, Overrides::default()).unwrap();

        assert_eq!(settings.session.host, "10.0.0.5");
        assert_eq!(settings.session.port, 11112);
        assert_eq!(
            settings.session.unlock_password.as_ref().map(Secret::expose),
            Some("246810")
        );
        assert_eq!(settings.session.account_mode, AccountMode::Real);
        assert_eq!(settings.session.request_timeout, Duration::from_secs(30));
        assert_eq!(settings.session.connect_timeout, Duration::from_secs(10));
        assert_eq!(settings.log.level, "debug");
        assert!(settings.log.json);
        assert_eq!(settings.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_defaults_without_file() {
        let settings = Settings::resolve(FileConfig::default(), Overrides::default()).unwrap();
        assert_eq!(settings.session, SessionSettings::default());
        assert_eq!(settings.gateway.keepalive_interval_secs, 10);
        assert_eq!(settings.log.level, "info");
        assert_eq!(settings.bind, DEFAULT_BIND);
    }

    #[test]
    fn test_flags_override_file() {
        let file: FileConfig = toml::from_str(EXAMPLE).unwrap();
        let cli = Overrides {
            host: Some("127.0.0.1".into()),
            unlock_password: Some(String::new()),
            account_mode: Some(AccountMode::Simulate),
            log_level: Some("warn".into()),
            ..Overrides::default()
        };
        let settings = Settings::resolve(file, cli).unwrap();

        assert_eq!(settings.session.host, "127.0.0.1");
        assert_eq!(settings.session.port, 11112);
        assert!(settings.session.unlock_password.is_none());
        assert_eq!(settings.session.account_mode, AccountMode::Simulate);
        assert_eq!(settings.log.level, "warn");
    }

    #[test]
    fn test_rejects_bad_values() {
        let file: FileConfig = toml::from_str("[gateway]\nport = 0\n").unwrap();
        assert!(matches!(
            Settings::resolve(file, Overrides::default()),
            Err(SettingsError::Invalid { key: "gateway.port", .. })
        ));

        let file: FileConfig = toml::from_str("[gateway]\naccount_mode = \"paper\"\n").unwrap();
        assert!(Settings::resolve(file, Overrides::default()).is_err());

        assert!(toml::from_str::<FileConfig>("[gateway]\nhots = \"x\"\n").is_err());
    }
}
