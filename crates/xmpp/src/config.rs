use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientOption, XmppClientBuilder};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration file not found at {path}")]
    FileNotFound { path: PathBuf },

    #[error("invalid TOML at line {line}, column {column}: {message}")]
    InvalidToml {
        line: usize,
        column: usize,
        message: String,
    },

    #[error("missing required fields: {fields:?}")]
    MissingRequiredFields { fields: Vec<String> },

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("I/O error reading configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub account: AccountConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// XMPP domain, used for the stream header and TLS verification
    pub domain: String,
    /// Host to connect to when it differs from the domain
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default = "default_true")]
    pub tcp_nodelay: bool,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    pub resource: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    pub fn host(&self) -> &str {
        self.server.host.as_deref().unwrap_or(&self.server.domain)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_seconds)
    }

    /// Applies connection options and timeouts to a client builder.
    pub fn apply(&self, builder: XmppClientBuilder) -> XmppClientBuilder {
        builder
            .option(ClientOption::EnableTls, self.server.enable_tls)
            .option(ClientOption::TcpNoDelay, self.server.tcp_nodelay)
            .timeout(self.timeout())
    }
}

#[derive(Debug, Default, Clone)]
struct ConfigOverrides {
    host: Option<String>,
    domain: Option<String>,
    username: Option<String>,
    password: Option<String>,
    log_level: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_port() -> u16 {
    5222
}

fn default_timeout_seconds() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Template written by `waddle-connect --init`.
pub const DEFAULT_CONFIG_TOML: &str = r#"[server]
domain = "example.org"
# host = "xmpp.example.org"
port = 5222
enable_tls = false
tcp_nodelay = true
timeout_seconds = 30

[account]
username = ""
password = ""
# resource = "waddle"

[logging]
level = "info"
"#;

/// Load configuration from a specific path, merging `WADDLE_*` environment
/// overrides.
pub fn load_config_from(path: impl AsRef<Path>) -> Result<ClientConfig, ConfigError> {
    load_config_from_with_overrides(path.as_ref(), config_overrides_from_env())
}

/// Parse configuration from a TOML string directly.
pub fn load_config_from_str(toml_str: &str) -> Result<ClientConfig, ConfigError> {
    load_config_from_str_with_overrides(toml_str, config_overrides_from_env())
}

fn load_config_from_with_overrides(
    path: &Path,
    overrides: ConfigOverrides,
) -> Result<ClientConfig, ConfigError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Err(e) => return Err(ConfigError::Io(e)),
    };

    load_config_from_str_with_overrides(&contents, overrides)
}

fn load_config_from_str_with_overrides(
    toml_str: &str,
    overrides: ConfigOverrides,
) -> Result<ClientConfig, ConfigError> {
    let mut config: ClientConfig = toml::from_str(toml_str).map_err(|e| {
        let (line, column) = e.span().map_or((0, 0), |span| {
            let before = &toml_str[..span.start];
            let line = before.chars().filter(|&c| c == '\n').count() + 1;
            let column = before
                .rfind('\n')
                .map_or(span.start + 1, |nl| span.start - nl);
            (line, column)
        });
        ConfigError::InvalidToml {
            line,
            column,
            message: e.message().to_string(),
        }
    })?;

    apply_overrides(&mut config, overrides);
    validate(&config)?;

    Ok(config)
}

fn config_overrides_from_env() -> ConfigOverrides {
    ConfigOverrides {
        host: std::env::var("WADDLE_HOST").ok(),
        domain: std::env::var("WADDLE_DOMAIN").ok(),
        username: std::env::var("WADDLE_USERNAME").ok(),
        password: std::env::var("WADDLE_PASSWORD").ok(),
        log_level: std::env::var("WADDLE_LOG_LEVEL").ok(),
    }
}

fn apply_overrides(config: &mut ClientConfig, overrides: ConfigOverrides) {
    if let Some(host) = overrides.host {
        config.server.host = Some(host);
    }
    if let Some(domain) = overrides.domain {
        config.server.domain = domain;
    }
    if let Some(username) = overrides.username {
        config.account.username = username;
    }
    if let Some(password) = overrides.password {
        config.account.password = password;
    }
    if let Some(level) = overrides.log_level {
        config.logging.level = level;
    }
}

fn validate(config: &ClientConfig) -> Result<(), ConfigError> {
    let mut missing = Vec::new();

    if config.server.domain.is_empty() {
        missing.push("server.domain".to_string());
    }
    if config.account.username.is_empty() {
        missing.push("account.username".to_string());
    }
    if config.account.password.is_empty() {
        missing.push("account.password".to_string());
    }

    if !missing.is_empty() {
        return Err(ConfigError::MissingRequiredFields { fields: missing });
    }

    if config.server.port == 0 {
        return Err(ConfigError::InvalidValue {
            field: "server.port".to_string(),
            message: "must be between 1 and 65535".to_string(),
        });
    }

    if config.server.timeout_seconds == 0 {
        return Err(ConfigError::InvalidValue {
            field: "server.timeout_seconds".to_string(),
            message: "must be greater than zero".to_string(),
        });
    }

    if !VALID_LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::InvalidValue {
            field: "logging.level".to_string(),
            message: format!("must be one of: {}", VALID_LOG_LEVELS.join(", ")),
        });
    }

    Ok(())
}
