//! Configuration data model

use std::time::Duration;

/// Default daemon host
pub const DEFAULT_HOST: &str = "localhost";

/// Default daemon port
pub const DEFAULT_PORT: u16 = 6600;

/// Default interval between keep-alive pings
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

/// Environment variable overriding the daemon host (`[password@]host`)
pub const MPD_HOST_ENV: &str = "MPD_HOST";

/// Environment variable overriding the daemon port
pub const MPD_PORT_ENV: &str = "MPD_PORT";

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub global: GlobalConfig,
    pub server: ServerConfig,
    pub keepalive: KeepaliveConfig,
}

/// Global settings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfig {
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Where the daemon lives and how to authenticate against it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Sent with `password` on every connection when set
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            password: None,
        }
    }
}

impl ServerConfig {
    /// `host:port` form accepted by `TcpStream::connect`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Apply an `MPD_HOST` style value.
    ///
    /// Accepts either `host` or `password@host`. An empty password part
    /// (`@host`) leaves the configured password untouched.
    pub fn apply_host_override(&mut self, value: &str) {
        match value.rsplit_once('@') {
            Some((password, host)) => {
                if !password.is_empty() {
                    self.password = Some(password.to_string());
                }
                if !host.is_empty() {
                    self.host = host.to_string();
                }
            }
            None => {
                if !value.is_empty() {
                    self.host = value.to_string();
                }
            }
        }
    }

    /// Apply an `MPD_PORT` style value
    pub fn apply_port_override(&mut self, value: &str) -> Result<(), String> {
        match value.trim().parse::<u16>() {
            Ok(0) | Err(_) => Err(format!("Invalid port: {}", value)),
            Ok(port) => {
                self.port = port;
                Ok(())
            }
        }
    }
}

/// Keep-alive ping settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
        }
    }
}

impl Config {
    /// Apply `MPD_HOST` and `MPD_PORT` from the process environment.
    ///
    /// An unparsable `MPD_PORT` is reported and ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var(MPD_HOST_ENV) {
            self.server.apply_host_override(&host);
        }
        if let Ok(port) = std::env::var(MPD_PORT_ENV) {
            if let Err(e) = self.server.apply_port_override(&port) {
                tracing::warn!("Ignoring {}: {}", MPD_PORT_ENV, e);
            }
        }
        self
    }
}
