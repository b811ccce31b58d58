//! Configuration: TOML file, environment overrides, compiled defaults.
//!
//! Precedence (highest first): environment variables, config file values,
//! built-in defaults. A missing config file is not an error — the gateway
//! runs fine on defaults next to a local guacd.

use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub guacd: GuacdConfig,
    pub terminal: TerminalConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8088".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuacdConfig {
    pub hostname: String,
    pub port: u16,
    /// Root for guacd screen recordings and terminal casts.
    pub recording: PathBuf,
    /// Root for per-user virtual drive folders and non-ssh session storage.
    pub drive: PathBuf,
    /// Pass a recording path to guacd for proxied sessions.
    pub record_sessions: bool,
}

impl Default for GuacdConfig {
    fn default() -> Self {
        Self {
            hostname: "127.0.0.1".to_owned(),
            port: 4822,
            recording: PathBuf::from("/usr/local/quickgate/data/recording"),
            drive: PathBuf::from("/usr/local/quickgate/data/drive"),
            record_sessions: false,
        }
    }
}

impl GuacdConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    /// Output coalescing window for the terminal bridge.
    pub flush_interval_ms: u64,
    pub connect_timeout_secs: u64,
    /// Record native terminal sessions as asciicast files.
    pub record_sessions: bool,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 60,
            connect_timeout_secs: 10,
            record_sessions: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
        }
    }
}

impl Config {
    /// Load from `path` (when given), then apply env overrides.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => {
                let raw = std::fs::read_to_string(p)
                    .map_err(|e| format!("cannot read config file {p}: {e}"))?;
                toml::from_str(&raw).map_err(|e| format!("invalid config file {p}: {e}"))?
            }
            None => Config::default(),
        };
        config.apply_env_from(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Apply env overrides through a lookup closure (injectable for tests).
    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = get("QUICKGATE_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(addr) = get("QUICKGATE_GUACD_ADDR") {
            match addr.rsplit_once(':').map(|(h, p)| (h, p.parse::<u16>())) {
                Some((host, Ok(port))) => {
                    self.guacd.hostname = host.to_owned();
                    self.guacd.port = port;
                }
                _ => tracing::warn!(addr = %addr, "ignoring malformed QUICKGATE_GUACD_ADDR"),
            }
        }
        if let Some(level) = get("QUICKGATE_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    /// Create the recording and drive roots. Called once at startup so file
    /// handlers never race on first use.
    pub async fn ensure_directories(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.guacd.recording).await?;
        tokio::fs::create_dir_all(&self.guacd.drive).await?;
        Ok(())
    }
}
