use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::Deserialize;

/// Top-level gateway configuration.
///
/// Loaded from YAML; every key is optional.
///
/// ```yaml
/// server:
///   listen: ["0.0.0.0:8080"]
///   max_connections: 512
///   keep_alive_timeout_secs: 10
/// tls:
///   cert_file: cert.pem
///   key_file: key.pem
/// lifespan:
///   mode: on
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub tls: Option<TlsConfig>,
    pub lifespan: LifespanConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Vec<String>,
    pub max_connections: usize,
    pub accept_backlog: u32,
    pub max_header_size: usize,
    pub max_body_size: Option<u64>,
    pub max_message_size: usize,
    pub queue_capacity: usize,
    pub header_timeout_secs: u64,
    pub keep_alive_timeout_secs: u64,
    /// Longest a request body may go without receiving a byte.
    pub read_timeout_secs: u64,
    pub app_timeout_secs: Option<u64>,
    pub shutdown_grace_secs: u64,
    pub abort_grace_secs: u64,
    pub ws_close_timeout_secs: u64,
    pub sse_keepalive_secs: Option<u64>,
    /// Extensions offered to applications. `None` offers every known one.
    pub extensions: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["127.0.0.1:8080".to_string()],
            max_connections: 1024,
            accept_backlog: 1024,
            max_header_size: 8192,
            max_body_size: None,
            max_message_size: 1 << 20,
            queue_capacity: 16,
            header_timeout_secs: 30,
            keep_alive_timeout_secs: 5,
            read_timeout_secs: 30,
            app_timeout_secs: None,
            shutdown_grace_secs: 30,
            abort_grace_secs: 1,
            ws_close_timeout_secs: 5,
            sse_keepalive_secs: None,
            extensions: None,
        }
    }
}

impl ServerConfig {
    pub fn header_timeout(&self) -> Duration {
        Duration::from_secs(self.header_timeout_secs)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_secs(self.keep_alive_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn app_timeout(&self) -> Option<Duration> {
        self.app_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn ws_close_timeout(&self) -> Duration {
        Duration::from_secs(self.ws_close_timeout_secs)
    }

    pub fn sse_keepalive(&self) -> Option<Duration> {
        self.sse_keepalive_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_handshake_timeout() -> u64 {
    10
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifespanMode {
    /// Run lifespan; an application that doesn't answer is assumed not to
    /// support it.
    #[default]
    Auto,
    /// Run lifespan; failing to answer is fatal.
    On,
    Off,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifespanConfig {
    pub mode: LifespanMode,
    pub timeout_secs: u64,
}

impl Default for LifespanConfig {
    fn default() -> Self {
        Self {
            mode: LifespanMode::Auto,
            timeout_secs: 30,
        }
    }
}

impl LifespanConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Loads the file named by `PAGI_CONFIG` (defaults when unset), then
    /// applies the `LISTEN` override, a comma-separated address list.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = match std::env::var_os("PAGI_CONFIG") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Ok(listen) = std::env::var("LISTEN") {
            let addrs: Vec<String> = listen
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !addrs.is_empty() {
                cfg.server.listen = addrs;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_yaml(text: &str) -> anyhow::Result<Self> {
        let cfg: Config = serde_yaml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let server = &self.server;
        if server.listen.is_empty() {
            bail!("server.listen must name at least one address");
        }
        if server.max_connections == 0 {
            bail!("server.max_connections must be greater than zero");
        }
        if server.queue_capacity == 0 {
            bail!("server.queue_capacity must be greater than zero");
        }
        if server.max_header_size == 0 {
            bail!("server.max_header_size must be greater than zero");
        }
        if server.read_timeout_secs == 0 {
            bail!("server.read_timeout_secs must be greater than zero");
        }
        if server.max_message_size == 0 {
            bail!("server.max_message_size must be greater than zero");
        }
        Ok(())
    }
}
