//! Server configuration loaded from a TOML file.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;

/// Default configuration, printed by `--print-config`.
pub const DEFAULT_CONFIG: &str = r#"name = "echo"

[listener]
address = "127.0.0.1:7878"
reuse_port = false
tcp_nodelay = false

[workers]
# 0 runs every connection on the base loop.
threads = 0

[logging]
level = "info"
format = "pretty"
thread_names = true
"#;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server name, used in connection names and worker thread names.
    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default)]
    pub listener: ListenerConfig,

    #[serde(default)]
    pub workers: WorkersConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            name: default_name(),
            listener: ListenerConfig::default(),
            workers: WorkersConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Listen address; host names are resolved at startup.
    #[serde(default = "default_address")]
    pub address: String,

    /// Allow multiple sockets to bind the same port (SO_REUSEPORT).
    #[serde(default)]
    pub reuse_port: bool,

    /// Set TCP_NODELAY on accepted connections.
    #[serde(default)]
    pub tcp_nodelay: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        ListenerConfig {
            address: default_address(),
            reuse_port: false,
            tcp_nodelay: false,
        }
    }
}

impl ListenerConfig {
    /// Blocking name resolution to the first matching address.
    pub fn resolve(&self) -> io::Result<SocketAddr> {
        self.address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("'{}' resolved to no addresses", self.address),
            )
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkersConfig {
    /// Worker reactor count; 0 keeps everything on the base loop.
    #[serde(default)]
    pub threads: usize,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level filter; the RUST_LOG environment variable wins over this.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,

    /// Include thread names in log lines (worker threads are named).
    #[serde(default = "default_true")]
    pub thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_level(),
            format: LogFormat::default(),
            thread_names: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

fn default_name() -> String {
    "echo".to_string()
}

fn default_address() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
