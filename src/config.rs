//! Configuration for the Keystone gateway.
//!
//! Supports both command-line arguments and an optional TOML file. CLI
//! arguments take precedence over file values, which take precedence
//! over built-in defaults.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "keystone")]
#[command(author = "keystone authors")]
#[command(version = "0.1.0")]
#[command(about = "An HTTP/1.1 gateway scripted in LuaJIT", long_about = None)]
pub struct CliArgs {
    /// Path to the Lua route script.
    #[arg(short, long)]
    pub script: PathBuf,

    /// Path to an optional TOML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g. 0.0.0.0:8080).
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to the number of CPUs).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Disable the SO_ATTACH_REUSEPORT_CBPF affinity filter even when
    /// the platform supports it.
    #[arg(long, default_value_t = false)]
    pub no_bpf_affinity: bool,
}

/// TOML configuration file structure.
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    #[serde(default = "default_write_buffer_size")]
    pub write_buffer_size: usize,
    #[serde(default = "default_accept_backlog")]
    pub accept_backlog: i32,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_enable_bpf_affinity")]
    pub enable_bpf_affinity: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: default_read_buffer_size(),
            write_buffer_size: default_write_buffer_size(),
            accept_backlog: default_accept_backlog(),
            max_connections: default_max_connections(),
            ring_size: default_ring_size(),
            batch_size: default_batch_size(),
            enable_bpf_affinity: default_enable_bpf_affinity(),
        }
    }
}

#[derive(Debug, Deserialize)]
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

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}
fn default_read_buffer_size() -> usize {
    8 * 1024
}
fn default_write_buffer_size() -> usize {
    8 * 1024
}
fn default_accept_backlog() -> i32 {
    128
}
fn default_max_connections() -> usize {
    4096
}
fn default_ring_size() -> u32 {
    256
}
fn default_batch_size() -> usize {
    64
}
fn default_enable_bpf_affinity() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Final, resolved configuration used by the rest of the crate.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub workers: usize,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub accept_backlog: i32,
    pub max_connections: usize,
    pub ring_size: u32,
    pub batch_size: usize,
    pub enable_bpf_affinity: bool,
    pub script_path: PathBuf,
}

impl Config {
    /// Parses CLI arguments and resolves configuration from them (and an
    /// optional TOML file). Split from `load` so logging can be
    /// initialized from `cli.log_level` before any fallible file I/O runs.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        Self::from_cli(cli)
    }

    /// Resolves configuration from already-parsed CLI args and an
    /// optional TOML file. CLI arguments take precedence over the file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref path) = cli.config {
            let contents = std::fs::read_to_string(path)
                .map_err(|e| ConfigError::FileRead(path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let workers = cli
            .workers
            .or(toml_config.server.workers)
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            });

        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            workers,
            read_buffer_size: toml_config.runtime.read_buffer_size,
            write_buffer_size: toml_config.runtime.write_buffer_size,
            accept_backlog: toml_config.runtime.accept_backlog,
            max_connections: toml_config.runtime.max_connections,
            ring_size: toml_config.runtime.ring_size,
            batch_size: toml_config.runtime.batch_size,
            enable_bpf_affinity: toml_config.runtime.enable_bpf_affinity && !cli.no_bpf_affinity,
            script_path: cli.script,
        })
    }

    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }

    /// Reads the Lua route script named by `--script`.
    pub fn read_script(&self) -> Result<String, ConfigError> {
        std::fs::read_to_string(&self.script_path)
            .map_err(|e| ConfigError::ScriptRead(self.script_path.clone(), e))
    }
}

#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    ScriptRead(PathBuf, std::io::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ScriptRead(path, e) => {
                write!(f, "failed to read script file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_toml_config_matches_documented_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:8080");
        assert_eq!(config.runtime.read_buffer_size, 8192);
        assert_eq!(config.runtime.accept_backlog, 128);
        assert!(config.runtime.enable_bpf_affinity);
    }

    #[test]
    fn toml_parsing_overrides_defaults() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4

            [runtime]
            read_buffer_size = 16384
            enable_bpf_affinity = false

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.runtime.read_buffer_size, 16384);
        assert!(!config.runtime.enable_bpf_affinity);
        assert_eq!(config.logging.level, "debug");
    }
}
