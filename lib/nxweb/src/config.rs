use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_PORT: u16 = 8055;

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Listen {
    pub address: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_backlog")]
    pub backlog: i32,
}

fn default_backlog() -> i32 {
    4096
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Backend {
    pub address: String,
}

/// Timer queue timeouts, micro-seconds.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Timeouts {
    #[serde(default = "default_keep_alive")]
    pub keep_alive: u64,
    #[serde(default = "default_read")]
    pub read: u64,
    #[serde(default = "default_write")]
    pub write: u64,
    #[serde(default = "default_backend")]
    pub backend: u64,
    #[serde(default = "default_continue100")]
    pub continue100: u64,
    #[serde(default = "default_accept_retry")]
    pub accept_retry: u64,
}

fn default_keep_alive() -> u64 {
    crate::DEFAULT_KEEP_ALIVE_TIMEOUT
}
fn default_read() -> u64 {
    crate::DEFAULT_READ_TIMEOUT
}
fn default_write() -> u64 {
    crate::DEFAULT_WRITE_TIMEOUT
}
fn default_backend() -> u64 {
    crate::DEFAULT_BACKEND_TIMEOUT
}
fn default_continue100() -> u64 {
    crate::DEFAULT_100CONTINUE_TIMEOUT
}
fn default_accept_retry() -> u64 {
    crate::DEFAULT_ACCEPT_RETRY_TIMEOUT
}

impl Default for Timeouts {
    fn default() -> Timeouts {
        Timeouts {
            keep_alive: default_keep_alive(),
            read: default_read(),
            write: default_write(),
            backend: default_backend(),
            continue100: default_continue100(),
            accept_retry: default_accept_retry(),
        }
    }
}

/// Process configuration, read once at startup. Command-line options
/// override individual fields afterwards.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub listen: Vec<Listen>,
    #[serde(default)]
    pub net_threads: Option<usize>,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub error_log: Option<PathBuf>,
    #[serde(default)]
    pub access_log: Option<PathBuf>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub backends: Vec<Backend>,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[serde(default)]
    pub log_level: Option<String>,
}

fn default_shutdown_timeout() -> u64 {
    5
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(serde_json::Error),
    NoSuchTarget(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "can't read config file: {}", err),
            ConfigError::Parse(err) => write!(f, "can't parse config file: {}", err),
            ConfigError::NoSuchTarget(target) => write!(f, "no such config target: {}", target),
        }
    }
}

impl Config {
    /// Load from a JSON file. With a target name, the sub-object
    /// under `"targets"` is selected; otherwise the document root is
    /// the config.
    pub fn load<P: AsRef<Path>>(path: P, target: Option<&str>) -> Result<Config, ConfigError> {
        let text = fs::read_to_string(path).map_err(ConfigError::Io)?;
        Config::from_json(&text, target)
    }

    pub fn from_json(text: &str, target: Option<&str>) -> Result<Config, ConfigError> {
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(ConfigError::Parse)?;
        let selected = match target {
            Some(name) => value
                .get_mut("targets")
                .and_then(|targets| targets.get_mut(name))
                .map(serde_json::Value::take)
                .ok_or_else(|| ConfigError::NoSuchTarget(name.to_owned()))?,
            None => {
                if let Some(obj) = value.as_object_mut() {
                    obj.remove("targets");
                }
                value
            }
        };
        serde_json::from_value(selected).map_err(ConfigError::Parse)
    }

    pub fn log_level(&self) -> crate::logging::LogLevel {
        match self.log_level.as_deref() {
            Some("info") => crate::logging::LogLevel::Info,
            Some("warning") => crate::logging::LogLevel::Warning,
            Some("none") => crate::logging::LogLevel::None,
            _ => crate::logging::LogLevel::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::from_json("{}", None).unwrap();
        assert!(config.listen.is_empty());
        assert_eq!(config.timeouts.keep_alive, crate::DEFAULT_KEEP_ALIVE_TIMEOUT);
        assert_eq!(config.timeouts.continue100, crate::DEFAULT_100CONTINUE_TIMEOUT);
        assert_eq!(config.shutdown_timeout, 5);
    }

    #[test]
    fn test_full_document() {
        let config = Config::from_json(
            r#"{
                "listen": [{"address": ":8055"}, {"address": "127.0.0.1:8056", "secure": true}],
                "net_threads": 2,
                "timeouts": {"keep_alive": 120000000},
                "access_log": "logs/access.log",
                "backends": [{"address": "localhost:8000"}],
                "log_level": "info"
            }"#,
            None,
        )
        .unwrap();
        assert_eq!(config.listen.len(), 2);
        assert_eq!(config.listen[0].address, ":8055");
        assert!(config.listen[1].secure);
        assert_eq!(config.listen[0].backlog, 4096);
        assert_eq!(config.net_threads, Some(2));
        assert_eq!(config.timeouts.keep_alive, 120_000_000);
        // unspecified timeouts keep defaults
        assert_eq!(config.timeouts.read, crate::DEFAULT_READ_TIMEOUT);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.log_level(), crate::logging::LogLevel::Info);
    }

    #[test]
    fn test_target_selection() {
        let text = r#"{
            "listen": [{"address": ":80"}],
            "targets": {
                "dev": {"listen": [{"address": ":8055"}], "net_threads": 1}
            }
        }"#;
        let root = Config::from_json(text, None).unwrap();
        assert_eq!(root.listen[0].address, ":80");
        let dev = Config::from_json(text, Some("dev")).unwrap();
        assert_eq!(dev.listen[0].address, ":8055");
        assert_eq!(dev.net_threads, Some(1));
        assert!(matches!(
            Config::from_json(text, Some("prod")),
            Err(ConfigError::NoSuchTarget(_))
        ));
    }
}
