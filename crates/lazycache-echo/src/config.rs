use std::fs;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use lazycache::CacheConfig;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Settings of the `serve` command.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    /// The address to accept connections on.
    pub bind: SocketAddr,
}

impl Default for ServeConfig {
    fn default() -> Self {
        ServeConfig {
            bind: (Ipv4Addr::LOCALHOST, 8080).into(),
        }
    }
}

/// Settings of the `send` command.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    /// The address to connect to.
    pub addr: String,
    /// The number of concurrent tasks sharing the connection.
    pub tasks: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            addr: "127.0.0.1:8080".into(),
            tasks: 10,
        }
    }
}

/// The configuration of `lazycache-echo`, usually read from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configuration for internal logging.
    pub logging: Logging,

    /// The cache holding outgoing connections.
    pub cache: CacheConfig,

    /// Options of the `serve` command.
    pub serve: ServeConfig,

    /// Options of the `send` command.
    pub send: SendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            logging: Logging::default(),
            cache: CacheConfig {
                name: Some("connections".into()),
                lifetime: Some(Duration::from_secs(10)),
            },
            serve: ServeConfig::default(),
            send: SendConfig::default(),
        }
    }
}

impl Config {
    /// Loads the configuration from the given YAML file, or the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

fn deserialize_level_filter<'de, D>(deserializer: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let level = String::deserialize(deserializer)?;
    level.parse().map_err(de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::get(None).unwrap();
        assert_eq!(config.logging.level, LevelFilter::INFO);
        assert_eq!(config.logging.format, LogFormat::Auto);
        assert_eq!(config.cache.lifetime, Some(Duration::from_secs(10)));
        assert_eq!(config.serve.bind, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.send.tasks, 10);
    }

    #[test]
    fn test_parse_config() {
        let yaml = r#"
logging:
  level: debug
  format: json
cache:
  lifetime: 2s
serve:
  bind: 0.0.0.0:9000
send:
  addr: example.com:9000
  tasks: 3
"#;
        let config = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(config.logging.level, LevelFilter::DEBUG);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.cache.lifetime, Some(Duration::from_secs(2)));
        assert_eq!(config.cache.name, None);
        assert_eq!(config.serve.bind, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.send.addr, "example.com:9000");
        assert_eq!(config.send.tasks, 3);
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::from_reader("send:\n  tasks: 50\n".as_bytes()).unwrap();
        assert_eq!(config.send.tasks, 50);
        assert_eq!(config.send.addr, "127.0.0.1:8080");
        assert_eq!(config.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_empty_config() {
        let result = Config::from_reader("  \n".as_bytes());
        assert_eq!(result.unwrap_err().to_string(), "config file empty");
    }

    #[test]
    fn test_invalid_level() {
        let result = Config::from_reader("logging:\n  level: loud\n".as_bytes());
        assert!(result.is_err());
    }
}
