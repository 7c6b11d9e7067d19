use std::time::Duration;

use serde::Deserialize;

/// Configuration of a single [`LazyCache`](crate::LazyCache).
///
/// ```yaml
/// name: connections
/// lifetime: 10s
/// ```
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Name of the cache, used in log output.
    pub name: Option<String>,

    /// Maximum duration an entry stays in the cache since it was last requested.
    ///
    /// Entries never expire when this is unset or zero.
    #[serde(with = "humantime_serde")]
    pub lifetime: Option<Duration>,
}

impl CacheConfig {
    /// The idle lifetime, with a zero duration meaning "never expire".
    pub(crate) fn effective_lifetime(&self) -> Option<Duration> {
        self.lifetime.filter(|lifetime| !lifetime.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lifetime() {
        let config: CacheConfig = serde_yaml::from_str("name: conns\nlifetime: 1m 30s\n").unwrap();
        assert_eq!(config.name.as_deref(), Some("conns"));
        assert_eq!(config.lifetime, Some(Duration::from_secs(90)));
        assert_eq!(config.effective_lifetime(), Some(Duration::from_secs(90)));
    }

    #[test]
    fn test_defaults() {
        let config: CacheConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config, CacheConfig::default());
        assert_eq!(config.effective_lifetime(), None);
    }

    #[test]
    fn test_zero_lifetime_never_expires() {
        let config: CacheConfig = serde_yaml::from_str("lifetime: 0s").unwrap();
        assert_eq!(config.lifetime, Some(Duration::ZERO));
        assert_eq!(config.effective_lifetime(), None);
    }

    #[test]
    fn test_invalid_lifetime() {
        let result = serde_yaml::from_str::<CacheConfig>("lifetime: soon");
        assert!(result.is_err());
    }
}
