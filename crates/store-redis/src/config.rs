use crate::Error;

/// Environment variable naming the Redis host.
pub const HOST_ENV: &str = "CACHE_REDIS_HOST";

/// Environment variable naming the Redis port.
pub const PORT_ENV: &str = "REDIS_PORT";

/// Host used when `CACHE_REDIS_HOST` is unset.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when `REDIS_PORT` is unset.
pub const DEFAULT_PORT: u16 = 6379;

/// Configuration for the `RedisLockStore`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisLockStoreConfig {
    /// Redis server hostname or address.
    pub host: String,

    /// Redis server port.
    pub port: u16,
}

impl Default for RedisLockStoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl RedisLockStoreConfig {
    /// Reads `CACHE_REDIS_HOST` and `REDIS_PORT`, falling back to
    /// `localhost:6379` for whichever is unset.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidPort` if `REDIS_PORT` is not a port number.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup(PORT_ENV) {
            Some(value) => value
                .trim()
                .parse()
                .map_err(|source| Error::InvalidPort { value, source })?,
            None => DEFAULT_PORT,
        };

        Ok(Self { host, port })
    }

    /// Connection URL for the configured server.
    #[must_use]
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RedisLockStoreConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config, RedisLockStoreConfig::default());
        assert_eq!(config.url(), "redis://localhost:6379");
    }

    #[test]
    fn test_reads_host_and_port() {
        let config = RedisLockStoreConfig::from_lookup(lookup(&[
            (HOST_ENV, "cache.internal"),
            (PORT_ENV, "6380"),
        ]))
        .unwrap();

        assert_eq!(config.host, "cache.internal");
        assert_eq!(config.port, 6380);
        assert_eq!(config.url(), "redis://cache.internal:6380");
    }

    #[test]
    fn test_rejects_bad_port() {
        let result = RedisLockStoreConfig::from_lookup(lookup(&[(PORT_ENV, "sixty")]));

        assert_matches!(result, Err(Error::InvalidPort { value, .. }) if value == "sixty");
    }
}
