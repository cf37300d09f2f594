use std::env;

/// Event store configuration parsed from environment variables
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Postgres connection string. `None` selects the in-memory backend.
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    /// Run `CREATE TABLE IF NOT EXISTS` on startup
    pub ensure_schema: bool,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be a valid {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 3,
            ensure_schema: true,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());

        let max_connections =
            parse_or("DB_MAX_CONNECTIONS", &lookup, "u32", defaults.max_connections)?;
        let min_connections =
            parse_or("DB_MIN_CONNECTIONS", &lookup, "u32", defaults.min_connections)?;
        let acquire_timeout_secs = parse_or(
            "DB_ACQUIRE_TIMEOUT_SECS",
            &lookup,
            "u64",
            defaults.acquire_timeout_secs,
        )?;
        let ensure_schema =
            parse_or("EVENT_STORE_ENSURE_SCHEMA", &lookup, "bool", defaults.ensure_schema)?;

        Ok(StoreConfig {
            database_url,
            max_connections,
            min_connections,
            acquire_timeout_secs,
            ensure_schema,
        })
    }
}

fn parse_or<T, F>(
    name: &'static str,
    lookup: &F,
    expected: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected,
            value,
        }),
    }
}
