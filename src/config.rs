use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

pub const OBJECT_URI_VAR: &str = "S3_OBJECT_URI";
pub const SECRET_NAME: &str = "secret";
const EXTENSIONS: &[&str] = &["httpfs"];

// Reads one configuration value by name; production reads the environment.
pub type Lookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

pub fn env_lookup() -> Lookup {
    Arc::new(|key: &str| std::env::var(key).ok())
}

// Empty values count as unset.
fn get(lookup: &Lookup, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.is_empty())
}

fn required(lookup: &Lookup, key: &'static str) -> Result<String, ConfigError> {
    get(lookup, key).ok_or(ConfigError::Missing(key))
}

fn number(lookup: &Lookup, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match get(lookup, key) {
        Some(raw) => raw.trim().parse().map_err(|e| ConfigError::Invalid {
            var: key,
            reason: format!("{raw:?}: {e}"),
        }),
        None => Ok(default),
    }
}

// Zero disables the limit.
fn limit(lookup: &Lookup, key: &'static str, default_secs: u64) -> Result<Option<Duration>, ConfigError> {
    let secs = number(lookup, key, default_secs)?;
    Ok((secs > 0).then(|| Duration::from_secs(secs)))
}

// Resolves the target object for one invocation.
pub fn object_uri(lookup: &Lookup) -> Result<String, ConfigError> {
    required(lookup, OBJECT_URI_VAR)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStyle {
    VirtualHost,
    Path,
}

impl UrlStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlStyle::VirtualHost => "vhost",
            UrlStyle::Path => "path",
        }
    }
}

/// S3 credentials registered in the engine once at cold start. Never logged.
#[derive(Clone)]
pub struct CredentialBundle {
    pub endpoint: String,
    pub key_id: String,
    pub secret: String,
    pub session_token: String,
    pub region: String,
    pub use_ssl: bool,
    pub url_style: UrlStyle,
}

impl CredentialBundle {
    pub fn from_lookup(lookup: &Lookup) -> Result<Self, ConfigError> {
        let use_ssl = match get(lookup, "S3_USE_SSL").map(|v| v.to_ascii_lowercase()) {
            None => true,
            Some(v) if v == "true" || v == "1" => true,
            Some(v) if v == "false" || v == "0" => false,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    var: "S3_USE_SSL",
                    reason: format!("expected a boolean, got {v:?}"),
                })
            }
        };
        let url_style = match get(lookup, "S3_URL_STYLE").as_deref() {
            None | Some("vhost") => UrlStyle::VirtualHost,
            Some("path") => UrlStyle::Path,
            Some(v) => {
                return Err(ConfigError::Invalid {
                    var: "S3_URL_STYLE",
                    reason: format!("expected \"vhost\" or \"path\", got {v:?}"),
                })
            }
        };
        Ok(Self {
            endpoint: required(lookup, "S3_ENDPOINT")?,
            key_id: required(lookup, "AWS_ACCESS_KEY_ID")?,
            secret: required(lookup, "AWS_SECRET_ACCESS_KEY")?,
            session_token: required(lookup, "AWS_SESSION_TOKEN")?,
            region: required(lookup, "AWS_REGION")?,
            use_ssl,
            url_style,
        })
    }
}

impl fmt::Debug for CredentialBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialBundle")
            .field("endpoint", &self.endpoint)
            .field("key_id", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("region", &self.region)
            .field("use_ssl", &self.use_ssl)
            .field("url_style", &self.url_style)
            .finish()
    }
}

/// Connection pool bounds. `None` lifetimes mean "no limit".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_open: u32,
    pub max_idle: u32,
    pub max_lifetime: Option<Duration>,
    pub max_idle_time: Option<Duration>,
    // Only used when an invocation carries no deadline.
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_open: 100,
            max_idle: 10,
            max_lifetime: Some(Duration::from_secs(5 * 60)),
            max_idle_time: Some(Duration::from_secs(2 * 60)),
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolSettings {
    pub fn from_lookup(lookup: &Lookup) -> Result<Self, ConfigError> {
        let count = |key: &'static str, default: u32| -> Result<u32, ConfigError> {
            let n = number(lookup, key, default.into())?;
            u32::try_from(n).map_err(|e| ConfigError::Invalid {
                var: key,
                reason: e.to_string(),
            })
        };
        let acquire = number(lookup, "DUCKDB_ACQUIRE_TIMEOUT_SECS", 30)?;
        if acquire == 0 {
            return Err(ConfigError::Invalid {
                var: "DUCKDB_ACQUIRE_TIMEOUT_SECS",
                reason: "must be at least 1 second".to_string(),
            });
        }
        let settings = Self {
            max_open: count("DUCKDB_MAX_OPEN_CONNS", 100)?,
            max_idle: count("DUCKDB_MAX_IDLE_CONNS", 10)?,
            max_lifetime: limit(lookup, "DUCKDB_CONN_MAX_LIFETIME_SECS", 5 * 60)?,
            max_idle_time: limit(lookup, "DUCKDB_CONN_MAX_IDLE_SECS", 2 * 60)?,
            acquire_timeout: Duration::from_secs(acquire),
        };
        Ok(settings.normalized())
    }

    // Keeps 1 <= max_open and max_idle <= max_open.
    pub fn normalized(mut self) -> Self {
        if self.max_open == 0 {
            warn!("DUCKDB_MAX_OPEN_CONNS is 0, using 1");
            self.max_open = 1;
        }
        if self.max_idle > self.max_open {
            warn!(
                max_idle = self.max_idle,
                max_open = self.max_open,
                "max idle connections exceeds max open, clamping"
            );
            self.max_idle = self.max_open;
        }
        self
    }
}

/// Cold-start configuration for the engine.
#[derive(Debug, Clone)]
pub struct Config {
    pub pool: PoolSettings,
    pub extensions: Vec<String>,
    pub credentials: CredentialBundle,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&env_lookup())
    }

    pub fn from_lookup(lookup: &Lookup) -> Result<Self, ConfigError> {
        Ok(Self {
            pool: PoolSettings::from_lookup(lookup)?,
            extensions: EXTENSIONS.iter().map(|s| s.to_string()).collect(),
            credentials: CredentialBundle::from_lookup(lookup)?,
        })
    }
}

#[cfg(test)]
pub(crate) fn map_lookup(pairs: &[(&str, &str)]) -> Lookup {
    let map: std::collections::HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Arc::new(move |key: &str| map.get(key).cloned())
}
