use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("XCHANGE_JWT_SECRET is unset or still a placeholder")]
    MissingSecret,

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
    pub store_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let jwt_secret = get("XCHANGE_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            return Err(ConfigError::MissingSecret);
        }

        let db_path = get("XCHANGE_DB_PATH").unwrap_or_else(|| "xchange.db".into()).into();
        let host = get("XCHANGE_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = parse(&get, "XCHANGE_PORT", "5000")?;
        let timeout_ms: u64 = parse(&get, "XCHANGE_STORE_TIMEOUT_MS", "5000")?;

        let addr_raw = format!("{}:{}", host, port);
        let addr = addr_raw.parse().map_err(|_| ConfigError::Invalid {
            name: "XCHANGE_HOST",
            value: host,
        })?;

        Ok(Self {
            jwt_secret,
            db_path,
            addr,
            store_timeout: Duration::from_millis(timeout_ms),
        })
    }
}

fn parse<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: &str,
) -> Result<T, ConfigError> {
    let raw = get(name).unwrap_or_else(|| default.to_string());
    raw.parse().map_err(|_| ConfigError::Invalid { name, value: raw })
}
