use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::warn;

use parley_gateway::GatewayConfig;

const DEV_SECRET: &str = "dev-secret-change-me";

/// Server settings, read from the environment (and `.env` if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub gateway: GatewayConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = std::env::var("PARLEY_JWT_SECRET").unwrap_or_else(|_| DEV_SECRET.into());
        if jwt_secret == DEV_SECRET {
            warn!("PARLEY_JWT_SECRET is unset, using the development secret");
        }

        let defaults = GatewayConfig::default();

        Ok(Self {
            host: std::env::var("PARLEY_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: parse_var("PARLEY_PORT", 3000)?,
            db_path: std::env::var("PARLEY_DB_PATH")
                .unwrap_or_else(|_| "parley.db".into())
                .into(),
            jwt_secret,
            gateway: GatewayConfig {
                auth_timeout: Duration::from_secs(parse_var(
                    "PARLEY_AUTH_TIMEOUT_SECS",
                    defaults.auth_timeout.as_secs(),
                )?),
                heartbeat_interval: nonzero_secs(
                    "PARLEY_HEARTBEAT_SECS",
                    parse_var("PARLEY_HEARTBEAT_SECS", defaults.heartbeat_interval.as_secs())?,
                )?,
                outbound_capacity: parse_var("PARLEY_OUTBOUND_QUEUE", defaults.outbound_capacity)?,
            },
        })
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{} must be a number, got '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

fn nonzero_secs(name: &str, secs: u64) -> Result<Duration> {
    if secs == 0 {
        bail!("{} must be at least 1 second", name);
    }
    Ok(Duration::from_secs(secs))
}
