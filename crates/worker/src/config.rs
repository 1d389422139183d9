//! Worker configuration

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub grace_sweep_interval: Duration,
    pub requeue_sweep_interval: Duration,
    pub inactivity_sweep_interval: Duration,
    pub settings_refresh_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: must be a whole number of seconds, at least 1")]
    Invalid(&'static str),
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .unwrap_or(5),
            grace_sweep_interval: seconds("GRACE_SWEEP_SECONDS", 15)?,
            requeue_sweep_interval: seconds("REQUEUE_SWEEP_SECONDS", 30)?,
            inactivity_sweep_interval: seconds("INACTIVITY_SWEEP_SECONDS", 60)?,
            settings_refresh_interval: seconds("SETTINGS_REFRESH_SECONDS", 60)?,
        })
    }
}

fn seconds(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let value = match env::var(var) {
        Ok(raw) => raw.trim().parse::<u64>().map_err(|_| ConfigError::Invalid(var))?,
        Err(_) => default,
    };
    if value == 0 {
        return Err(ConfigError::Invalid(var));
    }
    Ok(Duration::from_secs(value))
}
