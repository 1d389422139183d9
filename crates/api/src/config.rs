//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    /// Browser origin allowed by CORS; `None` allows any origin
    pub cors_allowed_origin: Option<String>,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Authentication
    pub jwt_secret: String,
    pub staff_token_expiry_hours: i64,

    // Chat engine
    pub settings_refresh_seconds: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_allowed_origin: env::var("CORS_ALLOWED_ORIGIN")
                .ok()
                .filter(|origin| !origin.trim().is_empty()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .unwrap_or(20),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            staff_token_expiry_hours: env::var("STAFF_TOKEN_EXPIRY_HOURS")
                .unwrap_or_else(|_| "12".to_string())
                .parse()
                .unwrap_or(12),

            // Chat engine
            settings_refresh_seconds: {
                let seconds: u64 = env::var("SETTINGS_REFRESH_SECONDS")
                    .unwrap_or_else(|_| "60".to_string())
                    .parse()
                    .map_err(|_| ConfigError::Invalid("SETTINGS_REFRESH_SECONDS must be a number"))?;
                if seconds == 0 {
                    return Err(ConfigError::Invalid(
                        "SETTINGS_REFRESH_SECONDS must be at least 1",
                    ));
                }
                seconds
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
