//! Staff JWT generation and validation
//!
//! Staff tokens are minted by the surrounding deployment (or the
//! `issue-staff-token` binary locally); this server only validates them.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

/// Handle guest chats
pub const PERMISSION_CHAT_HANDLE: &str = "chat.handle";
/// See the escalated-session pool
pub const PERMISSION_CHAT_SUPERVISE: &str = "chat.supervise";
/// Change recovery settings, reset sessions, deactivate staff
pub const PERMISSION_CHAT_ADMIN: &str = "chat.admin";

/// JWT claims carried by staff tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaffClaims {
    /// Subject (staff username)
    pub sub: String,
    /// Display name shown to guests
    pub name: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// Authenticated staff member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaffIdentity {
    pub username: String,
    pub display_name: String,
    pub permissions: Vec<String>,
}

impl StaffIdentity {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

impl From<StaffClaims> for StaffIdentity {
    fn from(claims: StaffClaims) -> Self {
        let display_name = if claims.name.trim().is_empty() {
            claims.sub.clone()
        } else {
            claims.name
        };
        Self {
            username: claims.sub,
            display_name,
            permissions: claims.permissions,
        }
    }
}

/// JWT manager for staff tokens
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_expiry_hours,
        }
    }

    /// Mint a staff token
    pub fn generate_staff_token(
        &self,
        username: &str,
        display_name: &str,
        permissions: &[&str],
    ) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.token_expiry_hours);

        let claims = StaffClaims {
            sub: username.to_string(),
            name: display_name.to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
        };

        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Validate and decode a staff token
    pub fn validate_staff_token(&self, token: &str) -> Result<StaffIdentity, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        let claims = decode::<StaffClaims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })?;

        if claims.sub.trim().is_empty() {
            return Err(JwtError::Invalid);
        }
        Ok(claims.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}
