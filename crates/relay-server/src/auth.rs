//! Authentication seam.
//!
//! The upgrade handler and `POST /messages` resolve a bearer token to an
//! [`Identity`] before anything else happens. [`JwtAuthenticator`] validates
//! HS256 tokens carrying `{user_id, username, exp, iss}`.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use relay_core::RelayError;
use relay_core::ids::UserId;
use relay_settings::AuthSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Who is on the other end of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user.
    pub user_id: UserId,
    /// Name shown to peers.
    pub display_name: String,
}

/// Authentication failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("missing token")]
    Missing,
    /// The token did not validate.
    #[error("invalid token: {0}")]
    Invalid(String),
    /// A token could not be issued.
    #[error("token issuance failed: {0}")]
    Issue(String),
}

impl From<AuthError> for RelayError {
    fn from(e: AuthError) -> Self {
        RelayError::Unauthorized(e.to_string())
    }
}

/// Resolves bearer tokens to identities.
pub trait Authenticator: Send + Sync {
    /// Validate `token`.
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    user_id: u64,
    username: String,
    exp: i64,
    iss: String,
}

/// HS256 JWT authenticator.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl: Duration,
}

impl JwtAuthenticator {
    /// Create an authenticator for tokens signed with `secret` by `issuer`.
    pub fn new(secret: &str, issuer: &str, ttl: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            issuer: issuer.to_string(),
            ttl,
        }
    }

    /// Build from loaded settings.
    pub fn from_settings(settings: &AuthSettings) -> Self {
        Self::new(
            &settings.jwt_secret,
            &settings.issuer,
            Duration::from_secs(settings.token_ttl_secs),
        )
    }

    /// Sign a token for `identity` valid for the configured lifetime.
    pub fn issue(&self, identity: &Identity) -> Result<String, AuthError> {
        let ttl = i64::try_from(self.ttl.as_secs()).map_err(|e| AuthError::Issue(e.to_string()))?;
        self.sign(identity, Utc::now().timestamp() + ttl)
    }

    fn sign(&self, identity: &Identity, exp: i64) -> Result<String, AuthError> {
        let claims = Claims {
            user_id: identity.user_id.get(),
            username: identity.display_name.clone(),
            exp,
            iss: self.issuer.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Issue(e.to_string()))
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::Invalid(e.to_string()))?;
        if data.claims.user_id == 0 {
            return Err(AuthError::Invalid("user_id must be non-zero".into()));
        }
        Ok(Identity {
            user_id: UserId(data.claims.user_id),
            display_name: data.claims.username,
        })
    }
}
