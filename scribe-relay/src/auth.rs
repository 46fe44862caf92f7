//! Session gate: authenticates a connection once, at the WebSocket upgrade.
//!
//! The bearer token is an HS256 JWT carrying `{ userId, exp }`. After the
//! signature and expiry check the user id is resolved through an
//! [`IdentityProvider`]; a user that no longer exists is rejected like any
//! other bad token. Callers only ever see [`RelayError::Authentication`].

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::handshake::server::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use uuid::Uuid;

use crate::error::RelayError;

/// JWT claims accepted by the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    pub user_id: Uuid,
    /// Expiry, seconds since the Unix epoch.
    pub exp: u64,
}

/// Profile data the identity provider knows about a user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

/// Authenticated identity attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub profile: UserProfile,
}

/// Resolves a token's user id to a live user.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// `Ok(None)` when the user does not exist (any more).
    async fn find_user(&self, user_id: Uuid) -> Result<Option<UserProfile>, RelayError>;
}

pub struct SessionGate {
    key: DecodingKey,
    validation: Validation,
    identities: Arc<dyn IdentityProvider>,
}

impl SessionGate {
    pub fn new(secret: &str, identities: Arc<dyn IdentityProvider>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_required_spec_claims(&["exp"]);
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            identities,
        }
    }

    /// Signature and expiry check only.
    pub fn verify_token(&self, token: &str) -> Result<Claims, RelayError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| {
                log::debug!("Token rejected: {e}");
                RelayError::Authentication
            })
    }

    /// Full gate: token present, valid, and naming an existing user.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, RelayError> {
        let token = token.ok_or_else(|| {
            log::debug!("Connection without bearer token");
            RelayError::Authentication
        })?;
        let claims = self.verify_token(token)?;

        match self.identities.find_user(claims.user_id).await {
            Ok(Some(profile)) => Ok(Identity {
                user_id: claims.user_id,
                profile,
            }),
            Ok(None) => {
                log::debug!("Token for unknown user {}", claims.user_id);
                Err(RelayError::Authentication)
            }
            Err(e) => {
                log::warn!("Identity lookup for {} failed: {e}", claims.user_id);
                Err(RelayError::Authentication)
            }
        }
    }
}

/// Sign a token for `user_id` valid for `ttl`. Used by tools and tests.
pub fn issue_token(secret: &str, user_id: Uuid, ttl: Duration) -> Result<String, RelayError> {
    let exp = SystemTime::now()
        .checked_add(ttl)
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .ok_or_else(|| RelayError::Internal("token expiry out of range".into()))?;
    sign_claims(secret, &Claims { user_id, exp })
}

pub fn sign_claims(secret: &str, claims: &Claims) -> Result<String, RelayError> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| RelayError::Internal(e.to_string()))
}

/// Bearer token from the upgrade request.
///
/// `Authorization: Bearer <jwt>` wins; browsers cannot set headers on a
/// WebSocket, so `?token=<jwt>` is accepted as well.
pub fn bearer_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get(AUTHORIZATION) {
        let value = value.to_str().ok()?;
        let token = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        return (!token.is_empty()).then(|| token.to_string());
    }

    request
        .uri()
        .query()?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}
