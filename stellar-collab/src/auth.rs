//! Handshake authentication.
//!
//! When a secret is configured the server requires an HS256 JWT on the
//! WebSocket upgrade request, taken from `Authorization: Bearer <token>`
//! or, failing that, the `token` query parameter. `exp` is honoured when
//! present but not required. The identity is `userId`, else `sub`.

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::Request;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no token provided")]
    MissingToken,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token carries no user identity")]
    MissingIdentity,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

impl Claims {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            sub: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn expiring_at(mut self, exp: i64) -> Self {
        self.exp = Some(exp);
        self
    }

    /// Authenticated user id.
    pub fn subject(&self) -> Option<&str> {
        self.user_id
            .as_deref()
            .or(self.sub.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// HS256 verifier bound to one shared secret.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify a token and return the user id it names.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        data.claims
            .subject()
            .map(str::to_string)
            .ok_or(AuthError::MissingIdentity)
    }

    /// Sign claims with the same secret.
    pub fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Pull the token out of a WebSocket upgrade request.
pub fn extract_token(request: &Request) -> Option<String> {
    let from_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim().to_string())
        .filter(|t| !t.is_empty());

    from_header.or_else(|| request.uri().query().and_then(token_from_query))
}

/// Identity for an upgrade request.
///
/// With no verifier every request passes anonymously (`Ok(None)`).
pub fn authenticate(verifier: Option<&TokenVerifier>, request: &Request) -> Result<Option<String>, AuthError> {
    let Some(verifier) = verifier else {
        return Ok(None);
    };
    let token = extract_token(request).ok_or(AuthError::MissingToken)?;
    verifier.verify(&token).map(Some)
}

fn token_from_query(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "token")
        .map(|(_, value)| value.to_string())
        .filter(|t| !t.is_empty())
}
