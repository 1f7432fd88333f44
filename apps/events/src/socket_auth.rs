use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug)]
pub struct SocketAuthConfig {
    pub signing_key: String,
    pub issuer: String,
    pub audience: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketTokenClaims {
    pub iss: String,
    pub aud: String,
    /// Recipient identity; lowercased before registry use.
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: usize,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SocketAuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid socket token")]
    InvalidToken,
    #[error("socket token expired")]
    TokenExpired,
    #[error("socket token missing recipient claim")]
    MissingRecipient,
}

impl SocketAuthError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::MissingRecipient => "missing_recipient",
        }
    }
}

/// Verifies the bearer token presented during the socket handshake and
/// extracts the recipient identity it was minted for.
#[derive(Clone)]
pub struct SocketAuthorizer {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SocketAuthorizer {
    #[must_use]
    pub fn from_config(config: &SocketAuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_audience(&[config.audience.as_str()]);
        Self {
            decoding_key: DecodingKey::from_secret(config.signing_key.as_bytes()),
            validation,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<String, SocketAuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(SocketAuthError::MissingToken);
        }
        let claims = decode::<SocketTokenClaims>(token, &self.decoding_key, &self.validation)
            .map_err(map_decode_error)?
            .claims;
        let recipient_id = claims.sub.trim().to_ascii_lowercase();
        if recipient_id.is_empty() {
            return Err(SocketAuthError::MissingRecipient);
        }
        Ok(recipient_id)
    }
}

fn map_decode_error(error: jsonwebtoken::errors::Error) -> SocketAuthError {
    match error.kind() {
        ErrorKind::ExpiredSignature => SocketAuthError::TokenExpired,
        _ => SocketAuthError::InvalidToken,
    }
}
