//! Opaque HMAC-signed access tokens.
//!
//! `payload.signature` where payload is `user.expiry.nonce` and the
//! signature is HMAC-SHA256 over the payload, hex-encoded and compared
//! in constant time. The full JWT wire format lives with the identity
//! collaborator; services only need [`TokenValidator`].

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::chat::UserId;
use crate::errors::{Result, TetherError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy)]
pub struct TokenClaims {
    pub user_id: UserId,
    pub expires_at: DateTime<Utc>,
}

/// Collaborator seam: turns an opaque token into an identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<TokenClaims>;
}

pub struct HmacTokenService {
    secret: String,
    access_ttl: Duration,
}

impl HmacTokenService {
    pub fn new(secret: impl Into<String>, access_ttl: Duration) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(TetherError::validation("jwt_secret", "must not be empty"));
        }
        Ok(Self { secret, access_ttl })
    }

    pub fn issue(&self, user: UserId) -> Result<(String, DateTime<Utc>)> {
        let expires_at = Utc::now() + self.access_ttl;
        let payload = format!(
            "{}.{}.{}",
            user.simple(),
            expires_at.timestamp(),
            Uuid::new_v4().simple()
        );
        let token = format!("{}.{}", payload, self.sign(&payload)?);
        Ok((token, expires_at))
    }

    fn sign(&self, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .map_err(|_| TetherError::Fatal("HMAC rejected signing key".into()))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl TokenValidator for HmacTokenService {
    async fn validate(&self, token: &str) -> Result<TokenClaims> {
        let (payload, signature) = token
            .rsplit_once('.')
            .ok_or_else(|| TetherError::Authentication("malformed token".into()))?;

        let expected = self.sign(payload)?;
        if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
            return Err(TetherError::Authentication("signature mismatch".into()));
        }

        let mut parts = payload.split('.');
        let (user, expiry) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(expiry), Some(_nonce), None) => (user, expiry),
            _ => return Err(TetherError::Authentication("malformed token".into())),
        };

        let expires_at = expiry
            .parse::<i64>()
            .ok()
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .ok_or_else(|| TetherError::Authentication("malformed token".into()))?;
        if expires_at <= Utc::now() {
            return Err(TetherError::Authentication("token expired".into()));
        }

        let user_id = Uuid::parse_str(user)
            .map_err(|_| TetherError::Authentication("malformed token".into()))?;
        Ok(TokenClaims {
            user_id,
            expires_at,
        })
    }
}
