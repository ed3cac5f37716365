//! Bearer-token identity for API callers.
//!
//! Tokens are issued by `rshare token` and carry the caller's user id,
//! role, and expiry, signed with HMAC-SHA256 over `[auth].secret`:
//!
//! ```text
//! base64url("<user_id>:<role>:<expires_unix>") "." hex(hmac_sha256(secret, payload))
//! ```
//!
//! Signature checks use [`Mac::verify_slice`], which compares in constant time.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            _ => Err(AuthError::Malformed),
        }
    }
}

/// The authenticated identity behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caller {
    pub user_id: i64,
    pub role: Role,
}

impl Caller {
    pub fn user(user_id: i64) -> Self {
        Self {
            user_id,
            role: Role::User,
        }
    }

    pub fn admin(user_id: i64) -> Self {
        Self {
            user_id,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    Missing,
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// Resolves a bearer token to the identity it was issued for.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Caller, AuthError>;
}

/// Issues and verifies bearer tokens.
#[derive(Clone)]
pub struct TokenSigner {
    mac: HmacSha256,
    ttl: chrono::Duration,
}

impl TokenSigner {
    pub fn new(secret: &str, ttl: chrono::Duration) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid auth secret: {}", e))?;
        Ok(Self { mac, ttl })
    }

    /// A token for `caller` valid for the configured lifetime.
    pub fn issue(&self, caller: &Caller) -> String {
        self.issue_until(caller, Utc::now() + self.ttl)
    }

    pub fn issue_until(&self, caller: &Caller, expires_at: DateTime<Utc>) -> String {
        let payload = format!(
            "{}:{}:{}",
            caller.user_id,
            caller.role,
            expires_at.timestamp()
        );
        let encoded = URL_SAFE_NO_PAD.encode(payload.as_bytes());
        let signature = self.sign(encoded.as_bytes());
        format!("{}.{}", encoded, signature)
    }

    pub fn verify(&self, token: &str) -> Result<Caller, AuthError> {
        let (encoded, signature) = token.split_once('.').ok_or(AuthError::Malformed)?;
        let signature = hex::decode(signature).map_err(|_| AuthError::Malformed)?;

        let mut mac = self.mac.clone();
        mac.update(encoded.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| AuthError::Malformed)?;
        let payload = String::from_utf8(payload).map_err(|_| AuthError::Malformed)?;

        let mut parts = payload.splitn(3, ':');
        let (Some(user_id), Some(role), Some(expires)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(AuthError::Malformed);
        };
        let user_id: i64 = user_id.parse().map_err(|_| AuthError::Malformed)?;
        let role: Role = role.parse()?;
        let expires: i64 = expires.parse().map_err(|_| AuthError::Malformed)?;

        if expires <= Utc::now().timestamp() {
            return Err(AuthError::Expired);
        }
        Ok(Caller { user_id, role })
    }

    fn sign(&self, data: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl Authenticator for TokenSigner {
    fn authenticate(&self, token: &str) -> Result<Caller, AuthError> {
        self.verify(token)
    }
}

/// Extracts the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    header
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or(AuthError::Missing)
}
