//! Shared-secret credential check
//!
//! The service only knows the SHA-256 hash of the API secret. Every HTTP
//! request and every websocket handshake is authorized on its own by hashing
//! the presented secret and comparing it to the stored hash.

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;
use watcher_common::{Error, Result};

const SECRET_BYTES: usize = 32;

/// A freshly generated secret and the hash the service is configured with
#[derive(Debug, Clone, Serialize)]
pub struct Credential {
    pub secret: String,
    pub hash: String,
}

impl Credential {
    pub fn generate() -> Self {
        let mut bytes = [0u8; SECRET_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);
        let hash = hash_secret(&secret);
        Self { secret, hash }
    }
}

/// Hex SHA-256 of a secret
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct CredentialCheck {
    stored_hash: [u8; 32],
}

impl CredentialCheck {
    pub fn from_hash_hex(hash_hex: &str) -> Result<Self> {
        let bytes = hex::decode(hash_hex.trim())
            .map_err(|e| Error::InvalidInput(format!("secret hash is not hex: {}", e)))?;
        let stored_hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidInput("secret hash must be 32 bytes".to_string()))?;
        Ok(Self { stored_hash })
    }

    pub fn verify(&self, candidate: &str) -> bool {
        let digest = Sha256::digest(candidate.as_bytes());
        digest.as_slice().ct_eq(&self.stored_hash).into()
    }

    /// Check the `Authorization` header, accepting `Bearer <secret>` or the bare secret
    pub fn verify_headers(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|value| self.verify(strip_bearer(value)))
            .unwrap_or(false)
    }
}

fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim()
}

/// Middleware rejecting unauthorized requests with 403
pub async fn require_credential(
    State(check): State<CredentialCheck>,
    request: Request,
    next: Next,
) -> Response {
    if check.verify_headers(request.headers()) {
        return next.run(request).await;
    }

    warn!(
        "Rejected unauthorized request: {} {}",
        request.method(),
        request.uri().path()
    );
    (
        StatusCode::FORBIDDEN,
        Json(serde_json::json!({ "error": Error::Unauthorized.to_string() })),
    )
        .into_response()
}
