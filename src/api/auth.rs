//! Bearer-token authentication for the control-plane API.
//!
//! The browser-facing login/session-cookie flow is out of scope (§1); the
//! router is protected by a single shared bearer token instead, the same
//! credential an operator CLI or CI job would use. Caller identity for
//! ownership checks comes from an `X-User-Id` header, defaulting to the
//! token owner when absent — there is no multi-user directory here.
//!
//! The registry still keeps a hashed admin password (§4.7, §6 settings)
//! for whatever external login surface a router wires up later; this
//! module only owns the hash/verify primitives, not a login endpoint.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::AppState;

pub const DEFAULT_USER_ID: &str = "admin";

pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let token = header.and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(t) if constant_time_eq(t.as_bytes(), state.config.auth.admin_token.as_bytes()) => {
            next.run(req).await
        }
        _ => ApiError::unauthorized("missing or invalid bearer token").into_response(),
    }
}

/// The caller id to attribute ownership/session actions to. Reads
/// `X-User-Id` if present so a fronting auth proxy can pass through an
/// authenticated identity; falls back to the single built-in user.
pub fn caller_id(req: &Request<Body>) -> String {
    req.headers()
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_USER_ID.to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}

/// Hash an administrative password for storage in the settings row.
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a candidate password against a stored hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("correct horse battery staple").unwrap();
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
    }

    #[test]
    fn hash_is_salted() {
        let a = hash_password("same-password").unwrap();
        let b = hash_password("same-password").unwrap();
        assert_ne!(a, b, "argon2 salts should differ between calls");
    }
}
