#![forbid(unsafe_code)]

use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use parlor_domain::UserId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::util::time::unix_secs_now;

/// Default token lifetime.
pub const TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Claims carried inside a `v1.<payload>.<sig>` bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: UserId,
	pub name: String,
	pub exp: u64,
}

/// Token rejection reasons. `Malformed` means the token could not be
/// decoded at all; `Invalid` means it decoded but failed verification.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
	#[error("malformed token")]
	Malformed,
	#[error("invalid token")]
	Invalid,
}

/// Issue a signed bearer token for a user.
pub fn issue_token(user_id: UserId, username: &str, secret: &str, ttl: Duration) -> String {
	let claims = AuthClaims {
		sub: user_id,
		name: username.to_string(),
		exp: unix_secs_now().saturating_add(ttl.as_secs()),
	};

	// AuthClaims serialization cannot fail; fall back to an empty payload
	// which verifies against nothing.
	let payload = serde_json::to_vec(&claims).unwrap_or_default();
	let payload_b64 = URL_SAFE_NO_PAD.encode(&payload);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes());
	let sig_b64 = URL_SAFE_NO_PAD.encode(&sig);

	format!("v1.{payload_b64}.{sig_b64}")
}

/// Verify a bearer token and return its claims.
pub fn verify_token(token: &str, secret: &str) -> Result<AuthClaims, AuthError> {
	let parts = token.split('.').collect::<Vec<_>>();
	if parts.len() != 3 || parts[0] != "v1" {
		return Err(AuthError::Malformed);
	}

	let payload_b64 = parts[1];
	let sig_b64 = parts[2];

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).map_err(|_| AuthError::Malformed)?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| AuthError::Malformed)?;
	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes());

	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(AuthError::Invalid);
	}

	let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;
	if claims.exp <= unix_secs_now() {
		return Err(AuthError::Invalid);
	}

	Ok(claims)
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> Vec<u8> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac key");
	mac.update(payload_b64);
	mac.finalize().into_bytes().to_vec()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}

	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}

	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	const SECRET: &str = "test-secret";

	#[test]
	fn issue_then_verify_roundtrip() {
		let id = UserId::new_v4();
		let token = issue_token(id, "alice", SECRET, TOKEN_TTL);
		let claims = verify_token(&token, SECRET).expect("verify");

		assert_eq!(claims.sub, id);
		assert_eq!(claims.name, "alice");
		assert!(claims.exp > unix_secs_now());
	}

	#[test]
	fn garbage_is_malformed() {
		assert_eq!(verify_token("", SECRET).unwrap_err(), AuthError::Malformed);
		assert_eq!(verify_token("not-a-token", SECRET).unwrap_err(), AuthError::Malformed);
		assert_eq!(verify_token("v2.a.b", SECRET).unwrap_err(), AuthError::Malformed);
		assert_eq!(verify_token("v1.%%%.%%%", SECRET).unwrap_err(), AuthError::Malformed);
	}

	#[test]
	fn wrong_secret_is_invalid() {
		let token = issue_token(UserId::new_v4(), "alice", SECRET, TOKEN_TTL);
		assert_eq!(verify_token(&token, "other-secret").unwrap_err(), AuthError::Invalid);
	}

	#[test]
	fn tampered_payload_is_invalid() {
		let token = issue_token(UserId::new_v4(), "alice", SECRET, TOKEN_TTL);
		let mut parts = token.split('.').map(str::to_string).collect::<Vec<_>>();
		parts[1] = URL_SAFE_NO_PAD.encode(b"{\"sub\":\"x\",\"name\":\"eve\",\"exp\":99999999999}");
		let forged = parts.join(".");

		assert_eq!(verify_token(&forged, SECRET).unwrap_err(), AuthError::Invalid);
	}

	#[test]
	fn expired_token_is_invalid() {
		let token = issue_token(UserId::new_v4(), "alice", SECRET, Duration::from_secs(0));
		assert_eq!(verify_token(&token, SECRET).unwrap_err(), AuthError::Invalid);
	}
}
