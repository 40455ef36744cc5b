#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use roomcast_domain::UserId;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::util::time::unix_secs_now;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthClaims {
	pub sub: String,
	pub exp: u64,
}

impl AuthClaims {
	pub fn user_id(&self) -> anyhow::Result<UserId> {
		UserId::new(self.sub.clone()).map_err(|e| anyhow!("invalid token subject: {e}"))
	}
}

/// Verify a `v1.<payload>.<signature>` bearer token and return its claims.
pub fn verify_hmac_token(token: &str, secret: &str) -> anyhow::Result<AuthClaims> {
	let mut parts = token.trim().split('.');
	let (Some("v1"), Some(payload_b64), Some(sig_b64), None) = (parts.next(), parts.next(), parts.next(), parts.next())
	else {
		return Err(anyhow!("invalid token format"));
	};

	let expected_sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	let provided_sig = URL_SAFE_NO_PAD.decode(sig_b64).context("decode token signature")?;
	if !constant_time_eq(&expected_sig, &provided_sig) {
		return Err(anyhow!("invalid token signature"));
	}

	let payload = URL_SAFE_NO_PAD.decode(payload_b64).context("decode token payload")?;
	let claims: AuthClaims = serde_json::from_slice(&payload).context("parse token claims")?;
	if claims.exp <= unix_secs_now() {
		return Err(anyhow!("token expired"));
	}

	Ok(claims)
}

/// Mint a token for `sub` valid for `ttl_secs`.
pub fn issue_hmac_token(sub: &str, ttl_secs: u64, secret: &str) -> anyhow::Result<String> {
	let claims = AuthClaims {
		sub: sub.to_string(),
		exp: unix_secs_now().saturating_add(ttl_secs),
	};
	let payload_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).context("encode token claims")?);
	let sig = sign(payload_b64.as_bytes(), secret.as_bytes())?;
	Ok(format!("v1.{payload_b64}.{}", URL_SAFE_NO_PAD.encode(sig)))
}

fn sign(payload_b64: &[u8], secret: &[u8]) -> anyhow::Result<Vec<u8>> {
	let mut mac = Hmac::<Sha256>::new_from_slice(secret).map_err(|e| anyhow!("hmac key: {e}"))?;
	mac.update(payload_b64);
	Ok(mac.finalize().into_bytes().to_vec())
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

	#[test]
	fn issued_token_verifies() {
		let token = issue_hmac_token("alice", 60, "secret").unwrap();
		let claims = verify_hmac_token(&token, "secret").unwrap();
		assert_eq!(claims.sub, "alice");
		assert_eq!(claims.user_id().unwrap().as_str(), "alice");
	}

	#[test]
	fn wrong_secret_or_tampering_is_rejected() {
		let token = issue_hmac_token("alice", 60, "secret").unwrap();
		assert!(verify_hmac_token(&token, "other").is_err());

		let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"sub":"mallory","exp":99999999999}"#);
		let sig = token.rsplit('.').next().unwrap();
		assert!(verify_hmac_token(&format!("v1.{forged_payload}.{sig}"), "secret").is_err());
	}

	#[test]
	fn expired_and_malformed_tokens_are_rejected() {
		let token = issue_hmac_token("alice", 0, "secret").unwrap();
		let err = verify_hmac_token(&token, "secret").unwrap_err();
		assert!(err.to_string().contains("expired"));

		assert!(verify_hmac_token("", "secret").is_err());
		assert!(verify_hmac_token("v2.a.b", "secret").is_err());
		assert!(verify_hmac_token("v1.a.b.c", "secret").is_err());
	}
}
