//! Stored-credential verification shared by the API-key store and the basic
//! authenticator. Dispatch is on the stored prefix; an unknown prefix is a
//! verification failure, never a plaintext compare.

use argon2::password_hash::PasswordHash;
use argon2::{Argon2, PasswordVerifier};
use sha2::{Digest, Sha256};
use tracing::debug;

const ARGON2ID_PREFIX: &str = "$argon2id$";
const BCRYPT_PREFIXES: &[&str] = &["$2a$", "$2b$", "$2y$"];
const SHA256_PREFIX: &str = "$sha256$";

/// Constant-time equality over byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

/// Verifies `secret` against a stored, prefix-identified hash.
///
/// Recognized formats: Argon2id PHC strings, the bcrypt family, and
/// `$sha256$<salt>$<hex digest>` where the digest is SHA-256 over
/// `salt || secret`.
pub fn verify_stored_hash(stored: &str, secret: &str) -> bool {
	if stored.starts_with(ARGON2ID_PREFIX) {
		return match PasswordHash::new(stored) {
			Ok(parsed) => Argon2::default()
				.verify_password(secret.as_bytes(), &parsed)
				.is_ok(),
			Err(err) => {
				debug!(%err, "malformed argon2id hash");
				false
			},
		};
	}
	if BCRYPT_PREFIXES.iter().any(|p| stored.starts_with(p)) {
		return bcrypt::verify(secret, stored).unwrap_or(false);
	}
	if let Some(rest) = stored.strip_prefix(SHA256_PREFIX) {
		let Some((salt, digest_hex)) = rest.split_once('$') else {
			return false;
		};
		let Ok(expected) = hex::decode(digest_hex) else {
			return false;
		};
		let mut hasher = Sha256::new();
		hasher.update(salt.as_bytes());
		hasher.update(secret.as_bytes());
		let actual = hasher.finalize();
		return constant_time_eq(actual.as_slice(), &expected);
	}
	debug!("unrecognized hash prefix");
	false
}

/// Builds the salted-sha256 storage format. Used by tests and by control
/// planes that provision keys in this encoding.
pub fn sha256_salted(salt: &str, secret: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(salt.as_bytes());
	hasher.update(secret.as_bytes());
	format!("{SHA256_PREFIX}{salt}${}", hex::encode(hasher.finalize()))
}
