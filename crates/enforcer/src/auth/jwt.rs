use std::collections::HashMap;
use std::str::FromStr;

use headers::authorization::Bearer;
use headers::{Authorization, HeaderMapExt};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header, errors::ErrorKind};
use tracing::{debug, info};

use super::{AuthContext, AuthError, Authenticator, BuildError, JwtConfig};

type Claims = serde_json::Map<String, serde_json::Value>;

pub struct JwtAuthenticator {
	config: JwtConfig,
	keys: HashMap<String, (DecodingKey, Algorithm)>,
	/// Fallback for JWKS entries published without a `kid`.
	default_key: Option<(DecodingKey, Algorithm)>,
}

impl std::fmt::Debug for JwtAuthenticator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JwtAuthenticator")
			.field("config", &self.config)
			.field("key_ids", &self.keys.keys().collect::<Vec<_>>())
			.field("has_default_key", &self.default_key.is_some())
			.finish()
	}
}

impl JwtAuthenticator {
	/// Fetches the JWKS eagerly; bearer auth must fail fast at startup
	/// rather than 500 on the first request.
	pub async fn new(config: JwtConfig) -> Result<Self, BuildError> {
		if config.jwks_url.is_empty() {
			return Err(BuildError::MissingJwksUrl);
		}
		let url = config.jwks_url.clone();
		let jwks: JwkSet = async {
			let response = reqwest::get(&url).await?.error_for_status()?;
			Ok::<_, anyhow::Error>(response.json().await?)
		}
		.await
		.map_err(|source| BuildError::JwksFetch { url: url.clone(), source })?;
		info!(%url, keys = jwks.keys.len(), "loaded JWKS");
		Self::from_jwks(config, jwks)
	}

	/// Builds from an already-fetched key set.
	pub fn from_jwks(config: JwtConfig, jwks: JwkSet) -> Result<Self, BuildError> {
		let mut keys = HashMap::new();
		let mut default_key = None;
		for jwk in &jwks.keys {
			let key = match DecodingKey::from_jwk(jwk) {
				Ok(key) => key,
				Err(err) => {
					debug!(%err, "skipping unusable JWK");
					continue;
				},
			};
			let algorithm = jwk
				.common
				.key_algorithm
				.and_then(|ka| Algorithm::from_str(&format!("{ka:?}")).ok())
				.unwrap_or(Algorithm::RS256);
			match &jwk.common.key_id {
				Some(kid) => {
					keys.insert(kid.clone(), (key, algorithm));
				},
				None => default_key = Some((key, algorithm)),
			}
		}
		if keys.is_empty() && default_key.is_none() {
			return Err(BuildError::EmptyJwks);
		}
		Ok(Self {
			config,
			keys,
			default_key,
		})
	}

	fn verify(&self, token: &str) -> Result<Claims, AuthError> {
		let header = decode_header(token).map_err(|err| {
			debug!(%err, "unparseable bearer token");
			AuthError::Failed
		})?;
		let entry = header
			.kid
			.as_ref()
			.and_then(|kid| self.keys.get(kid))
			.or(self.default_key.as_ref())
			.ok_or_else(|| {
				debug!(kid = ?header.kid, "no JWKS key for token");
				AuthError::Failed
			})?;
		let (key, algorithm) = entry;

		let mut validation = Validation::new(*algorithm);
		if !self.config.issuer_url.is_empty() {
			validation.set_issuer(&[self.config.issuer_url.as_str()]);
		}
		if self.config.audience.is_empty() {
			validation.validate_aud = false;
		} else {
			validation.set_audience(&[self.config.audience.as_str()]);
		}

		match decode::<Claims>(token, key, &validation) {
			Ok(data) => Ok(data.claims),
			Err(err) if matches!(err.kind(), ErrorKind::ExpiredSignature) => Err(AuthError::Expired),
			Err(err) => {
				debug!(%err, "bearer token verification failed");
				Err(AuthError::Failed)
			},
		}
	}
}

/// Reads the scope claim as either a space-separated string or an array of
/// strings.
pub(crate) fn scope_values(claims: &Claims, claim: &str) -> Vec<String> {
	match claims.get(claim) {
		Some(serde_json::Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
		Some(serde_json::Value::Array(values)) => values
			.iter()
			.filter_map(|v| v.as_str().map(str::to_string))
			.collect(),
		_ => Vec::new(),
	}
}

/// Maps claim values to local roles. Specific matches take precedence; a
/// `"*"` entry names the default local role for any unmatched claim value.
/// With no mapping configured, claim values are the roles.
pub(crate) fn map_roles(mapping: &HashMap<String, Vec<String>>, claim_values: &[String]) -> Vec<String> {
	if mapping.is_empty() {
		return claim_values.to_vec();
	}
	let mut roles: Vec<String> = Vec::new();
	let mut push = |roles: &mut Vec<String>, role: &String| {
		if !roles.contains(role) {
			roles.push(role.clone());
		}
	};
	for value in claim_values {
		let mut matched = false;
		for (local, accepted) in mapping {
			if accepted.iter().any(|a| a == value) {
				push(&mut roles, local);
				matched = true;
			}
		}
		if !matched {
			for (local, accepted) in mapping {
				if accepted.iter().any(|a| a == "*") {
					push(&mut roles, local);
				}
			}
		}
	}
	roles
}

impl Authenticator for JwtAuthenticator {
	fn name(&self) -> &'static str {
		"bearer"
	}

	fn can_handle(&self, headers: &http::HeaderMap) -> bool {
		headers
			.get(http::header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.starts_with("Bearer "))
	}

	fn authenticate(&self, headers: &http::HeaderMap) -> Result<AuthContext, AuthError> {
		let Some(Authorization(bearer)) = headers.typed_get::<Authorization<Bearer>>() else {
			return Err(AuthError::Failed);
		};

		let claims = self.verify(bearer.token())?;
		let user_id = claims
			.get("sub")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();

		// A token without a configured role claim authenticates but cannot be
		// authorized; the authorization layer skips it.
		if self.config.scope_claim.is_empty() {
			return Ok(AuthContext {
				authenticated: true,
				user_id,
				roles: Vec::new(),
				claims: Some(claims),
				auth_skipped: true,
			});
		}

		let values = scope_values(&claims, &self.config.scope_claim);
		let roles = map_roles(&self.config.permission_mapping, &values);
		Ok(AuthContext {
			authenticated: true,
			user_id,
			roles,
			claims: Some(claims),
			auth_skipped: false,
		})
	}
}
