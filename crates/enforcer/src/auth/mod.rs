use std::collections::HashMap;

use axum::Json;
use axum::response::{IntoResponse, Response};
use http::StatusCode;
use secrecy::SecretString;
use serde::Deserialize;

pub mod basic;
pub mod jwt;
pub mod middleware;

pub use basic::BasicAuthenticator;
pub use jwt::JwtAuthenticator;
pub use middleware::{AuthState, authn_middleware, authz_middleware, protect};


/// Construction-time failures. The process must not start serving when bearer
/// auth is enabled but unusable; a cold-path 500 on first request is worse
/// than failing fast.
#[derive(thiserror::Error, Debug)]
pub enum BuildError {
	#[error("bearer auth enabled without a JWKS URL")]
	MissingJwksUrl,
	#[error("failed to load JWKS from {url}: {source}")]
	JwksFetch {
		url: String,
		#[source]
		source: anyhow::Error,
	},
	#[error("JWKS contains no usable keys")]
	EmptyJwks,
}

/// Request-time failures. Public messages are stable and opaque; underlying
/// causes are logged, never returned.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum AuthError {
	#[error("no valid authentication credentials provided")]
	NoCredentials,
	#[error("authentication failed")]
	Failed,
	/// Expired bearer tokens are a distinct kind; the proxy-facing message
	/// stays a generic 401.
	#[error("authentication failed")]
	Expired,
	#[error("forbidden")]
	Forbidden,
}

impl AuthError {
	fn status(&self) -> StatusCode {
		match self {
			AuthError::Forbidden => StatusCode::FORBIDDEN,
			_ => StatusCode::UNAUTHORIZED,
		}
	}
}

impl IntoResponse for AuthError {
	fn into_response(self) -> Response {
		let body = Json(serde_json::json!({ "error": self.to_string() }));
		(self.status(), body).into_response()
	}
}

/// Identity attached to a request for the duration of control-plane
/// handling. `auth_skipped` is the one switch the authorization layer keys
/// off: skip paths, no-auth mode, and bearer tokens without a configured
/// scope claim all set it.
#[derive(Clone, Debug, Default)]
pub struct AuthContext {
	pub authenticated: bool,
	pub user_id: String,
	pub roles: Vec<String>,
	pub claims: Option<serde_json::Map<String, serde_json::Value>>,
	pub auth_skipped: bool,
}

impl AuthContext {
	/// Path matched the skip list; nothing was verified.
	pub fn skipped() -> Self {
		Self {
			auth_skipped: true,
			..Default::default()
		}
	}

	/// No authenticators are registered at all.
	pub fn no_auth() -> Self {
		Self {
			authenticated: true,
			auth_skipped: true,
			..Default::default()
		}
	}
}

/// Selects Basic or Bearer handling by inspecting the Authorization header;
/// the first registered authenticator whose `can_handle` answers true wins.
pub trait Authenticator: Send + Sync {
	fn name(&self) -> &'static str;
	fn can_handle(&self, headers: &http::HeaderMap) -> bool;
	fn authenticate(&self, headers: &http::HeaderMap) -> Result<AuthContext, AuthError>;
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthConfig {
	#[serde(default)]
	pub basic_auth: BasicAuthConfig,
	#[serde(default)]
	pub jwt_config: JwtConfig,
	/// Path prefixes bypassing auth entirely.
	#[serde(default)]
	pub skip_paths: Vec<String>,
	/// `"METHOD route-template"` to the roles allowed on it. Empty map means
	/// authorization is not enforced.
	#[serde(default)]
	pub resource_roles: HashMap<String, Vec<String>>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BasicAuthConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub users: Vec<BasicUser>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BasicUser {
	pub id: String,
	pub password: SecretString,
	/// When false the stored password is plaintext and compared in constant
	/// time; when true it must carry a recognized hash prefix.
	#[serde(default)]
	pub password_hashed: bool,
	#[serde(default)]
	pub roles: Vec<String>,
}

impl std::fmt::Debug for BasicUser {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("BasicUser")
			.field("id", &self.id)
			.field("password", &"<redacted>")
			.field("password_hashed", &self.password_hashed)
			.field("roles", &self.roles)
			.finish()
	}
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JwtConfig {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub jwks_url: String,
	/// If non-empty, `iss` must match exactly.
	#[serde(default)]
	pub issuer_url: String,
	/// If non-empty, the token's audience must contain it.
	#[serde(default)]
	pub audience: String,
	/// Claim carrying roles, either space-separated or an array of strings.
	/// Empty means bearer requests skip authorization.
	#[serde(default)]
	pub scope_claim: String,
	/// Local role to the claim values that grant it; `"*"` marks the default
	/// role for otherwise-unmatched claim values.
	#[serde(default)]
	pub permission_mapping: HashMap<String, Vec<String>>,
}
