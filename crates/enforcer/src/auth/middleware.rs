use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};

use super::{
	AuthConfig, AuthContext, AuthError, Authenticator, BasicAuthenticator, BuildError,
	JwtAuthenticator,
};

/// Shared state for the two middlewares. Built once at startup; bearer
/// misconfiguration aborts construction.
pub struct AuthState {
	authenticators: Vec<Arc<dyn Authenticator>>,
	skip_paths: Vec<String>,
	resource_roles: HashMap<String, Vec<String>>,
}

impl std::fmt::Debug for AuthState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AuthState")
			.field("authenticators", &self.authenticators.iter().map(|a| a.name()).collect::<Vec<_>>())
			.field("skip_paths", &self.skip_paths)
			.field("resource_roles", &self.resource_roles)
			.finish()
	}
}

impl AuthState {
	pub async fn new(config: AuthConfig) -> Result<Arc<Self>, BuildError> {
		let mut authenticators: Vec<Arc<dyn Authenticator>> = Vec::new();
		if config.basic_auth.enabled && !config.basic_auth.users.is_empty() {
			authenticators.push(Arc::new(BasicAuthenticator::new(config.basic_auth.users)));
		}
		if config.jwt_config.enabled {
			authenticators.push(Arc::new(JwtAuthenticator::new(config.jwt_config).await?));
		}
		if authenticators.is_empty() {
			info!("no authenticators configured; requests pass through unauthenticated");
		}
		Ok(Arc::new(Self {
			authenticators,
			skip_paths: config.skip_paths,
			resource_roles: config.resource_roles,
		}))
	}

	fn skip(&self, path: &str) -> bool {
		self
			.skip_paths
			.iter()
			.any(|prefix| !prefix.is_empty() && path.starts_with(prefix))
	}
}

/// Attaches both middlewares to a router: authentication first, then
/// resource-role authorization.
pub fn protect(router: Router, state: Arc<AuthState>) -> Router {
	router
		.layer(middleware::from_fn_with_state(state.clone(), authz_middleware))
		.layer(middleware::from_fn_with_state(state, authn_middleware))
}

pub async fn authn_middleware(
	State(state): State<Arc<AuthState>>,
	mut request: Request,
	next: Next,
) -> Response {
	if state.skip(request.uri().path()) {
		request.extensions_mut().insert(AuthContext::skipped());
		return next.run(request).await;
	}
	if state.authenticators.is_empty() {
		request.extensions_mut().insert(AuthContext::no_auth());
		return next.run(request).await;
	}

	let Some(authenticator) = state
		.authenticators
		.iter()
		.find(|a| a.can_handle(request.headers()))
	else {
		return AuthError::NoCredentials.into_response();
	};

	match authenticator.authenticate(request.headers()) {
		Ok(ctx) => {
			debug!(authenticator = authenticator.name(), user = %ctx.user_id, "authenticated");
			request.extensions_mut().insert(ctx);
			next.run(request).await
		},
		Err(err) => {
			// The public message is stable; the kind is the detail.
			warn!(authenticator = authenticator.name(), kind = ?err, "authentication rejected");
			err.into_response()
		},
	}
}

pub async fn authz_middleware(
	State(state): State<Arc<AuthState>>,
	request: Request,
	next: Next,
) -> Response {
	let ctx = request
		.extensions()
		.get::<AuthContext>()
		.cloned()
		.unwrap_or_default();
	if ctx.auth_skipped || state.resource_roles.is_empty() {
		return next.run(request).await;
	}

	// Key off the route template when the router knows it, so wildcard
	// operations can be policed; fall back to the raw path.
	let template = request
		.extensions()
		.get::<MatchedPath>()
		.map(|m| m.as_str().to_string())
		.unwrap_or_else(|| request.uri().path().to_string());
	let resource = format!("{} {}", request.method(), template);

	let Some(required) = state.resource_roles.get(&resource) else {
		// Secure by default: unlisted resources are denied.
		debug!(%resource, "no resource-role entry");
		return AuthError::Forbidden.into_response();
	};
	if ctx.roles.iter().any(|role| required.contains(role)) {
		next.run(request).await
	} else {
		debug!(%resource, user = %ctx.user_id, "role check failed");
		AuthError::Forbidden.into_response()
	}
}
