use headers::authorization::Basic;
use headers::{Authorization, HeaderMapExt};
use secrecy::ExposeSecret;
use tracing::debug;

use super::{AuthContext, AuthError, Authenticator, BasicUser};
use crate::hashing;

pub struct BasicAuthenticator {
	users: Vec<BasicUser>,
}

impl BasicAuthenticator {
	pub fn new(users: Vec<BasicUser>) -> Self {
		Self { users }
	}

	fn verify(&self, username: &str, password: &str) -> Option<&BasicUser> {
		let user = self
			.users
			.iter()
			.find(|u| u.id.eq_ignore_ascii_case(username))?;
		let stored = user.password.expose_secret();
		let ok = if user.password_hashed {
			hashing::verify_stored_hash(stored, password)
		} else {
			hashing::constant_time_eq(stored.as_bytes(), password.as_bytes())
		};
		ok.then_some(user)
	}
}

impl Authenticator for BasicAuthenticator {
	fn name(&self) -> &'static str {
		"basic"
	}

	fn can_handle(&self, headers: &http::HeaderMap) -> bool {
		headers
			.get(http::header::AUTHORIZATION)
			.and_then(|v| v.to_str().ok())
			.is_some_and(|v| v.starts_with("Basic "))
	}

	fn authenticate(&self, headers: &http::HeaderMap) -> Result<AuthContext, AuthError> {
		let Some(Authorization(basic)) = headers.typed_get::<Authorization<Basic>>() else {
			debug!("malformed basic credentials");
			return Err(AuthError::Failed);
		};

		let user = self
			.verify(basic.username(), basic.password())
			.ok_or_else(|| {
				debug!(username = basic.username(), "basic credential verification failed");
				AuthError::Failed
			})?;

		Ok(AuthContext {
			authenticated: true,
			user_id: user.id.clone(),
			roles: user.roles.clone(),
			claims: None,
			auth_skipped: false,
		})
	}
}
