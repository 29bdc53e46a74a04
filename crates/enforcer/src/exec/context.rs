use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::policy::RouteMetadata;

/// Body materialized for a phase. `present` distinguishes "no body" from a
/// zero-length replacement.
#[derive(Clone, Debug, Default)]
pub struct BodyState {
	pub data: Bytes,
	pub present: bool,
	pub end_of_stream: bool,
}

impl BodyState {
	pub fn full(data: Bytes) -> Self {
		Self {
			data,
			present: true,
			end_of_stream: true,
		}
	}
}

/// Record of mutations actually applied to a context. The proxy-facing layer
/// drains this into wire-level header/body mutations; the executor only ever
/// appends to it.
#[derive(Clone, Debug, Default)]
pub struct MutationLog {
	pub set_headers: Vec<(HeaderName, HeaderValue)>,
	pub append_headers: Vec<(HeaderName, HeaderValue)>,
	pub remove_headers: Vec<HeaderName>,
	pub body: Option<Bytes>,
	pub path: Option<String>,
	pub method: Option<String>,
	pub status: Option<u16>,
}

/// Per-exchange request state. Identity fields are fixed at creation; the
/// rest is mutated by policy actions. The metadata bag is carried over into
/// the response context when the response phase starts.
#[derive(Clone, Debug)]
pub struct RequestContext {
	pub request_id: String,
	pub route: Arc<RouteMetadata>,
	pub authority: String,
	pub scheme: String,

	pub method: String,
	/// Path including the query string, as seen on the wire.
	pub path: String,
	pub headers: HeaderMap,
	pub body: Option<BodyState>,
	pub metadata: serde_json::Map<String, serde_json::Value>,

	pub(crate) mutations: MutationLog,
}

impl RequestContext {
	pub fn new(
		request_id: impl Into<String>,
		route: Arc<RouteMetadata>,
		method: impl Into<String>,
		path: impl Into<String>,
		authority: impl Into<String>,
		scheme: impl Into<String>,
		headers: HeaderMap,
	) -> Self {
		Self {
			request_id: request_id.into(),
			route,
			authority: authority.into(),
			scheme: scheme.into(),
			method: method.into(),
			path: path.into(),
			headers,
			body: None,
			metadata: serde_json::Map::new(),
			mutations: MutationLog::default(),
		}
	}

	/// First value of a header, matched case-insensitively.
	pub fn header(&self, name: &str) -> Option<&str> {
		self.headers.get(name).and_then(|v| v.to_str().ok())
	}

	pub fn take_mutations(&mut self) -> MutationLog {
		std::mem::take(&mut self.mutations)
	}
}

/// Per-exchange response state: a snapshot of the request as it was finally
/// sent upstream, plus the mutable upstream response.
#[derive(Clone, Debug)]
pub struct ResponseContext {
	pub request_id: String,
	pub route: Arc<RouteMetadata>,

	pub request_method: String,
	pub request_path: String,
	pub request_headers: HeaderMap,

	pub status: u16,
	pub headers: HeaderMap,
	pub body: Option<BodyState>,
	pub metadata: serde_json::Map<String, serde_json::Value>,

	pub(crate) mutations: MutationLog,
}

impl ResponseContext {
	/// Snapshot the completed request and start tracking the response. The
	/// metadata bag moves across so response-phase policies observe what the
	/// request phase recorded.
	pub fn from_request(request: &RequestContext, status: u16, headers: HeaderMap) -> Self {
		Self {
			request_id: request.request_id.clone(),
			route: request.route.clone(),
			request_method: request.method.clone(),
			request_path: request.path.clone(),
			request_headers: request.headers.clone(),
			status,
			headers,
			body: None,
			metadata: request.metadata.clone(),
			mutations: MutationLog::default(),
		}
	}

	pub fn take_mutations(&mut self) -> MutationLog {
		std::mem::take(&mut self.mutations)
	}
}
