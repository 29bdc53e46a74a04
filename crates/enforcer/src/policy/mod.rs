use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::exec::context::{RequestContext, ResponseContext};

pub mod registry;

/// Opaque, already-validated parameter values handed to policy instances.
pub type Parameters = serde_json::Map<String, serde_json::Value>;

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HeaderMode {
	Skip,
	#[default]
	Process,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BodyMode {
	#[default]
	Skip,
	Buffer,
	Stream,
}

/// Declares what a policy instance needs materialized per phase. The executor
/// uses this to decide which callbacks to invoke; the proxy-facing layer uses
/// it to decide whether bodies must be pulled from the proxy at all.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMode {
	pub request_headers: HeaderMode,
	pub request_body: BodyMode,
	pub response_headers: HeaderMode,
	pub response_body: BodyMode,
}

impl ProcessingMode {
	/// Headers-only processing on both phases.
	pub fn headers_only() -> Self {
		Self::default()
	}

	pub fn passthrough() -> Self {
		Self {
			request_headers: HeaderMode::Skip,
			request_body: BodyMode::Skip,
			response_headers: HeaderMode::Skip,
			response_body: BodyMode::Skip,
		}
	}

	pub fn skips_request_phase(&self) -> bool {
		self.request_headers == HeaderMode::Skip && self.request_body == BodyMode::Skip
	}

	pub fn skips_response_phase(&self) -> bool {
		self.response_headers == HeaderMode::Skip && self.response_body == BodyMode::Skip
	}

	pub fn wants_request_body(&self) -> bool {
		self.request_body != BodyMode::Skip
	}

	pub fn wants_response_body(&self) -> bool {
		self.response_body != BodyMode::Skip
	}
}

/// One policy instance on a route, as programmed by the control plane.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
	pub name: String,
	pub version: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	#[serde(default)]
	pub parameters: Parameters,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub execution_condition: Option<String>,
}

fn default_enabled() -> bool {
	true
}

impl PolicySpec {
	pub fn key(&self) -> String {
		format!("{}@{}", self.name, self.version)
	}
}

/// Static description of a `(name, version)` pair known to the registry.
/// `system_parameters` are merged under the runtime spec parameters before the
/// factory is invoked; runtime wins on key conflict.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDefinition {
	pub name: String,
	pub version: String,
	#[serde(default)]
	pub display_name: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub parameter_schema: serde_json::Value,
	#[serde(default)]
	pub system_parameters: Parameters,
}

impl PolicyDefinition {
	pub fn merged_parameters(&self, spec: &PolicySpec) -> Parameters {
		let mut merged = self.system_parameters.clone();
		for (k, v) in &spec.parameters {
			merged.insert(k.clone(), v.clone());
		}
		merged
	}
}

/// Identity of the route a chain is bound to, handed to factories and carried
/// into every request context on that route.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetadata {
	pub route_name: String,
	pub api_id: String,
	pub api_name: String,
	pub api_version: String,
	#[serde(default)]
	pub api_context: String,
	#[serde(default)]
	pub operation_path: String,
}

/// Request-phase mutations applied to the upstream-bound request.
#[derive(Clone, Debug, Default)]
pub struct UpstreamRequestModifications {
	/// Replace all values of the key with a single value.
	pub set_headers: Vec<(String, String)>,
	/// Append to existing values, preserving order.
	pub append_headers: Vec<(String, String)>,
	pub remove_headers: Vec<String>,
	pub add_query_parameters: Vec<(String, String)>,
	pub remove_query_parameters: Vec<String>,
	/// Full body replacement; zero-length means "present, empty".
	pub body: Option<Bytes>,
	pub path: Option<String>,
	pub method: Option<String>,
	pub analytics_metadata: Parameters,
	pub drop_analytics_headers: Vec<String>,
}

/// Response-phase mutations applied to the downstream-bound response.
#[derive(Clone, Debug, Default)]
pub struct UpstreamResponseModifications {
	pub set_headers: Vec<(String, String)>,
	pub append_headers: Vec<(String, String)>,
	pub remove_headers: Vec<String>,
	pub body: Option<Bytes>,
	pub status_code: Option<u16>,
}

/// Terminal request-phase action: reply to the proxy without calling
/// upstream. Aborts the rest of the request chain and skips the response
/// chain entirely.
#[derive(Clone, Debug)]
pub struct ImmediateResponse {
	pub status: u16,
	pub headers: Vec<(String, String)>,
	pub body: String,
	pub analytics_metadata: Parameters,
}

impl ImmediateResponse {
	pub fn new(status: u16, body: impl Into<String>) -> Self {
		Self {
			status,
			headers: Vec::new(),
			body: body.into(),
			analytics_metadata: Parameters::new(),
		}
	}
}

/// Closed set of request-phase outcomes. Absence (`None` from `on_request`)
/// is pass-through.
#[derive(Clone, Debug)]
pub enum RequestAction {
	Modifications(UpstreamRequestModifications),
	DirectResponse(ImmediateResponse),
}

/// Closed set of response-phase outcomes; an immediate response makes no
/// sense once the upstream has answered.
#[derive(Clone, Debug)]
pub enum ResponseAction {
	Modifications(UpstreamResponseModifications),
}

/// The capability set the executor relies on. Policies do not share an
/// inheritance hierarchy beyond this trait; the factory decides whether an
/// instance is per-route, cached, or process-wide.
#[async_trait]
pub trait Policy: Send + Sync {
	/// Expected to be pure and stable for the instance's lifetime.
	fn mode(&self) -> ProcessingMode;

	async fn on_request(
		&self,
		ctx: &mut RequestContext,
		parameters: &Parameters,
	) -> anyhow::Result<Option<RequestAction>>;

	async fn on_response(
		&self,
		_ctx: &mut ResponseContext,
		_parameters: &Parameters,
	) -> anyhow::Result<Option<ResponseAction>> {
		Ok(None)
	}
}

/// Builds a policy instance for a route. The factory may return a fresh
/// instance, one cached by parameter fingerprint, or a process singleton.
pub type PolicyFactory =
	Arc<dyn Fn(&RouteMetadata, &Parameters) -> anyhow::Result<Arc<dyn Policy>> + Send + Sync>;
