use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policy::{PolicySpec, RouteMetadata};
use crate::store::apikeys::ApiKeyRecord;

pub mod client;
pub mod handlers;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// The three resource types served over the single aggregated stream.
pub const POLICY_CHAIN_TYPE_URL: &str = "type.googleapis.com/enforcer.v1.PolicyChain";
pub const API_KEY_STATE_TYPE_URL: &str = "type.googleapis.com/enforcer.v1.ApiKeyState";
pub const LAZY_RESOURCE_TYPE_URL: &str = "type.googleapis.com/enforcer.v1.LazyResource";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("{field} must not be empty")]
	Empty { field: &'static str },
	#[error("{field} must be strictly positive")]
	NonPositive { field: &'static str },
	#[error("TLS is enabled but {field} is missing")]
	MissingTls { field: &'static str },
}

#[derive(Clone, Debug)]
pub struct AdsTlsConfig {
	pub ca_cert: PathBuf,
	pub client_cert: PathBuf,
	pub client_key: PathBuf,
}

/// Connection settings for the aggregated discovery stream.
#[derive(Clone, Debug)]
pub struct AdsConfig {
	pub server_address: String,
	pub node_id: String,
	pub cluster: String,
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
	pub initial_reconnect_delay: Duration,
	pub max_reconnect_delay: Duration,
	pub tls: Option<AdsTlsConfig>,
}

impl Default for AdsConfig {
	fn default() -> Self {
		Self {
			server_address: String::new(),
			node_id: String::new(),
			cluster: String::new(),
			connect_timeout: Duration::from_secs(10),
			request_timeout: Duration::from_secs(10),
			initial_reconnect_delay: Duration::from_millis(500),
			max_reconnect_delay: Duration::from_secs(30),
			tls: None,
		}
	}
}

impl AdsConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		for (field, value) in [
			("serverAddress", &self.server_address),
			("nodeId", &self.node_id),
			("cluster", &self.cluster),
		] {
			if value.is_empty() {
				return Err(ConfigError::Empty { field });
			}
		}
		for (field, value) in [
			("connectTimeout", self.connect_timeout),
			("requestTimeout", self.request_timeout),
			("initialReconnectDelay", self.initial_reconnect_delay),
			("maxReconnectDelay", self.max_reconnect_delay),
		] {
			if value.is_zero() {
				return Err(ConfigError::NonPositive { field });
			}
		}
		if let Some(tls) = &self.tls {
			for (field, value) in [
				("caCert", &tls.ca_cert),
				("clientCert", &tls.client_cert),
				("clientKey", &tls.client_key),
			] {
				if value.as_os_str().is_empty() {
					return Err(ConfigError::MissingTls { field });
				}
			}
		}
		Ok(())
	}
}

/// One route's chain as pushed by the control plane; the resource payload
/// inside the `Any` envelope.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChainResource {
	pub route: RouteMetadata,
	#[serde(default)]
	pub policies: Vec<PolicySpec>,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApiKeyAction {
	Store,
	Revoke,
	RemoveByApi,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyOp {
	pub action: ApiKeyAction,
	pub api_id: String,
	/// The record for `store` ops.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub key: Option<ApiKeyRecord>,
	/// The plaintext key for `revoke` ops.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plaintext_key: Option<String>,
	#[serde(default)]
	pub correlation_id: String,
	#[serde(default)]
	pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}

/// Ordered list of API-key operations; ordering is guaranteed, batch
/// atomicity is not.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyOpBatch {
	pub batch_id: String,
	#[serde(default)]
	pub version: String,
	#[serde(default)]
	pub ops: Vec<ApiKeyOp>,
}

