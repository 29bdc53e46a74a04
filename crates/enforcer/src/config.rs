use std::net::SocketAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::auth::AuthConfig;
use crate::ext_proc::ExtProcConfig;
use crate::xds::{AdsConfig, AdsTlsConfig};

/// What a user can pass in. `Config` is the validated internal form.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RawConfig {
	/// ext_proc listen address in the form "ip:port".
	ext_proc_addr: Option<String>,
	/// Admin/control-plane HTTP address; unset disables the admin surface.
	admin_addr: Option<String>,
	xds: Option<RawXds>,
	#[serde(default)]
	auth: AuthConfig,
	ext_proc: Option<RawExtProc>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawXds {
	/// ADS server URL, e.g. "http://controlplane:18000".
	address: String,
	node_id: String,
	cluster: String,
	connect_timeout_secs: Option<u64>,
	request_timeout_secs: Option<u64>,
	initial_reconnect_delay_ms: Option<u64>,
	max_reconnect_delay_secs: Option<u64>,
	tls: Option<RawXdsTls>,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawXdsTls {
	ca_cert: String,
	client_cert: String,
	client_key: String,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawExtProc {
	route_header: Option<String>,
	with_conditions: Option<bool>,
	phase_timeout_secs: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct Config {
	pub ext_proc_addr: SocketAddr,
	pub admin_addr: Option<SocketAddr>,
	pub xds: Option<AdsConfig>,
	pub auth: AuthConfig,
	pub ext_proc: ExtProcConfig,
}

impl Config {
	pub fn from_yaml(contents: &str) -> anyhow::Result<Self> {
		let raw: RawConfig = serde_yaml::from_str(contents)?;
		Self::from_raw(raw)
	}

	pub fn from_raw(raw: RawConfig) -> anyhow::Result<Self> {
		let ext_proc_addr = raw
			.ext_proc_addr
			.as_deref()
			.unwrap_or("127.0.0.1:9001")
			.parse()?;
		let admin_addr = raw.admin_addr.as_deref().map(str::parse).transpose()?;

		let xds = raw
			.xds
			.map(|x| {
				let defaults = AdsConfig::default();
				let config = AdsConfig {
					server_address: x.address,
					node_id: x.node_id,
					cluster: x.cluster,
					connect_timeout: x
						.connect_timeout_secs
						.map(Duration::from_secs)
						.unwrap_or(defaults.connect_timeout),
					request_timeout: x
						.request_timeout_secs
						.map(Duration::from_secs)
						.unwrap_or(defaults.request_timeout),
					initial_reconnect_delay: x
						.initial_reconnect_delay_ms
						.map(Duration::from_millis)
						.unwrap_or(defaults.initial_reconnect_delay),
					max_reconnect_delay: x
						.max_reconnect_delay_secs
						.map(Duration::from_secs)
						.unwrap_or(defaults.max_reconnect_delay),
					tls: x.tls.map(|t| AdsTlsConfig {
						ca_cert: t.ca_cert.into(),
						client_cert: t.client_cert.into(),
						client_key: t.client_key.into(),
					}),
				};
				config.validate().map(|_| config)
			})
			.transpose()?;

		let ext_proc = raw
			.ext_proc
			.map(|e| {
				let defaults = ExtProcConfig::default();
				ExtProcConfig {
					route_header: e.route_header.unwrap_or(defaults.route_header),
					with_conditions: e.with_conditions.unwrap_or(defaults.with_conditions),
					phase_timeout: e
						.phase_timeout_secs
						.map(Duration::from_secs)
						.unwrap_or(defaults.phase_timeout),
				}
			})
			.unwrap_or_default();

		Ok(Self {
			ext_proc_addr,
			admin_addr,
			xds,
			auth: raw.auth,
			ext_proc,
		})
	}
}
