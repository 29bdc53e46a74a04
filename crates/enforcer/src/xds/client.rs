use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_client::AggregatedDiscoveryServiceClient;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tracing::{debug, info, warn};

use super::{
	API_KEY_STATE_TYPE_URL, AdsConfig, ConfigError, LAZY_RESOURCE_TYPE_URL, POLICY_CHAIN_TYPE_URL,
};

const SUBSCRIBED_TYPE_URLS: &[&str] = &[
	POLICY_CHAIN_TYPE_URL,
	API_KEY_STATE_TYPE_URL,
	LAZY_RESOURCE_TYPE_URL,
];

/// gRPC INVALID_ARGUMENT, carried in NACK error details.
const NACK_CODE: i32 = 3;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientState {
	Disconnected,
	Connecting,
	Connected,
	Reconnecting,
	Stopped,
}

/// Installs decoded resources for one type URL. Handlers run serially on the
/// stream task so version tracking and store mutation advance together; a
/// returned error NACKs the push and leaves the previous state serving.
pub trait ResourceHandler: Send + Sync {
	fn type_url(&self) -> &'static str;
	fn apply(&self, version: &str, resources: &[prost_types::Any]) -> anyhow::Result<()>;
}

struct Inner {
	config: AdsConfig,
	handlers: HashMap<&'static str, Arc<dyn ResourceHandler>>,
	state: watch::Sender<ClientState>,
	shutdown: watch::Sender<bool>,
}

/// Client side of the aggregated discovery stream. One long-lived task calls
/// [`AdsClient::run`]; everything else observes its effects through the typed
/// stores and the state channel. The executor never blocks on this.
#[derive(Clone)]
pub struct AdsClient {
	inner: Arc<Inner>,
}

impl AdsClient {
	pub fn new(
		config: AdsConfig,
		handlers: Vec<Arc<dyn ResourceHandler>>,
	) -> Result<Self, ConfigError> {
		config.validate()?;
		let handlers = handlers.into_iter().map(|h| (h.type_url(), h)).collect();
		let (state, _) = watch::channel(ClientState::Disconnected);
		let (shutdown, _) = watch::channel(false);
		Ok(Self {
			inner: Arc::new(Inner {
				config,
				handlers,
				state,
				shutdown,
			}),
		})
	}

	pub fn state(&self) -> watch::Receiver<ClientState> {
		self.inner.state.subscribe()
	}

	/// Idempotent; terminal. Cancels the stream task and any backoff wait.
	pub fn stop(&self) {
		self.inner.shutdown.send_replace(true);
	}

	fn stopped(&self) -> bool {
		*self.inner.shutdown.borrow()
	}

	fn set_state(&self, state: ClientState) {
		self.inner.state.send_replace(state);
	}

	fn node(&self) -> Node {
		Node {
			id: self.inner.config.node_id.clone(),
			cluster: self.inner.config.cluster.clone(),
			..Default::default()
		}
	}

	/// Drives the subscription until [`stop`](Self::stop) is called. Errors
	/// never escape: stream loss and rejected pushes are self-healed via
	/// reconnect and NACK.
	pub async fn run(&self) {
		// Last accepted version per type URL. Kept across reconnects so every
		// (re)subscription resumes from what we actually hold.
		let mut versions: HashMap<String, String> = HashMap::new();
		let mut delay = self.inner.config.initial_reconnect_delay;
		let mut shutdown = self.inner.shutdown.subscribe();

		while !self.stopped() {
			self.set_state(ClientState::Connecting);
			match self.connect().await {
				Ok(channel) => {
					self.set_state(ClientState::Connected);
					delay = self.inner.config.initial_reconnect_delay;
					if let Err(err) = self.run_stream(&mut versions, channel, &mut shutdown).await
						&& !self.stopped()
					{
						warn!(error = %err, "ADS stream terminated");
					}
				},
				Err(err) => {
					warn!(error = %err, address = %self.inner.config.server_address, "ADS dial failed");
				},
			}
			if self.stopped() {
				break;
			}

			self.set_state(ClientState::Reconnecting);
			let wait = jitter(delay);
			debug!(?wait, "waiting before reconnect");
			tokio::select! {
				_ = tokio::time::sleep(wait) => {},
				_ = shutdown.changed() => break,
			}
			delay = (delay * 2).min(self.inner.config.max_reconnect_delay);
		}
		self.set_state(ClientState::Stopped);
	}

	async fn connect(&self) -> anyhow::Result<Channel> {
		let config = &self.inner.config;
		let mut endpoint = Endpoint::from_shared(config.server_address.clone())?
			.connect_timeout(config.connect_timeout);
		if let Some(tls) = &config.tls {
			let ca = tokio::fs::read(&tls.ca_cert).await?;
			let cert = tokio::fs::read(&tls.client_cert).await?;
			let key = tokio::fs::read(&tls.client_key).await?;
			endpoint = endpoint.tls_config(
				ClientTlsConfig::new()
					.ca_certificate(Certificate::from_pem(ca))
					.identity(Identity::from_pem(cert, key)),
			)?;
		}
		Ok(endpoint.connect().await?)
	}

	async fn run_stream(
		&self,
		versions: &mut HashMap<String, String>,
		channel: Channel,
		shutdown: &mut watch::Receiver<bool>,
	) -> anyhow::Result<()> {
		let mut client = AggregatedDiscoveryServiceClient::new(channel);
		let (tx, rx) = mpsc::channel::<DiscoveryRequest>(16);
		let mut inbound = client
			.stream_aggregated_resources(ReceiverStream::new(rx))
			.await?
			.into_inner();

		// One initial request per type URL, carrying the last accepted
		// version (empty on first connect) and an empty nonce.
		for type_url in SUBSCRIBED_TYPE_URLS {
			self
				.send(
					&tx,
					DiscoveryRequest {
						version_info: versions.get(*type_url).cloned().unwrap_or_default(),
						node: Some(self.node()),
						type_url: type_url.to_string(),
						..Default::default()
					},
				)
				.await?;
		}

		loop {
			if *shutdown.borrow() {
				return Ok(());
			}
			tokio::select! {
				_ = shutdown.changed() => return Ok(()),
				msg = inbound.message() => {
					let Some(response) = msg? else {
						anyhow::bail!("stream closed by server");
					};
					self.handle_response(versions, &tx, response).await?;
				}
			}
		}
	}

	async fn handle_response(
		&self,
		versions: &mut HashMap<String, String>,
		tx: &mpsc::Sender<DiscoveryRequest>,
		response: DiscoveryResponse,
	) -> anyhow::Result<()> {
		let type_url = response.type_url.clone();
		let nonce = response.nonce.clone();

		let applied = match self.inner.handlers.get(type_url.as_str()) {
			Some(handler) => {
				let resources: Vec<prost_types::Any> = response
					.resources
					.iter()
					.map(|any| prost_types::Any {
						type_url: any.type_url.clone(),
						value: any.value.clone(),
					})
					.collect();
				handler.apply(&response.version_info, &resources)
			},
			None => Err(anyhow::anyhow!("unknown type URL {type_url}")),
		};

		let request = match applied {
			Ok(()) => {
				info!(
					type_url = %type_url,
					version = %response.version_info,
					resources = response.resources.len(),
					"accepted configuration push"
				);
				versions.insert(type_url.clone(), response.version_info.clone());
				DiscoveryRequest {
					version_info: response.version_info,
					node: Some(self.node()),
					type_url,
					response_nonce: nonce,
					..Default::default()
				}
			},
			Err(err) => {
				warn!(
					type_url = %type_url,
					version = %response.version_info,
					error = %err,
					"rejected configuration push"
				);
				// The rejected version is not recorded; resubscribe with what
				// we last accepted. Other type URLs are unaffected.
				DiscoveryRequest {
					version_info: versions.get(&type_url).cloned().unwrap_or_default(),
					node: Some(self.node()),
					type_url,
					response_nonce: nonce,
					error_detail: Some(RpcStatus {
						code: NACK_CODE,
						message: err.to_string(),
						details: Vec::new(),
					}),
					..Default::default()
				}
			},
		};
		self.send(tx, request).await
	}

	/// A full outbound queue for longer than `request_timeout` counts as a
	/// stream failure; the caller tears down and reconnects.
	async fn send(
		&self,
		tx: &mpsc::Sender<DiscoveryRequest>,
		request: DiscoveryRequest,
	) -> anyhow::Result<()> {
		match tokio::time::timeout(self.inner.config.request_timeout, tx.send(request)).await {
			Ok(Ok(())) => Ok(()),
			Ok(Err(_)) => anyhow::bail!("discovery request stream dropped"),
			Err(_) => anyhow::bail!("discovery request send timed out"),
		}
	}
}

fn jitter(delay: Duration) -> Duration {
	delay.mul_f64(1.0 + 0.1 * rand::random::<f64>())
}
