use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::{
	AggregatedDiscoveryService, AggregatedDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
	DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use futures::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tonic::{Request, Response, Status, Streaming};

use super::client::{AdsClient, ClientState, ResourceHandler};
use super::handlers::{ApiKeyHandler, LazyResourceHandler, PolicyChainHandler};
use super::*;
use crate::exec::context::RequestContext;
use crate::policy::registry::PolicyRegistry;
use crate::policy::{Parameters, Policy, PolicyDefinition, ProcessingMode, RequestAction};
use crate::store::Stores;

struct NoopPolicy;

#[async_trait::async_trait]
impl Policy for NoopPolicy {
	fn mode(&self) -> ProcessingMode {
		ProcessingMode::headers_only()
	}

	async fn on_request(
		&self,
		_ctx: &mut RequestContext,
		_parameters: &Parameters,
	) -> anyhow::Result<Option<RequestAction>> {
		Ok(None)
	}
}

fn registry_with_noop(builds: Arc<AtomicUsize>) -> PolicyRegistry {
	let registry = PolicyRegistry::new();
	registry.register(
		PolicyDefinition {
			name: "noop".into(),
			version: "v1".into(),
			..Default::default()
		},
		Arc::new(move |_, _| {
			builds.fetch_add(1, Ordering::SeqCst);
			Ok(Arc::new(NoopPolicy))
		}),
	);
	registry
}

fn any_of(type_url: &str, payload: &impl Serialize) -> envoy_types::pb::google::protobuf::Any {
	envoy_types::pb::google::protobuf::Any {
		type_url: type_url.to_string(),
		value: serde_json::to_vec(payload).unwrap(),
	}
}

fn chain_resource(route: &str, policies: &[(&str, &str)]) -> PolicyChainResource {
	PolicyChainResource {
		route: crate::policy::RouteMetadata {
			route_name: route.into(),
			api_id: "api-1".into(),
			api_name: "orders".into(),
			api_version: "1.0".into(),
			..Default::default()
		},
		policies: policies
			.iter()
			.map(|(name, version)| crate::policy::PolicySpec {
				name: name.to_string(),
				version: version.to_string(),
				enabled: true,
				parameters: Parameters::new(),
				execution_condition: None,
			})
			.collect(),
	}
}

// -- mock ADS server ---------------------------------------------------------

struct MockAds {
	requests: mpsc::Sender<DiscoveryRequest>,
	responses: std::sync::Mutex<Option<mpsc::Receiver<Result<DiscoveryResponse, Status>>>>,
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for MockAds {
	type StreamAggregatedResourcesStream =
		Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send>>;
	type DeltaAggregatedResourcesStream =
		Pin<Box<dyn Stream<Item = Result<DeltaDiscoveryResponse, Status>> + Send>>;

	async fn stream_aggregated_resources(
		&self,
		request: Request<Streaming<DiscoveryRequest>>,
	) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
		let mut inbound = request.into_inner();
		let tx = self.requests.clone();
		tokio::spawn(async move {
			while let Ok(Some(req)) = inbound.message().await {
				if tx.send(req).await.is_err() {
					break;
				}
			}
		});
		let rx = self
			.responses
			.lock()
			.unwrap()
			.take()
			.ok_or_else(|| Status::unavailable("single-stream mock already consumed"))?;
		Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
	}

	async fn delta_aggregated_resources(
		&self,
		_request: Request<Streaming<DeltaDiscoveryRequest>>,
	) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
		Err(Status::unimplemented("delta xDS is not served"))
	}
}

struct TestServer {
	address: String,
	requests: mpsc::Receiver<DiscoveryRequest>,
	responses: mpsc::Sender<Result<DiscoveryResponse, Status>>,
}

async fn start_mock_server() -> TestServer {
	let (req_tx, req_rx) = mpsc::channel(64);
	let (resp_tx, resp_rx) = mpsc::channel(64);
	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let address = format!("http://{}", listener.local_addr().unwrap());
	let mock = MockAds {
		requests: req_tx,
		responses: std::sync::Mutex::new(Some(resp_rx)),
	};
	tokio::spawn(async move {
		let _ = tonic::transport::Server::builder()
			.add_service(AggregatedDiscoveryServiceServer::new(mock))
			.serve_with_incoming(TcpListenerStream::new(listener))
			.await;
	});
	TestServer {
		address,
		requests: req_rx,
		responses: resp_tx,
	}
}

async fn next_request(server: &mut TestServer) -> DiscoveryRequest {
	tokio::time::timeout(Duration::from_secs(5), server.requests.recv())
		.await
		.expect("timed out waiting for discovery request")
		.expect("request channel closed")
}

async fn push(
	server: &TestServer,
	type_url: &str,
	version: &str,
	nonce: &str,
	resources: Vec<envoy_types::pb::google::protobuf::Any>,
) {
	server
		.responses
		.send(Ok(DiscoveryResponse {
			version_info: version.to_string(),
			resources,
			type_url: type_url.to_string(),
			nonce: nonce.to_string(),
			..Default::default()
		}))
		.await
		.unwrap();
}

fn test_config(address: &str) -> AdsConfig {
	AdsConfig {
		server_address: address.to_string(),
		node_id: "engine-1".into(),
		cluster: "gateway".into(),
		connect_timeout: Duration::from_secs(2),
		request_timeout: Duration::from_secs(2),
		initial_reconnect_delay: Duration::from_millis(20),
		max_reconnect_delay: Duration::from_millis(200),
		tls: None,
	}
}

// -- config validation -------------------------------------------------------

#[test]
fn config_validation_rules() {
	assert!(test_config("http://127.0.0.1:1").validate().is_ok());

	let mut config = test_config("http://127.0.0.1:1");
	config.node_id = String::new();
	assert!(matches!(config.validate(), Err(ConfigError::Empty { field: "nodeId" })));

	let mut config = test_config("http://127.0.0.1:1");
	config.request_timeout = Duration::ZERO;
	assert!(matches!(config.validate(), Err(ConfigError::NonPositive { .. })));

	let mut config = test_config("http://127.0.0.1:1");
	config.tls = Some(AdsTlsConfig {
		ca_cert: "ca.pem".into(),
		client_cert: "".into(),
		client_key: "key.pem".into(),
	});
	assert!(matches!(
		config.validate(),
		Err(ConfigError::MissingTls { field: "clientCert" })
	));
}

// -- ACK/NACK over a live stream ---------------------------------------------

#[tokio::test]
async fn ack_and_nack_are_tracked_per_type() {
	let mut server = start_mock_server().await;
	let stores = Stores::new();
	let builds = Arc::new(AtomicUsize::new(0));
	let registry = registry_with_noop(builds.clone());

	let client = AdsClient::new(
		test_config(&server.address),
		vec![
			Arc::new(PolicyChainHandler::new(registry, stores.snapshot.clone())),
			Arc::new(ApiKeyHandler::new(stores.api_keys.clone())),
			Arc::new(LazyResourceHandler::new(stores.lazy.clone())),
		],
	)
	.unwrap();
	let runner = {
		let client = client.clone();
		tokio::spawn(async move { client.run().await })
	};

	// Initial subscription: one request per type URL, empty version and nonce.
	for expected in [
		POLICY_CHAIN_TYPE_URL,
		API_KEY_STATE_TYPE_URL,
		LAZY_RESOURCE_TYPE_URL,
	] {
		let req = next_request(&mut server).await;
		assert_eq!(req.type_url, expected);
		assert_eq!(req.version_info, "");
		assert_eq!(req.response_nonce, "");
		let node = req.node.unwrap();
		assert_eq!(node.id, "engine-1");
		assert_eq!(node.cluster, "gateway");
	}

	// Accepted policy-chain push is ACKed with its version and nonce.
	push(
		&server,
		POLICY_CHAIN_TYPE_URL,
		"v1",
		"n1",
		vec![any_of(
			POLICY_CHAIN_TYPE_URL,
			&chain_resource("orders-route", &[("noop", "v1")]),
		)],
	)
	.await;
	let ack = next_request(&mut server).await;
	assert_eq!(ack.type_url, POLICY_CHAIN_TYPE_URL);
	assert_eq!(ack.version_info, "v1");
	assert_eq!(ack.response_nonce, "n1");
	assert!(ack.error_detail.is_none());
	assert!(stores.snapshot.chain("orders-route").is_some());

	// A second type URL keeps its own version track.
	push(
		&server,
		API_KEY_STATE_TYPE_URL,
		"v7",
		"n2",
		vec![any_of(
			API_KEY_STATE_TYPE_URL,
			&ApiKeyOpBatch {
				batch_id: "b1".into(),
				version: "v7".into(),
				ops: vec![],
			},
		)],
	)
	.await;
	let ack = next_request(&mut server).await;
	assert_eq!(ack.type_url, API_KEY_STATE_TYPE_URL);
	assert_eq!(ack.version_info, "v7");
	assert_eq!(ack.response_nonce, "n2");

	// A rejected policy-chain push is NACKed with the previously accepted
	// version; the installed snapshot is untouched and other types keep
	// their versions.
	push(
		&server,
		POLICY_CHAIN_TYPE_URL,
		"v2",
		"n3",
		vec![any_of(
			POLICY_CHAIN_TYPE_URL,
			&chain_resource("orders-route", &[("unregistered", "v9")]),
		)],
	)
	.await;
	let nack = next_request(&mut server).await;
	assert_eq!(nack.type_url, POLICY_CHAIN_TYPE_URL);
	assert_eq!(nack.version_info, "v1");
	assert_eq!(nack.response_nonce, "n3");
	let detail = nack.error_detail.unwrap();
	assert!(detail.message.contains("unregistered"));
	assert_eq!(stores.snapshot.current().version, "v1");

	client.stop();
	let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;
}

#[tokio::test]
async fn unknown_type_url_is_nacked() {
	let mut server = start_mock_server().await;
	let stores = Stores::new();
	let client = AdsClient::new(
		test_config(&server.address),
		vec![Arc::new(ApiKeyHandler::new(stores.api_keys.clone()))],
	)
	.unwrap();
	let runner = {
		let client = client.clone();
		tokio::spawn(async move { client.run().await })
	};
	// Drain the three initial subscriptions.
	for _ in 0..3 {
		next_request(&mut server).await;
	}

	push(&server, POLICY_CHAIN_TYPE_URL, "v1", "n1", vec![]).await;
	let nack = next_request(&mut server).await;
	assert_eq!(nack.version_info, "");
	assert!(nack.error_detail.is_some());

	client.stop();
	let _ = tokio::time::timeout(Duration::from_secs(5), runner).await;
}

#[tokio::test]
async fn stop_is_terminal_and_idempotent() {
	// Nothing listens on this address; the client cycles through reconnects
	// until stopped.
	let client = AdsClient::new(test_config("http://127.0.0.1:9"), vec![]).unwrap();
	let mut state = client.state();
	let runner = {
		let client = client.clone();
		tokio::spawn(async move { client.run().await })
	};

	client.stop();
	client.stop();
	tokio::time::timeout(Duration::from_secs(5), runner)
		.await
		.expect("client did not stop")
		.unwrap();
	assert_eq!(*state.borrow_and_update(), ClientState::Stopped);
}

// -- handlers ----------------------------------------------------------------

#[test]
fn policy_chain_handler_reuses_unchanged_instances() {
	let stores = Stores::new();
	let builds = Arc::new(AtomicUsize::new(0));
	let handler = PolicyChainHandler::new(registry_with_noop(builds.clone()), stores.snapshot.clone());

	let resource = chain_resource("r1", &[("noop", "v1")]);
	handler
		.apply("1", &[any_of(POLICY_CHAIN_TYPE_URL, &resource)])
		.unwrap();
	assert_eq!(builds.load(Ordering::SeqCst), 1);

	// Same spec again: the prior instance is reused.
	handler
		.apply("2", &[any_of(POLICY_CHAIN_TYPE_URL, &resource)])
		.unwrap();
	assert_eq!(builds.load(Ordering::SeqCst), 1);
	assert_eq!(stores.snapshot.current().version, "2");

	// Changed parameters force a rebuild.
	let mut changed = chain_resource("r1", &[("noop", "v1")]);
	changed.policies[0]
		.parameters
		.insert("limit".into(), serde_json::json!(10));
	handler
		.apply("3", &[any_of(POLICY_CHAIN_TYPE_URL, &changed)])
		.unwrap();
	assert_eq!(builds.load(Ordering::SeqCst), 2);
}

#[test]
fn policy_chain_handler_rejects_whole_snapshot_on_factory_error() {
	let stores = Stores::new();
	let builds = Arc::new(AtomicUsize::new(0));
	let handler = PolicyChainHandler::new(registry_with_noop(builds), stores.snapshot.clone());

	handler
		.apply(
			"1",
			&[any_of(
				POLICY_CHAIN_TYPE_URL,
				&chain_resource("r1", &[("noop", "v1")]),
			)],
		)
		.unwrap();

	let err = handler.apply(
		"2",
		&[
			any_of(POLICY_CHAIN_TYPE_URL, &chain_resource("r1", &[("noop", "v1")])),
			any_of(
				POLICY_CHAIN_TYPE_URL,
				&chain_resource("r2", &[("missing", "v1")]),
			),
		],
	);
	assert!(err.is_err());
	// The prior snapshot keeps serving.
	assert_eq!(stores.snapshot.current().version, "1");
	assert!(stores.snapshot.chain("r2").is_none());
}

#[test]
fn api_key_handler_applies_ops_in_order() {
	let stores = Stores::new();
	let handler = ApiKeyHandler::new(stores.api_keys.clone());
	let secret = crate::hashing::sha256_salted("s", "TOP");
	let token = format!("TOP.{}", hex::encode("k1"));

	let record = crate::store::apikeys::ApiKeyRecord {
		id: "k1".into(),
		name: "k1-name".into(),
		key_hash: secret,
		api_id: "A".into(),
		allowed_operations: vec!["*".into()],
		..Default::default()
	};
	let batch = ApiKeyOpBatch {
		batch_id: "b1".into(),
		version: "1".into(),
		ops: vec![
			ApiKeyOp {
				action: ApiKeyAction::Store,
				api_id: "A".into(),
				key: Some(record),
				plaintext_key: None,
				correlation_id: "c1".into(),
				timestamp: None,
			},
			ApiKeyOp {
				action: ApiKeyAction::Revoke,
				api_id: "A".into(),
				key: None,
				plaintext_key: Some(token.clone()),
				correlation_id: "c2".into(),
				timestamp: None,
			},
		],
	};
	handler
		.apply("1", &[any_of(API_KEY_STATE_TYPE_URL, &batch)])
		.unwrap();
	// Stored then revoked, in that order.
	assert!(!stores.api_keys.validate("A", "/x", "GET", &token));
	assert_eq!(stores.api_keys.count(), 1);

	// remove_by_api wipes the rest.
	let batch = ApiKeyOpBatch {
		batch_id: "b2".into(),
		version: "2".into(),
		ops: vec![ApiKeyOp {
			action: ApiKeyAction::RemoveByApi,
			api_id: "A".into(),
			key: None,
			plaintext_key: None,
			correlation_id: "c3".into(),
			timestamp: None,
		}],
	};
	handler
		.apply("2", &[any_of(API_KEY_STATE_TYPE_URL, &batch)])
		.unwrap();
	assert_eq!(stores.api_keys.count(), 0);
}

#[test]
fn lazy_handler_replaces_state_of_the_world() {
	let stores = Stores::new();
	let handler = LazyResourceHandler::new(stores.lazy.clone());

	let a = crate::store::lazy::LazyResource {
		resource_type: "ratelimit".into(),
		id: "a".into(),
		payload: Default::default(),
	};
	let b = crate::store::lazy::LazyResource {
		resource_type: "ratelimit".into(),
		id: "b".into(),
		payload: Default::default(),
	};
	handler
		.apply(
			"1",
			&[
				any_of(LAZY_RESOURCE_TYPE_URL, &a),
				any_of(LAZY_RESOURCE_TYPE_URL, &b),
			],
		)
		.unwrap();
	assert_eq!(stores.lazy.len(), 2);

	handler
		.apply("2", &[any_of(LAZY_RESOURCE_TYPE_URL, &b)])
		.unwrap();
	assert_eq!(stores.lazy.len(), 1);
	assert!(stores.lazy.get_typed("ratelimit", "a").is_none());
}
