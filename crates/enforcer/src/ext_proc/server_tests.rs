use std::collections::HashMap as StdHashMap;

use envoy_types::pb::envoy::config::core::v3::HeaderMap as ProtoHeaderMap;
use prost_types::value::Kind;

use super::*;
use crate::conditions::CelEvaluator;
use crate::exec::ChainEntry;
use crate::policy::{
	BodyMode, HeaderMode, Parameters, Policy, PolicySpec, ProcessingMode, RequestAction,
	ResponseAction, RouteMetadata, UpstreamRequestModifications, UpstreamResponseModifications,
};
use crate::store::snapshot::Snapshot;

struct HeaderPolicy;

#[async_trait::async_trait]
impl Policy for HeaderPolicy {
	fn mode(&self) -> ProcessingMode {
		ProcessingMode::headers_only()
	}

	async fn on_request(
		&self,
		_ctx: &mut RequestContext,
		_parameters: &Parameters,
	) -> anyhow::Result<Option<RequestAction>> {
		Ok(Some(RequestAction::Modifications(UpstreamRequestModifications {
			set_headers: vec![("x-policy".into(), "applied".into())],
			..Default::default()
		})))
	}

	async fn on_response(
		&self,
		_ctx: &mut ResponseContext,
		_parameters: &Parameters,
	) -> anyhow::Result<Option<ResponseAction>> {
		Ok(Some(ResponseAction::Modifications(UpstreamResponseModifications {
			status_code: Some(503),
			..Default::default()
		})))
	}
}

struct DenyIfMarked;

#[async_trait::async_trait]
impl Policy for DenyIfMarked {
	fn mode(&self) -> ProcessingMode {
		ProcessingMode::headers_only()
	}

	async fn on_request(
		&self,
		ctx: &mut RequestContext,
		_parameters: &Parameters,
	) -> anyhow::Result<Option<RequestAction>> {
		if ctx.header("x-deny").is_some() {
			return Ok(Some(RequestAction::DirectResponse(
				crate::policy::ImmediateResponse::new(401, "{\"error\":\"unauthorized\"}"),
			)));
		}
		Ok(None)
	}
}

struct UppercaseBody;

#[async_trait::async_trait]
impl Policy for UppercaseBody {
	fn mode(&self) -> ProcessingMode {
		ProcessingMode {
			request_headers: HeaderMode::Process,
			request_body: BodyMode::Buffer,
			response_headers: HeaderMode::Skip,
			response_body: BodyMode::Skip,
		}
	}

	async fn on_request(
		&self,
		ctx: &mut RequestContext,
		_parameters: &Parameters,
	) -> anyhow::Result<Option<RequestAction>> {
		let body = ctx.body.as_ref().expect("buffered body materialized");
		let upper = String::from_utf8(body.data.to_vec())?.to_uppercase();
		Ok(Some(RequestAction::Modifications(UpstreamRequestModifications {
			body: Some(upper.into_bytes().into()),
			..Default::default()
		})))
	}
}

fn spec(name: &str, condition: Option<&str>) -> Arc<PolicySpec> {
	Arc::new(PolicySpec {
		name: name.into(),
		version: "v1".into(),
		enabled: true,
		parameters: Parameters::new(),
		execution_condition: condition.map(str::to_string),
	})
}

fn exchange_with(policies: Vec<ChainEntry>) -> (Exchange, Stores) {
	let stores = Stores::new();
	let route = RouteMetadata {
		route_name: "r1".into(),
		api_id: "api-1".into(),
		api_name: "orders".into(),
		api_version: "1.0".into(),
		..Default::default()
	};
	let mut routes = StdHashMap::new();
	routes.insert(
		"r1".to_string(),
		Arc::new(RouteChain::new(route, policies)),
	);
	stores.snapshot.install(Snapshot::new("1", routes));

	let executor = Arc::new(ChainExecutor::new(Arc::new(CelEvaluator::new())));
	let exchange = Exchange::new(
		stores.clone(),
		executor,
		Arc::new(ExtProcConfig::default()),
	);
	(exchange, stores)
}

fn proto_headers(pairs: &[(&str, &str)]) -> ProtoHeaderMap {
	ProtoHeaderMap {
		headers: pairs
			.iter()
			.map(|(k, v)| ProtoHeaderValue {
				key: k.to_string(),
				value: v.to_string(),
				raw_value: Vec::new(),
			})
			.collect(),
	}
}

fn request_headers_msg(pairs: &[(&str, &str)], end_of_stream: bool) -> ProcessingRequest {
	ProcessingRequest {
		request: Some(processing_request::Request::RequestHeaders(HttpHeaders {
			headers: Some(proto_headers(pairs)),
			end_of_stream,
			..Default::default()
		})),
		..Default::default()
	}
}

fn request_body_msg(body: &[u8], end_of_stream: bool) -> ProcessingRequest {
	ProcessingRequest {
		request: Some(processing_request::Request::RequestBody(HttpBody {
			body: body.to_vec(),
			end_of_stream,
		})),
		..Default::default()
	}
}

fn response_headers_msg(status: &str, end_of_stream: bool) -> ProcessingRequest {
	ProcessingRequest {
		request: Some(processing_request::Request::ResponseHeaders(HttpHeaders {
			headers: Some(proto_headers(&[(":status", status), ("content-type", "application/json")])),
			end_of_stream,
			..Default::default()
		})),
		..Default::default()
	}
}

fn base_request_headers(extra: &[(&str, &str)]) -> Vec<(String, String)> {
	let mut pairs = vec![
		(":method".to_string(), "GET".to_string()),
		(":path".to_string(), "/orders".to_string()),
		(":authority".to_string(), "api.example.com".to_string()),
		(":scheme".to_string(), "https".to_string()),
		("x-enforcer-route".to_string(), "r1".to_string()),
	];
	pairs.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
	pairs
}

fn common_of(response: &ProcessingResponse) -> &CommonResponse {
	match response.response.as_ref().unwrap() {
		processing_response::Response::RequestHeaders(h)
		| processing_response::Response::ResponseHeaders(h) => h.response.as_ref().unwrap(),
		processing_response::Response::RequestBody(b)
		| processing_response::Response::ResponseBody(b) => b.response.as_ref().unwrap(),
		other => panic!("expected a common response, got {other:?}"),
	}
}

fn set_header_value<'a>(common: &'a CommonResponse, key: &str) -> Option<&'a [u8]> {
	common
		.header_mutation
		.as_ref()?
		.set_headers
		.iter()
		.find(|o| o.header.as_ref().is_some_and(|h| h.key == key))
		.and_then(|o| o.header.as_ref())
		.map(|h| h.raw_value.as_slice())
}

#[tokio::test]
async fn headers_only_chain_returns_header_mutations() {
	let (mut exchange, _stores) = exchange_with(vec![ChainEntry {
		spec: spec("set-header", None),
		instance: Arc::new(HeaderPolicy),
	}]);

	let pairs = base_request_headers(&[]);
	let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
	let response = exchange.handle(request_headers_msg(&pairs, true)).await;

	let common = common_of(&response);
	assert_eq!(set_header_value(common, "x-policy"), Some(b"applied".as_slice()));
	assert_eq!(common.status, common_response::ResponseStatus::Continue as i32);
	assert!(!exchange.finished);
}

#[tokio::test]
async fn unknown_route_passes_through() {
	let (mut exchange, _stores) = exchange_with(vec![]);
	let response = exchange
		.handle(request_headers_msg(&[(":method", "GET"), (":path", "/x")], true))
		.await;
	let common = common_of(&response);
	assert!(common.header_mutation.is_none());
	assert!(common.body_mutation.is_none());
}

#[tokio::test]
async fn route_can_come_from_ext_proc_attributes() {
	let (mut exchange, _stores) = exchange_with(vec![ChainEntry {
		spec: spec("set-header", None),
		instance: Arc::new(HeaderPolicy),
	}]);

	let mut fields = std::collections::BTreeMap::new();
	fields.insert(
		ROUTE_NAME_ATTRIBUTE.to_string(),
		prost_types::Value {
			kind: Some(Kind::StringValue("r1".to_string())),
		},
	);
	let mut msg = request_headers_msg(&[(":method", "GET"), (":path", "/orders")], true);
	msg.attributes.insert(
		ATTRIBUTES_NAMESPACE.to_string(),
		prost_types::Struct {
			fields: fields.into_iter().collect(),
		},
	);

	let response = exchange.handle(msg).await;
	let common = common_of(&response);
	assert_eq!(set_header_value(common, "x-policy"), Some(b"applied".as_slice()));
}

#[tokio::test]
async fn immediate_response_short_circuits_the_exchange() {
	let (mut exchange, _stores) = exchange_with(vec![
		ChainEntry {
			spec: spec("deny", None),
			instance: Arc::new(DenyIfMarked),
		},
		ChainEntry {
			spec: spec("set-header", None),
			instance: Arc::new(HeaderPolicy),
		},
	]);

	let pairs = base_request_headers(&[("x-deny", "1")]);
	let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
	let response = exchange.handle(request_headers_msg(&pairs, true)).await;

	let Some(processing_response::Response::ImmediateResponse(immediate)) = &response.response else {
		panic!("expected an immediate response");
	};
	assert_eq!(immediate.status.as_ref().unwrap().code, 401);
	assert!(exchange.finished);
}

#[tokio::test]
async fn buffered_body_flow_defers_execution_to_the_body_message() {
	let (mut exchange, _stores) = exchange_with(vec![ChainEntry {
		spec: spec("uppercase", None),
		instance: Arc::new(UppercaseBody),
	}]);

	// Headers with a body still streaming in: the engine asks for a buffered
	// body and defers the chain.
	let pairs = base_request_headers(&[]);
	let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
	let response = exchange.handle(request_headers_msg(&pairs, false)).await;
	let mode = response.mode_override.as_ref().unwrap();
	assert_eq!(
		mode.request_body_mode,
		processing_mode::BodySendMode::Buffered as i32
	);
	assert!(common_of(&response).header_mutation.is_none());

	// Partial chunk: accumulated, nothing decided yet.
	let response = exchange.handle(request_body_msg(b"hel", false)).await;
	assert!(common_of(&response).body_mutation.is_none());

	// Final chunk: the chain runs and replaces the body.
	let response = exchange.handle(request_body_msg(b"lo", true)).await;
	let common = common_of(&response);
	assert_eq!(
		common.status,
		common_response::ResponseStatus::ContinueAndReplace as i32
	);
	let Some(BodyMutation {
		mutation: Some(body_mutation::Mutation::Body(body)),
	}) = &common.body_mutation
	else {
		panic!("expected a body replacement");
	};
	assert_eq!(body.as_slice(), b"HELLO");
}

#[tokio::test]
async fn response_phase_status_change_travels_as_pseudo_header() {
	let (mut exchange, _stores) = exchange_with(vec![ChainEntry {
		spec: spec("set-header", None),
		instance: Arc::new(HeaderPolicy),
	}]);

	let pairs = base_request_headers(&[]);
	let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
	exchange.handle(request_headers_msg(&pairs, true)).await;

	let response = exchange.handle(response_headers_msg("200", true)).await;
	let common = common_of(&response);
	assert_eq!(set_header_value(common, ":status"), Some(b"503".as_slice()));
}

#[tokio::test]
async fn response_chain_is_skipped_after_short_circuit() {
	let (mut exchange, _stores) = exchange_with(vec![ChainEntry {
		spec: spec("deny", None),
		instance: Arc::new(DenyIfMarked),
	}]);

	let pairs = base_request_headers(&[("x-deny", "1")]);
	let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
	exchange.handle(request_headers_msg(&pairs, true)).await;
	assert!(exchange.short_circuited);

	let response = exchange.handle(response_headers_msg("200", true)).await;
	let common = common_of(&response);
	assert!(common.header_mutation.is_none());
}

#[tokio::test]
async fn condition_evaluation_failure_is_an_internal_error() {
	let (mut exchange, _stores) = exchange_with(vec![ChainEntry {
		spec: spec("guarded", Some("request.method ==")),
		instance: Arc::new(HeaderPolicy),
	}]);

	let pairs = base_request_headers(&[]);
	let pairs: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
	let response = exchange.handle(request_headers_msg(&pairs, true)).await;

	let Some(processing_response::Response::ImmediateResponse(immediate)) = &response.response else {
		panic!("expected an internal-error immediate response");
	};
	assert_eq!(immediate.status.as_ref().unwrap().code, 500);
	assert!(exchange.finished);
}
