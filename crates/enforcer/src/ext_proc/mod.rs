use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use envoy_types::pb::envoy::config::core::v3::{
	HeaderValue as ProtoHeaderValue, HeaderValueOption, header_value_option::HeaderAppendAction,
};
use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::{
	ProcessingMode as ProtoProcessingMode, processing_mode,
};
use envoy_types::pb::envoy::r#type::v3::HttpStatus;
use envoy_types::pb::envoy::service::ext_proc::v3::external_processor_server::{
	ExternalProcessor, ExternalProcessorServer,
};
use envoy_types::pb::envoy::service::ext_proc::v3::{
	BodyMutation, BodyResponse, CommonResponse, HeaderMutation, HeadersResponse, HttpBody,
	HttpHeaders, ImmediateResponse as ProtoImmediateResponse, ProcessingRequest, ProcessingResponse,
	TrailersResponse, body_mutation, common_response, processing_request, processing_response,
};
use futures::Stream;
use http::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};

use crate::exec::context::{BodyState, MutationLog, RequestContext, ResponseContext};
use crate::exec::{ChainExecutor, RouteChain};
use crate::policy::ImmediateResponse;
use crate::store::Stores;

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;

/// Attribute namespace Envoy uses for ext_proc request attributes.
const ATTRIBUTES_NAMESPACE: &str = "envoy.filters.http.ext_proc";
const ROUTE_NAME_ATTRIBUTE: &str = "xds.route_name";

#[derive(Clone, Debug)]
pub struct ExtProcConfig {
	/// Fallback header naming the route when the proxy does not send
	/// attributes.
	pub route_header: String,
	/// Whether per-policy guard expressions are evaluated.
	pub with_conditions: bool,
	/// Budget for one phase of chain execution.
	pub phase_timeout: Duration,
}

impl Default for ExtProcConfig {
	fn default() -> Self {
		Self {
			route_header: "x-enforcer-route".to_string(),
			with_conditions: true,
			phase_timeout: Duration::from_secs(10),
		}
	}
}

/// The proxy-facing server: one bidirectional stream per HTTP exchange. Each
/// phase message is answered with the chain's mutations, or short-circuited
/// with an immediate response.
#[derive(Clone)]
pub struct ExtProcService {
	stores: Stores,
	executor: Arc<ChainExecutor>,
	config: Arc<ExtProcConfig>,
}

impl ExtProcService {
	pub fn new(stores: Stores, executor: Arc<ChainExecutor>, config: ExtProcConfig) -> Self {
		Self {
			stores,
			executor,
			config: Arc::new(config),
		}
	}

	pub fn into_server(self) -> ExternalProcessorServer<Self> {
		ExternalProcessorServer::new(self)
	}
}

#[tonic::async_trait]
impl ExternalProcessor for ExtProcService {
	type ProcessStream = Pin<Box<dyn Stream<Item = Result<ProcessingResponse, Status>> + Send>>;

	async fn process(
		&self,
		request: Request<Streaming<ProcessingRequest>>,
	) -> Result<Response<Self::ProcessStream>, Status> {
		let mut inbound = request.into_inner();
		let (tx, rx) = mpsc::channel(16);
		let mut exchange = Exchange::new(
			self.stores.clone(),
			self.executor.clone(),
			self.config.clone(),
		);

		tokio::spawn(async move {
			loop {
				let msg = match inbound.message().await {
					Ok(Some(msg)) => msg,
					Ok(None) => break,
					Err(err) => {
						debug!(error = %err, "ext_proc stream receive failed");
						break;
					},
				};
				let response = exchange.handle(msg).await;
				// Backpressure: if the proxy stream's outbound queue is full
				// we wait, never drop.
				if tx.send(Ok(response)).await.is_err() {
					break;
				}
				if exchange.finished {
					break;
				}
			}
		});
		Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
	}
}

/// Per-stream state machine across the four phase messages.
struct Exchange {
	stores: Stores,
	executor: Arc<ChainExecutor>,
	config: Arc<ExtProcConfig>,

	chain: Option<Arc<RouteChain>>,
	request_ctx: Option<RequestContext>,
	response_ctx: Option<ResponseContext>,
	buffered_body: Vec<u8>,
	awaiting_request_body: bool,
	awaiting_response_body: bool,
	short_circuited: bool,
	finished: bool,
}

impl Exchange {
	fn new(stores: Stores, executor: Arc<ChainExecutor>, config: Arc<ExtProcConfig>) -> Self {
		Self {
			stores,
			executor,
			config,
			chain: None,
			request_ctx: None,
			response_ctx: None,
			buffered_body: Vec::new(),
			awaiting_request_body: false,
			awaiting_response_body: false,
			short_circuited: false,
			finished: false,
		}
	}

	async fn handle(&mut self, msg: ProcessingRequest) -> ProcessingResponse {
		// Envoy names the matched route in the ext_proc attribute namespace
		// when asked to; a plain header is the fallback.
		let route_hint = msg
			.attributes
			.get(ATTRIBUTES_NAMESPACE)
			.and_then(|attrs| attrs.fields.get(ROUTE_NAME_ATTRIBUTE))
			.and_then(|value| match &value.kind {
				Some(envoy_types::pb::google::protobuf::value::Kind::StringValue(route)) => Some(route.clone()),
				_ => None,
			});
		match msg.request {
			Some(processing_request::Request::RequestHeaders(headers)) => {
				self.on_request_headers(headers, route_hint).await
			},
			Some(processing_request::Request::RequestBody(body)) => self.on_request_body(body).await,
			Some(processing_request::Request::ResponseHeaders(headers)) => {
				self.on_response_headers(headers).await
			},
			Some(processing_request::Request::ResponseBody(body)) => self.on_response_body(body).await,
			Some(processing_request::Request::RequestTrailers(_)) => trailers_response(true),
			Some(processing_request::Request::ResponseTrailers(_)) => trailers_response(false),
			None => headers_response(CommonResponse::default(), true),
		}
	}

	async fn on_request_headers(
		&mut self,
		msg: HttpHeaders,
		route_hint: Option<String>,
	) -> ProcessingResponse {
		let (headers, pseudo) = decode_headers(msg.headers.as_ref());
		let route_id = route_hint.or_else(|| {
			headers
				.get(self.config.route_header.as_str())
				.and_then(|v| v.to_str().ok())
				.map(str::to_string)
		});
		let Some(chain) = route_id.as_deref().and_then(|r| self.stores.snapshot.chain(r)) else {
			debug!(route = ?route_id, "no policy chain for route; passing through");
			return headers_response(CommonResponse::default(), true);
		};

		let request_id = headers
			.get("x-request-id")
			.and_then(|v| v.to_str().ok())
			.map(str::to_string)
			.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
		let mut ctx = RequestContext::new(
			request_id,
			chain.route.clone(),
			pseudo.method,
			pseudo.path,
			pseudo.authority,
			pseudo.scheme,
			headers,
		);

		if chain.wants_request_body() && !msg.end_of_stream {
			// Defer execution until the buffered body arrives; header
			// mutations will ride on the body response.
			self.chain = Some(chain);
			self.request_ctx = Some(ctx);
			self.awaiting_request_body = true;
			return ProcessingResponse {
				mode_override: Some(ProtoProcessingMode {
					request_body_mode: processing_mode::BodySendMode::Buffered as i32,
					..Default::default()
				}),
				..headers_response(CommonResponse::default(), true)
			};
		}

		let response = self.run_request_phase(&chain, &mut ctx, true).await;
		self.chain = Some(chain);
		self.request_ctx = Some(ctx);
		response
	}

	async fn on_request_body(&mut self, msg: HttpBody) -> ProcessingResponse {
		if self.finished || !self.awaiting_request_body {
			return body_response(CommonResponse::default(), true);
		}
		self.buffered_body.extend_from_slice(&msg.body);
		if !msg.end_of_stream {
			return body_response(CommonResponse::default(), true);
		}
		self.awaiting_request_body = false;

		let chain = self.chain.clone().expect("chain set when awaiting body");
		let mut ctx = self.request_ctx.take().expect("request context set");
		let data = Bytes::from(std::mem::take(&mut self.buffered_body));
		ctx.body = Some(BodyState {
			present: !data.is_empty(),
			data,
			end_of_stream: true,
		});

		let response = self.run_request_phase(&chain, &mut ctx, false).await;
		self.request_ctx = Some(ctx);
		response
	}

	async fn run_request_phase(
		&mut self,
		chain: &RouteChain,
		ctx: &mut RequestContext,
		header_phase: bool,
	) -> ProcessingResponse {
		let started = std::time::Instant::now();
		let outcome = tokio::time::timeout(
			self.config.phase_timeout,
			self
				.executor
				.execute_request_phase(chain, ctx, self.config.with_conditions),
		)
		.await;

		let outcome = match outcome {
			Ok(Ok(outcome)) => outcome,
			Ok(Err(err)) => {
				warn!(route = %chain.route.route_name, error = %err, "request phase failed");
				self.finished = true;
				return internal_error_response();
			},
			Err(_) => {
				warn!(route = %chain.route.route_name, "request phase deadline exceeded");
				self.finished = true;
				return internal_error_response();
			},
		};
		info!(
			route = %chain.route.route_name,
			request_id = %ctx.request_id,
			policies = outcome.results.len(),
			short_circuited = outcome.short_circuited,
			duration_ms = started.elapsed().as_millis() as u64,
			"request phase complete"
		);

		if outcome.short_circuited {
			self.short_circuited = true;
			self.finished = true;
			let action = outcome.final_action.expect("short circuit carries an action");
			return immediate_response(&action);
		}

		let common = common_from_log(ctx.take_mutations());
		if header_phase {
			headers_response(common, true)
		} else {
			body_response(common, true)
		}
	}

	async fn on_response_headers(&mut self, msg: HttpHeaders) -> ProcessingResponse {
		// A request-phase immediate response skips the response chain.
		if self.short_circuited {
			return headers_response(CommonResponse::default(), false);
		}
		let (Some(chain), Some(request_ctx)) = (self.chain.clone(), self.request_ctx.as_ref()) else {
			return headers_response(CommonResponse::default(), false);
		};

		let (headers, pseudo) = decode_headers(msg.headers.as_ref());
		let status = pseudo.status.unwrap_or(200);
		let mut ctx = ResponseContext::from_request(request_ctx, status, headers);

		if chain.wants_response_body() && !msg.end_of_stream {
			self.response_ctx = Some(ctx);
			self.awaiting_response_body = true;
			return ProcessingResponse {
				mode_override: Some(ProtoProcessingMode {
					response_body_mode: processing_mode::BodySendMode::Buffered as i32,
					..Default::default()
				}),
				..headers_response(CommonResponse::default(), false)
			};
		}

		let response = self.run_response_phase(&chain, &mut ctx, true).await;
		self.response_ctx = Some(ctx);
		response
	}

	async fn on_response_body(&mut self, msg: HttpBody) -> ProcessingResponse {
		if self.finished || !self.awaiting_response_body {
			return body_response(CommonResponse::default(), false);
		}
		self.buffered_body.extend_from_slice(&msg.body);
		if !msg.end_of_stream {
			return body_response(CommonResponse::default(), false);
		}
		self.awaiting_response_body = false;

		let chain = self.chain.clone().expect("chain set when awaiting body");
		let mut ctx = self.response_ctx.take().expect("response context set");
		let data = Bytes::from(std::mem::take(&mut self.buffered_body));
		ctx.body = Some(BodyState {
			present: !data.is_empty(),
			data,
			end_of_stream: true,
		});

		let response = self.run_response_phase(&chain, &mut ctx, false).await;
		self.response_ctx = Some(ctx);
		response
	}

	async fn run_response_phase(
		&mut self,
		chain: &RouteChain,
		ctx: &mut ResponseContext,
		header_phase: bool,
	) -> ProcessingResponse {
		let started = std::time::Instant::now();
		let outcome = tokio::time::timeout(
			self.config.phase_timeout,
			self
				.executor
				.execute_response_phase(chain, ctx, self.config.with_conditions),
		)
		.await;

		let outcome = match outcome {
			Ok(Ok(outcome)) => outcome,
			Ok(Err(err)) => {
				warn!(route = %chain.route.route_name, error = %err, "response phase failed");
				self.finished = true;
				return internal_error_response();
			},
			Err(_) => {
				warn!(route = %chain.route.route_name, "response phase deadline exceeded");
				self.finished = true;
				return internal_error_response();
			},
		};
		info!(
			route = %chain.route.route_name,
			request_id = %ctx.request_id,
			policies = outcome.results.len(),
			duration_ms = started.elapsed().as_millis() as u64,
			"response phase complete"
		);

		let common = common_from_log(ctx.take_mutations());
		if header_phase {
			headers_response(common, false)
		} else {
			body_response(common, false)
		}
	}
}

// -- wire translation --------------------------------------------------------

#[derive(Default)]
struct PseudoHeaders {
	method: String,
	path: String,
	authority: String,
	scheme: String,
	status: Option<u16>,
}

fn decode_headers(
	map: Option<&envoy_types::pb::envoy::config::core::v3::HeaderMap>,
) -> (HeaderMap, PseudoHeaders) {
	let mut headers = HeaderMap::new();
	let mut pseudo = PseudoHeaders::default();
	for hv in map.iter().flat_map(|m| m.headers.iter()) {
		let value = if hv.raw_value.is_empty() {
			hv.value.clone()
		} else {
			String::from_utf8_lossy(&hv.raw_value).into_owned()
		};
		match hv.key.as_str() {
			":method" => pseudo.method = value,
			":path" => pseudo.path = value,
			":authority" => pseudo.authority = value,
			":scheme" => pseudo.scheme = value,
			":status" => pseudo.status = value.parse().ok(),
			key if !key.starts_with(':') => {
				if let (Ok(name), Ok(value)) =
					(HeaderName::try_from(key), HeaderValue::try_from(value.as_str()))
				{
					headers.append(name, value);
				}
			},
			_ => {},
		}
	}
	(headers, pseudo)
}

fn proto_header(key: &str, value: &[u8]) -> ProtoHeaderValue {
	ProtoHeaderValue {
		key: key.to_string(),
		value: String::new(),
		raw_value: value.to_vec(),
	}
}

fn header_option(key: &str, value: &[u8], action: HeaderAppendAction) -> HeaderValueOption {
	HeaderValueOption {
		header: Some(proto_header(key, value)),
		append_action: action as i32,
		..Default::default()
	}
}

fn mutation_from_log(log: &MutationLog) -> Option<HeaderMutation> {
	let mut set_headers = Vec::new();
	for (name, value) in &log.set_headers {
		set_headers.push(header_option(
			name.as_str(),
			value.as_bytes(),
			HeaderAppendAction::OverwriteIfExistsOrAdd,
		));
	}
	for (name, value) in &log.append_headers {
		set_headers.push(header_option(
			name.as_str(),
			value.as_bytes(),
			HeaderAppendAction::AppendIfExistsOrAdd,
		));
	}
	// Path, method, and status replacements travel as pseudo-header writes.
	if let Some(path) = &log.path {
		set_headers.push(header_option(
			":path",
			path.as_bytes(),
			HeaderAppendAction::OverwriteIfExistsOrAdd,
		));
	}
	if let Some(method) = &log.method {
		set_headers.push(header_option(
			":method",
			method.as_bytes(),
			HeaderAppendAction::OverwriteIfExistsOrAdd,
		));
	}
	if let Some(status) = log.status {
		set_headers.push(header_option(
			":status",
			status.to_string().as_bytes(),
			HeaderAppendAction::OverwriteIfExistsOrAdd,
		));
	}
	let remove_headers: Vec<String> = log
		.remove_headers
		.iter()
		.map(|name| name.as_str().to_string())
		.collect();

	if set_headers.is_empty() && remove_headers.is_empty() {
		None
	} else {
		Some(HeaderMutation {
			set_headers,
			remove_headers,
		})
	}
}

fn common_from_log(log: MutationLog) -> CommonResponse {
	let header_mutation = mutation_from_log(&log);
	let (status, body_mutation) = match log.body {
		Some(body) => (
			common_response::ResponseStatus::ContinueAndReplace,
			Some(BodyMutation {
				mutation: Some(body_mutation::Mutation::Body(body.to_vec())),
			}),
		),
		None => (common_response::ResponseStatus::Continue, None),
	};
	CommonResponse {
		status: status as i32,
		header_mutation,
		body_mutation,
		..Default::default()
	}
}

fn headers_response(common: CommonResponse, request_phase: bool) -> ProcessingResponse {
	let inner = HeadersResponse {
		response: Some(common),
	};
	let response = if request_phase {
		processing_response::Response::RequestHeaders(inner)
	} else {
		processing_response::Response::ResponseHeaders(inner)
	};
	ProcessingResponse {
		response: Some(response),
		..Default::default()
	}
}

fn body_response(common: CommonResponse, request_phase: bool) -> ProcessingResponse {
	let inner = BodyResponse {
		response: Some(common),
	};
	let response = if request_phase {
		processing_response::Response::RequestBody(inner)
	} else {
		processing_response::Response::ResponseBody(inner)
	};
	ProcessingResponse {
		response: Some(response),
		..Default::default()
	}
}

fn trailers_response(request_phase: bool) -> ProcessingResponse {
	let inner = TrailersResponse::default();
	let response = if request_phase {
		processing_response::Response::RequestTrailers(inner)
	} else {
		processing_response::Response::ResponseTrailers(inner)
	};
	ProcessingResponse {
		response: Some(response),
		..Default::default()
	}
}

fn immediate_response(action: &ImmediateResponse) -> ProcessingResponse {
	let headers = if action.headers.is_empty() {
		None
	} else {
		Some(HeaderMutation {
			set_headers: action
				.headers
				.iter()
				.map(|(k, v)| header_option(k, v.as_bytes(), HeaderAppendAction::OverwriteIfExistsOrAdd))
				.collect(),
			remove_headers: Vec::new(),
		})
	};
	ProcessingResponse {
		response: Some(processing_response::Response::ImmediateResponse(
			ProtoImmediateResponse {
				status: Some(HttpStatus {
					code: action.status as i32,
				}),
				headers,
				body: action.body.clone().into(),
				..Default::default()
			},
		)),
		..Default::default()
	}
}

fn internal_error_response() -> ProcessingResponse {
	immediate_response(&ImmediateResponse::new(
		500,
		"{\"error\":\"internal server error\"}",
	))
}
