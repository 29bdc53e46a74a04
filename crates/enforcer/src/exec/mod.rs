use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use http::{HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::conditions::ConditionEvaluator;
use crate::policy::{
	ImmediateResponse, Policy, PolicySpec, RequestAction, ResponseAction, RouteMetadata,
	UpstreamRequestModifications, UpstreamResponseModifications,
};

pub mod context;

use context::{BodyState, RequestContext, ResponseContext};

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;

#[derive(thiserror::Error, Debug)]
pub enum Error {
	/// Condition evaluation failures are fatal to the phase; everything else
	/// in-chain is recovered locally.
	#[error("condition evaluation failed for {policy}: {source}")]
	Condition {
		policy: String,
		#[source]
		source: crate::conditions::Error,
	},
}

/// A route's resolved chain: specs paired with the instances the registry
/// built for them. Immutable once installed in a snapshot.
#[derive(Clone)]
pub struct RouteChain {
	pub route: Arc<RouteMetadata>,
	pub entries: Vec<ChainEntry>,
}

#[derive(Clone)]
pub struct ChainEntry {
	pub spec: Arc<PolicySpec>,
	pub instance: Arc<dyn Policy>,
}

impl RouteChain {
	pub fn new(route: RouteMetadata, entries: Vec<ChainEntry>) -> Self {
		Self {
			route: Arc::new(route),
			entries,
		}
	}

	/// Whether any enabled policy asks for the request body to be
	/// materialized.
	pub fn wants_request_body(&self) -> bool {
		self
			.entries
			.iter()
			.any(|e| e.spec.enabled && e.instance.mode().wants_request_body())
	}

	pub fn wants_response_body(&self) -> bool {
		self
			.entries
			.iter()
			.any(|e| e.spec.enabled && e.instance.mode().wants_response_body())
	}
}

impl std::fmt::Debug for RouteChain {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RouteChain")
			.field("route", &self.route.route_name)
			.field("policies", &self.entries.iter().map(|e| e.spec.key()).collect::<Vec<_>>())
			.finish()
	}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SkipReason {
	Disabled,
	Condition,
	Mode,
}

#[derive(Clone, Debug)]
pub enum PolicyOutcome {
	/// The action (if any) was applied and the chain moved on.
	Applied,
	PassThrough,
	Skipped(SkipReason),
	/// The policy returned an error or panicked; treated as pass-through.
	Failed(String),
	/// The policy returned an immediate response, ending the chain.
	ShortCircuited,
}

#[derive(Clone, Debug)]
pub struct PolicyRunResult {
	pub name: String,
	pub version: String,
	pub outcome: PolicyOutcome,
}

impl PolicyRunResult {
	fn new(spec: &PolicySpec, outcome: PolicyOutcome) -> Self {
		Self {
			name: spec.name.clone(),
			version: spec.version.clone(),
			outcome,
		}
	}

	pub fn skipped(&self) -> bool {
		matches!(self.outcome, PolicyOutcome::Skipped(_))
	}
}

#[derive(Debug, Default)]
pub struct RequestPhaseOutcome {
	pub results: Vec<PolicyRunResult>,
	pub short_circuited: bool,
	pub final_action: Option<ImmediateResponse>,
}

#[derive(Debug, Default)]
pub struct ResponsePhaseOutcome {
	pub results: Vec<PolicyRunResult>,
}

/// The hot path: runs an ordered policy list against one HTTP exchange.
/// Request-phase policies run in spec order; the response phase visits them
/// in reverse, so the first policy to touch the request is the last to touch
/// the response.
pub struct ChainExecutor {
	evaluator: Arc<dyn ConditionEvaluator>,
}

impl ChainExecutor {
	pub fn new(evaluator: Arc<dyn ConditionEvaluator>) -> Self {
		Self { evaluator }
	}

	pub async fn execute_request_phase(
		&self,
		chain: &RouteChain,
		ctx: &mut RequestContext,
		with_conditions: bool,
	) -> Result<RequestPhaseOutcome, Error> {
		let mut outcome = RequestPhaseOutcome::default();
		for entry in &chain.entries {
			let spec = &entry.spec;
			if !spec.enabled {
				outcome
					.results
					.push(PolicyRunResult::new(spec, PolicyOutcome::Skipped(SkipReason::Disabled)));
				continue;
			}
			if with_conditions && let Some(expr) = &spec.execution_condition {
				let pass = self
					.evaluator
					.evaluate_request(expr, ctx)
					.map_err(|source| Error::Condition {
						policy: spec.key(),
						source,
					})?;
				if !pass {
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Skipped(SkipReason::Condition)));
					continue;
				}
			}
			if entry.instance.mode().skips_request_phase() {
				outcome
					.results
					.push(PolicyRunResult::new(spec, PolicyOutcome::Skipped(SkipReason::Mode)));
				continue;
			}

			let invocation =
				AssertUnwindSafe(entry.instance.on_request(ctx, &spec.parameters)).catch_unwind();
			match invocation.await {
				Ok(Ok(None)) => {
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::PassThrough));
				},
				Ok(Ok(Some(RequestAction::Modifications(mods)))) => {
					apply_request_modifications(ctx, &mods);
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Applied));
				},
				Ok(Ok(Some(RequestAction::DirectResponse(resp)))) => {
					debug!(policy = %spec.key(), status = resp.status, "request chain short-circuited");
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::ShortCircuited));
					outcome.short_circuited = true;
					outcome.final_action = Some(resp);
					break;
				},
				Ok(Err(err)) => {
					warn!(policy = %spec.key(), error = %err, "policy request handler failed");
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Failed(err.to_string())));
				},
				Err(panic) => {
					let msg = panic_message(panic);
					warn!(policy = %spec.key(), panic = %msg, "policy request handler panicked");
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Failed(msg)));
				},
			}
		}
		Ok(outcome)
	}

	pub async fn execute_response_phase(
		&self,
		chain: &RouteChain,
		ctx: &mut ResponseContext,
		with_conditions: bool,
	) -> Result<ResponsePhaseOutcome, Error> {
		let mut outcome = ResponsePhaseOutcome::default();
		for entry in chain.entries.iter().rev() {
			let spec = &entry.spec;
			if !spec.enabled {
				outcome
					.results
					.push(PolicyRunResult::new(spec, PolicyOutcome::Skipped(SkipReason::Disabled)));
				continue;
			}
			if with_conditions && let Some(expr) = &spec.execution_condition {
				let pass = self
					.evaluator
					.evaluate_response(expr, ctx)
					.map_err(|source| Error::Condition {
						policy: spec.key(),
						source,
					})?;
				if !pass {
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Skipped(SkipReason::Condition)));
					continue;
				}
			}
			if entry.instance.mode().skips_response_phase() {
				outcome
					.results
					.push(PolicyRunResult::new(spec, PolicyOutcome::Skipped(SkipReason::Mode)));
				continue;
			}

			let invocation =
				AssertUnwindSafe(entry.instance.on_response(ctx, &spec.parameters)).catch_unwind();
			match invocation.await {
				Ok(Ok(None)) => {
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::PassThrough));
				},
				Ok(Ok(Some(ResponseAction::Modifications(mods)))) => {
					apply_response_modifications(ctx, &mods);
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Applied));
				},
				Ok(Err(err)) => {
					warn!(policy = %spec.key(), error = %err, "policy response handler failed");
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Failed(err.to_string())));
				},
				Err(panic) => {
					let msg = panic_message(panic);
					warn!(policy = %spec.key(), panic = %msg, "policy response handler panicked");
					outcome
						.results
						.push(PolicyRunResult::new(spec, PolicyOutcome::Failed(msg)));
				},
			}
		}
		Ok(outcome)
	}
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
	if let Some(s) = panic.downcast_ref::<&str>() {
		(*s).to_string()
	} else if let Some(s) = panic.downcast_ref::<String>() {
		s.clone()
	} else {
		"policy panicked".to_string()
	}
}

fn parse_header(key: &str, value: &str) -> Option<(HeaderName, HeaderValue)> {
	let name = match HeaderName::try_from(key) {
		Ok(n) => n,
		Err(_) => {
			warn!(header = key, "ignoring invalid header name from policy action");
			return None;
		},
	};
	let value = match HeaderValue::try_from(value) {
		Ok(v) => v,
		Err(_) => {
			warn!(header = key, "ignoring invalid header value from policy action");
			return None;
		},
	};
	Some((name, value))
}

/// Applies request modifications to the context. Application is pure
/// structure mutation and cannot fail; invalid header names/values are
/// dropped with a warning. Applied deltas are recorded in the context's
/// mutation log for the proxy-facing layer.
pub fn apply_request_modifications(ctx: &mut RequestContext, mods: &UpstreamRequestModifications) {
	for key in &mods.remove_headers {
		if let Ok(name) = HeaderName::try_from(key.as_str()) {
			ctx.headers.remove(&name);
			ctx.mutations.remove_headers.push(name);
		}
	}
	for (key, value) in &mods.set_headers {
		if let Some((name, value)) = parse_header(key, value) {
			ctx.headers.insert(name.clone(), value.clone());
			ctx.mutations.set_headers.push((name, value));
		}
	}
	for (key, value) in &mods.append_headers {
		if let Some((name, value)) = parse_header(key, value) {
			ctx.headers.append(name.clone(), value.clone());
			ctx.mutations.append_headers.push((name, value));
		}
	}

	if !mods.add_query_parameters.is_empty() || !mods.remove_query_parameters.is_empty() {
		let path = edit_query(
			&ctx.path,
			&mods.add_query_parameters,
			&mods.remove_query_parameters,
		);
		if path != ctx.path {
			ctx.path = path.clone();
			ctx.mutations.path = Some(path);
		}
	}
	if let Some(path) = &mods.path {
		ctx.path = path.clone();
		ctx.mutations.path = Some(path.clone());
	}
	if let Some(method) = &mods.method {
		ctx.method = method.clone();
		ctx.mutations.method = Some(method.clone());
	}
	if let Some(body) = &mods.body {
		// Zero-length replacement still means "present, empty".
		ctx.body = Some(BodyState::full(body.clone()));
		ctx.mutations.body = Some(body.clone());
	}
	if !mods.analytics_metadata.is_empty() {
		for (k, v) in &mods.analytics_metadata {
			ctx.metadata.insert(k.clone(), v.clone());
		}
	}
	for dropped in &mods.drop_analytics_headers {
		ctx.metadata.remove(dropped);
	}
}

pub fn apply_response_modifications(ctx: &mut ResponseContext, mods: &UpstreamResponseModifications) {
	for key in &mods.remove_headers {
		if let Ok(name) = HeaderName::try_from(key.as_str()) {
			ctx.headers.remove(&name);
			ctx.mutations.remove_headers.push(name);
		}
	}
	for (key, value) in &mods.set_headers {
		if let Some((name, value)) = parse_header(key, value) {
			ctx.headers.insert(name.clone(), value.clone());
			ctx.mutations.set_headers.push((name, value));
		}
	}
	for (key, value) in &mods.append_headers {
		if let Some((name, value)) = parse_header(key, value) {
			ctx.headers.append(name.clone(), value.clone());
			ctx.mutations.append_headers.push((name, value));
		}
	}
	if let Some(status) = mods.status_code {
		ctx.status = status;
		ctx.mutations.status = Some(status);
	}
	if let Some(body) = &mods.body {
		ctx.body = Some(BodyState::full(body.clone()));
		ctx.mutations.body = Some(body.clone());
	}
}

/// Re-serializes the query substring of `path`. Retained parameters keep
/// their relative order; additions land after them in the order the action
/// listed them.
fn edit_query(path: &str, add: &[(String, String)], remove: &[String]) -> String {
	let (base, query) = match path.split_once('?') {
		Some((base, query)) => (base, query),
		None => (path, ""),
	};
	let retained = url::form_urlencoded::parse(query.as_bytes())
		.filter(|(k, _)| !remove.iter().any(|r| r == k.as_ref()))
		.map(|(k, v)| (k.into_owned(), v.into_owned()));

	let mut serializer = url::form_urlencoded::Serializer::new(String::new());
	serializer.extend_pairs(retained);
	serializer.extend_pairs(add.iter().map(|(k, v)| (k.as_str(), v.as_str())));
	let query = serializer.finish();

	if query.is_empty() {
		base.to_string()
	} else {
		format!("{base}?{query}")
	}
}
