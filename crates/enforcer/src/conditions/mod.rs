use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cel::{Context, Program, Value};
use parking_lot::RwLock;
use serde::Serialize;

use crate::exec::context::{RequestContext, ResponseContext};


#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("parse: {0}")]
	Parse(String),
	#[error("execution: {0}")]
	Execution(String),
	#[error("expression did not evaluate to a boolean")]
	NotBoolean,
	#[error("variable: {0}")]
	Variable(String),
}

/// Evaluates per-policy guard expressions against the live context. The
/// expression language is a pluggable dependency of the executor; only the
/// boolean outcome matters.
pub trait ConditionEvaluator: Send + Sync {
	fn evaluate_request(&self, expression: &str, ctx: &RequestContext) -> Result<bool, Error>;
	fn evaluate_response(&self, expression: &str, ctx: &ResponseContext) -> Result<bool, Error>;
}

#[derive(Serialize)]
struct ApiView<'a> {
	id: &'a str,
	name: &'a str,
	version: &'a str,
	context: &'a str,
}

#[derive(Serialize)]
struct RequestView<'a> {
	method: &'a str,
	path: &'a str,
	authority: &'a str,
	scheme: &'a str,
	headers: BTreeMap<String, String>,
	api: ApiView<'a>,
}

#[derive(Serialize)]
struct ResponseView {
	status: u16,
	headers: BTreeMap<String, String>,
}

fn header_view(headers: &http::HeaderMap) -> BTreeMap<String, String> {
	let mut view = BTreeMap::new();
	for (name, value) in headers {
		if let Ok(v) = value.to_str() {
			// First value wins; guards rarely care about repeats.
			view.entry(name.as_str().to_string()).or_insert_with(|| v.to_string());
		}
	}
	view
}

/// CEL-backed evaluator. Compiled programs are cached keyed by source string,
/// so repeated requests over the same chain compile each guard once.
#[derive(Default)]
pub struct CelEvaluator {
	programs: RwLock<HashMap<String, Arc<Program>>>,
}

impl CelEvaluator {
	pub fn new() -> Self {
		Self::default()
	}

	fn compile(&self, expression: &str) -> Result<Arc<Program>, Error> {
		if let Some(program) = self.programs.read().get(expression) {
			return Ok(program.clone());
		}
		let program = Program::compile(expression).map_err(|e| Error::Parse(e.to_string()))?;
		let program = Arc::new(program);
		self
			.programs
			.write()
			.insert(expression.to_string(), program.clone());
		Ok(program)
	}

	fn run(&self, expression: &str, ctx: Context) -> Result<bool, Error> {
		let program = self.compile(expression)?;
		match program.execute(&ctx) {
			Ok(Value::Bool(b)) => Ok(b),
			Ok(_) => Err(Error::NotBoolean),
			Err(e) => Err(Error::Execution(e.to_string())),
		}
	}
}

impl ConditionEvaluator for CelEvaluator {
	fn evaluate_request(&self, expression: &str, ctx: &RequestContext) -> Result<bool, Error> {
		let mut cel_ctx = Context::default();
		cel_ctx
			.add_variable(
				"request",
				RequestView {
					method: &ctx.method,
					path: &ctx.path,
					authority: &ctx.authority,
					scheme: &ctx.scheme,
					headers: header_view(&ctx.headers),
					api: ApiView {
						id: &ctx.route.api_id,
						name: &ctx.route.api_name,
						version: &ctx.route.api_version,
						context: &ctx.route.api_context,
					},
				},
			)
			.map_err(|e| Error::Variable(e.to_string()))?;
		cel_ctx
			.add_variable("metadata", &ctx.metadata)
			.map_err(|e| Error::Variable(e.to_string()))?;
		self.run(expression, cel_ctx)
	}

	fn evaluate_response(&self, expression: &str, ctx: &ResponseContext) -> Result<bool, Error> {
		let mut cel_ctx = Context::default();
		cel_ctx
			.add_variable(
				"response",
				ResponseView {
					status: ctx.status,
					headers: header_view(&ctx.headers),
				},
			)
			.map_err(|e| Error::Variable(e.to_string()))?;
		cel_ctx
			.add_variable(
				"request",
				RequestView {
					method: &ctx.request_method,
					path: &ctx.request_path,
					authority: "",
					scheme: "",
					headers: header_view(&ctx.request_headers),
					api: ApiView {
						id: &ctx.route.api_id,
						name: &ctx.route.api_name,
						version: &ctx.route.api_version,
						context: &ctx.route.api_context,
					},
				},
			)
			.map_err(|e| Error::Variable(e.to_string()))?;
		cel_ctx
			.add_variable("metadata", &ctx.metadata)
			.map_err(|e| Error::Variable(e.to_string()))?;
		self.run(expression, cel_ctx)
	}
}
