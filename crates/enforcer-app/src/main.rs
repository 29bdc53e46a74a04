use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use enforcer::auth::{AuthState, protect};
use enforcer::conditions::CelEvaluator;
use enforcer::config::Config;
use enforcer::exec::ChainExecutor;
use enforcer::ext_proc::ExtProcService;
use enforcer::policy::registry::PolicyRegistry;
use enforcer::store::Stores;
use enforcer::xds::client::AdsClient;
use enforcer::xds::handlers::{ApiKeyHandler, LazyResourceHandler, PolicyChainHandler};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "enforcer", about = "API gateway policy engine")]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: Option<PathBuf>,

	/// Log filter, e.g. "info,enforcer=debug". Overrides RUST_LOG.
	#[arg(long)]
	log_filter: Option<String>,
}

#[derive(Clone)]
struct AdminState {
	stores: Stores,
	xds_enabled: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	init_logging(args.log_filter.as_deref());

	let config = match &args.config {
		Some(path) => {
			let contents = std::fs::read_to_string(path)
				.with_context(|| format!("reading config {}", path.display()))?;
			Config::from_yaml(&contents)?
		},
		None => Config::from_raw(Default::default())?,
	};

	let stores = Stores::new();
	// Policy implementations are registered here by the deployment before
	// the first snapshot referencing them arrives; unknown policies NACK.
	let registry = PolicyRegistry::new();
	let executor = Arc::new(ChainExecutor::new(Arc::new(CelEvaluator::new())));

	let ads = match config.xds.clone() {
		Some(xds_config) => {
			let client = AdsClient::new(
				xds_config,
				vec![
					Arc::new(PolicyChainHandler::new(
						registry.clone(),
						stores.snapshot.clone(),
					)),
					Arc::new(ApiKeyHandler::new(stores.api_keys.clone())),
					Arc::new(LazyResourceHandler::new(stores.lazy.clone())),
				],
			)?;
			let runner = client.clone();
			tokio::spawn(async move { runner.run().await });
			Some(client)
		},
		None => None,
	};

	if let Some(addr) = config.admin_addr {
		// Bearer misconfiguration fails here, before anything serves.
		let auth_state = AuthState::new(config.auth.clone()).await?;
		let state = AdminState {
			stores: stores.clone(),
			xds_enabled: ads.is_some(),
		};
		let router = protect(admin_router(state), auth_state);
		let listener = tokio::net::TcpListener::bind(addr).await?;
		info!(%addr, "serving admin API");
		tokio::spawn(async move {
			if let Err(err) = axum::serve(listener, router)
				.with_graceful_shutdown(shutdown_signal())
				.await
			{
				error!(error = %err, "admin server failed");
			}
		});
	}

	let service = ExtProcService::new(stores, executor, config.ext_proc.clone());
	info!(addr = %config.ext_proc_addr, "serving ext_proc");
	tonic::transport::Server::builder()
		.add_service(service.into_server())
		.serve_with_shutdown(config.ext_proc_addr, shutdown_signal())
		.await?;

	if let Some(ads) = ads {
		ads.stop();
	}
	info!("shutdown complete");
	Ok(())
}

fn admin_router(state: AdminState) -> Router {
	Router::new()
		.route("/healthz", get(|| async { "ok" }))
		.route("/readyz", get(readyz))
		.route("/config/policies", get(policies))
		.route("/config/apikeys/count", get(api_key_count))
		.with_state(state)
}

async fn readyz(State(state): State<AdminState>) -> (StatusCode, &'static str) {
	// Ready once the first snapshot lands, or immediately when running
	// without a control plane.
	if !state.xds_enabled || state.stores.snapshot.installed() {
		(StatusCode::OK, "ready")
	} else {
		(StatusCode::SERVICE_UNAVAILABLE, "waiting for configuration")
	}
}

async fn policies(State(state): State<AdminState>) -> Json<serde_json::Value> {
	let snapshot = state.stores.snapshot.current();
	let routes: serde_json::Map<String, serde_json::Value> = snapshot
		.routes
		.iter()
		.map(|(route, chain)| {
			let policies: Vec<String> = chain.entries.iter().map(|e| e.spec.key()).collect();
			(route.clone(), serde_json::json!(policies))
		})
		.collect();
	Json(serde_json::json!({
		"version": snapshot.version,
		"routes": routes,
	}))
}

async fn api_key_count(State(state): State<AdminState>) -> Json<serde_json::Value> {
	Json(serde_json::json!({ "count": state.stores.api_keys.count() }))
}

fn init_logging(filter: Option<&str>) {
	use tracing_subscriber::EnvFilter;
	let filter = match filter {
		Some(directives) => EnvFilter::new(directives),
		None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
	};
	tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
	let ctrl_c = tokio::signal::ctrl_c();
	#[cfg(unix)]
	{
		let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler");
		tokio::select! {
			_ = ctrl_c => {},
			_ = term.recv() => {},
		}
	}
	#[cfg(not(unix))]
	{
		let _ = ctrl_c.await;
	}
}
