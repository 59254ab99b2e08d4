pub mod blob;
pub mod cache_manager;
pub mod config;
pub mod copy_worker;
pub mod devops;
pub mod errors;
pub mod fleet;
pub mod observability;
pub mod queue;
pub mod redirect;
pub mod state;
pub mod status_store;
pub mod validator;

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{HeaderName, HeaderValue};
use axum::routing::{delete, get};
use axum::Router;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::sensitive_headers::{
	SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;
use crate::validator::UrlValidator;

/// The name Cloud Mirror registers with the Fleet Controller for pool
/// ids; a single deployment mirrors one logical service.
const SERVICE_NAME: &str = "cloud-mirror";

/// Boots observability, config, the Fleet Controller, and the Redirect
/// Service's HTTP surface, then serves until the process is killed.
pub async fn run() {
	let obs_state = match crate::observability::init_observability().await {
		Ok(s) => s,
		Err(e) => {
			eprintln!("warning: failed to initialize observability: {}", e);
			crate::observability::ObservabilityState::default()
		}
	};

	let settings = match crate::config::load() {
		Ok(s) => s,
		Err(e) => {
			tracing::error!(error = %e, "fatal: invalid configuration");
			std::process::exit(1);
		}
	};

	let metrics = obs_state.metrics.clone();

	let fleet = match crate::fleet::FleetController::build(&settings, SERVICE_NAME, metrics.clone()).await
	{
		Ok(f) => f,
		Err(e) => {
			tracing::error!(error = %e, "fatal: failed to build fleet controller");
			std::process::exit(1);
		}
	};

	let validator = match UrlValidator::new(&settings.allowlist, settings.redirect_limit, settings.ensure_ssl)
	{
		Ok(v) => Arc::new(v),
		Err(e) => {
			tracing::error!(error = %e, "fatal: failed to build url validator");
			std::process::exit(1);
		}
	};

	let pools = fleet
		.groups
		.into_iter()
		.map(|g| (g.pool_id, g.cache_manager))
		.collect::<Vec<_>>();

	let app_state = AppState {
		pools: Arc::new(pools),
		validator,
		metrics: metrics.clone(),
		max_wait_for_cached_copy: Duration::from_millis(settings.max_wait_for_cached_copy_ms),
	};

	let app = Router::new()
		.route(
			"/v1/redirect/:service/:region/:b64url",
			get(crate::redirect::redirect),
		)
		.route(
			"/v1/redirect/:service/:region/:b64url/:err",
			get(crate::redirect::redirect_with_err),
		)
		.route(
			"/v1/purge/:service/:region/:b64url",
			delete(crate::redirect::purge),
		)
		.route(
			"/v1/purge/:service/:region/:b64url/:err",
			delete(crate::redirect::purge_with_err),
		)
		.route("/v1/ping", get(crate::redirect::ping))
		.route("/v1/api-reference", get(crate::redirect::api_reference))
		.route(
			"/metrics",
			get({
				let metrics = metrics.clone();
				move || {
					let metrics = metrics.clone();
					async move { metrics.encode() }
				}
			}),
		)
		.with_state(app_state)
		// Defense-in-depth: normalize paths and add conservative security headers.
		.layer(TraceLayer::new_for_http())
		.layer(NormalizePathLayer::trim_trailing_slash())
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("strict-transport-security"),
			HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("x-frame-options"),
			HeaderValue::from_static("DENY"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("x-content-type-options"),
			HeaderValue::from_static("nosniff"),
		))
		.layer(SetResponseHeaderLayer::if_not_present(
			HeaderName::from_static("referrer-policy"),
			HeaderValue::from_static("strict-origin-when-cross-origin"),
		))
		.layer(crate::devops::SharedRateLimitLayer::new(200, 100))
		.layer(CatchPanicLayer::new())
		.layer(RequestBodyLimitLayer::new(1024))
		.layer(RequestBodyTimeoutLayer::new(Duration::from_secs(30)))
		.layer(SetSensitiveRequestHeadersLayer::from_shared(Arc::from(
			vec![HeaderName::from_static("authorization")].into_boxed_slice(),
		)))
		.layer(SetSensitiveResponseHeadersLayer::from_shared(Arc::from(
			vec![HeaderName::from_static("set-cookie")].into_boxed_slice(),
		)));

	let bind_addr = format!("{}:{}", settings.host, settings.port);
	let listener = match TcpListener::bind(&bind_addr).await {
		Ok(l) => l,
		Err(e) => {
			tracing::error!(error = %e, addr = %bind_addr, "fatal: failed to bind");
			std::process::exit(1);
		}
	};

	tracing::info!(addr = %bind_addr, "cloud mirror redirect service listening");

	if let Err(e) = axum::serve(listener, app).await {
		tracing::error!(error = %e, "server exited with error");
	}
}

/// Exposed for `main.rs`'s `Run` subcommand description and for
/// `StartLocalStack`/`StopLocalStack` to reuse the settings path.
pub fn service_name() -> &'static str {
	SERVICE_NAME
}
