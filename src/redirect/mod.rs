use std::time::Duration;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache_manager::CacheStatus;
use crate::errors::CloudMirrorError;
use crate::state::AppState;
use crate::validator::UrlValidator;

static TOKEN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,22}$").unwrap());

#[derive(Debug, Serialize)]
struct RedirectBody {
	status: &'static str,
	url: String,
}

fn decode_b64url(service: &str, region: &str, b64url: &str, err: Option<&str>) -> Result<String, CloudMirrorError> {
	if !TOKEN_RE.is_match(service) || !TOKEN_RE.is_match(region) {
		return Err(CloudMirrorError::InputError(
			"service/region must match ^[A-Za-z0-9_-]{1,22}$".to_string(),
		));
	}
	if err.map(|e| !e.is_empty()).unwrap_or(false) {
		return Err(CloudMirrorError::InputError(
			"url was not properly percent-encoded".to_string(),
		));
	}
	let bytes = URL_SAFE_NO_PAD
		.decode(b64url)
		.map_err(|e| CloudMirrorError::InputError(format!("invalid base64 url: {e}")))?;
	String::from_utf8(bytes).map_err(|e| CloudMirrorError::InputError(format!("invalid utf-8 url: {e}")))
}

async fn lookup_manager(
	state: &AppState,
	service: &str,
	region: &str,
) -> Result<std::sync::Arc<crate::cache_manager::CacheManager>, CloudMirrorError> {
	let pool_id = format!("{service}_{region}");
	let matches: Vec<_> = state
		.pools
		.iter()
		.filter(|(k, _)| *k == pool_id)
		.collect();

	match matches.len() {
		0 => Err(CloudMirrorError::ResourceNotFound {
			service: service.to_string(),
			region: region.to_string(),
		}),
		1 => Ok(matches[0].1.clone()),
		_ => Err(CloudMirrorError::DuplicatePool {
			service: service.to_string(),
			region: region.to_string(),
		}),
	}
}

/// `GET /v1/redirect/:service/:region/:b64url`. Polls the Cache Manager
/// at 1 Hz, bounded by `maxWaitForCachedCopy` (spec §4.G). axum routes
/// the `:err?` trailing segment as a second, more specific route
/// (`redirect_with_err`) rather than an optional path parameter.
pub async fn redirect(
	State(state): State<AppState>,
	Path((service, region, b64url)): Path<(String, String, String)>,
) -> Response {
	match redirect_inner(state, &service, &region, &b64url, None).await {
		Ok(r) => r,
		Err(e) => e.into_response(),
	}
}

/// `GET /v1/redirect/:service/:region/:b64url/:err`. A non-empty `err`
/// segment signals the URL tail was not properly percent-encoded.
pub async fn redirect_with_err(
	State(state): State<AppState>,
	Path((service, region, b64url, err)): Path<(String, String, String, String)>,
) -> Response {
	match redirect_inner(state, &service, &region, &b64url, Some(&err)).await {
		Ok(r) => r,
		Err(e) => e.into_response(),
	}
}

async fn redirect_inner(
	state: AppState,
	service: &str,
	region: &str,
	b64url: &str,
	err: Option<&str>,
) -> Result<Response, CloudMirrorError> {
	let url = decode_b64url(service, region, b64url, err)?;
	let manager = lookup_manager(&state, service, region).await?;

	let deadline = tokio::time::Instant::now() + state.max_wait_for_cached_copy;
	let mut first_poll = true;

	loop {
		let lookup = manager
			.get_url_for_redirect(&url)
			.await
			.map_err(|e| CloudMirrorError::Transient(e.to_string()))?;

		match lookup.status {
			CacheStatus::Present => {
				state.metrics.cache_hit_total.inc();
				return Ok(redirect_response(&lookup.public_url, "present", &url));
			}
			CacheStatus::Pending => {}
			CacheStatus::Absent => {
				state.metrics.cache_miss_total.inc();
				if first_poll {
					state.validator.validate(&url).await?;
					manager
						.request_put(&url)
						.await
						.map_err(|e| CloudMirrorError::Transient(e.to_string()))?;
				}
			}
			CacheStatus::Error => {
				manager
					.request_put(&url)
					.await
					.map_err(|e| CloudMirrorError::Transient(e.to_string()))?;
			}
		}

		first_poll = false;

		if tokio::time::Instant::now() >= deadline {
			warn!(service, region, url, "maxWaitForCachedCopy exceeded, falling back to original url");
			state.metrics.redirect_original_total.inc();
			return Ok(redirect_response(&url, "pending", &url));
		}

		tokio::time::sleep(Duration::from_secs(1)).await;
	}
}

fn redirect_response(location: &str, status: &'static str, url: &str) -> Response {
	let mut resp = (
		StatusCode::FOUND,
		Json(RedirectBody {
			status,
			url: url.to_string(),
		}),
	)
		.into_response();
	if let Ok(v) = HeaderValue::from_str(location) {
		resp.headers_mut().insert(header::LOCATION, v);
	}
	resp
}

/// `DELETE /v1/purge/:service/:region/:b64url`.
pub async fn purge(
	State(state): State<AppState>,
	Path((service, region, b64url)): Path<(String, String, String)>,
) -> Response {
	match purge_inner(state, &service, &region, &b64url, None).await {
		Ok(r) => r,
		Err(e) => e.into_response(),
	}
}

/// `DELETE /v1/purge/:service/:region/:b64url/:err`.
pub async fn purge_with_err(
	State(state): State<AppState>,
	Path((service, region, b64url, err)): Path<(String, String, String, String)>,
) -> Response {
	match purge_inner(state, &service, &region, &b64url, Some(&err)).await {
		Ok(r) => r,
		Err(e) => e.into_response(),
	}
}

async fn purge_inner(
	state: AppState,
	service: &str,
	region: &str,
	b64url: &str,
	err: Option<&str>,
) -> Result<Response, CloudMirrorError> {
	let url = decode_b64url(service, region, b64url, err)?;
	let manager = lookup_manager(&state, service, region).await?;
	manager
		.purge(&url)
		.await
		.map_err(|e| CloudMirrorError::Transient(e.to_string()))?;
	info!(service, region, url, "purged");
	Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn ping() -> &'static str {
	"pong"
}

pub async fn api_reference() -> &'static str {
	"GET /v1/redirect/:service/:region/:b64url\nDELETE /v1/purge/:service/:region/:b64url\nGET /v1/ping"
}

/// Exposed so the Redirect Service can validate before the first
/// `requestPut`; kept as a type alias to document the dependency.
pub type Validator = UrlValidator;
