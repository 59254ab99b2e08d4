use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

/// Central error taxonomy for Cloud Mirror (spec §7).
///
/// `stack` text attached to adapter failures is intentionally not part
/// of any `#[error(...)]` message that reaches a client response body;
/// see `IntoResponse` below.
#[derive(Debug, Error)]
pub enum CloudMirrorError {
	#[error("malformed request: {0}")]
	InputError(String),

	#[error("url is not https")]
	InsecureUrl,

	#[error("url is not on the allowlist")]
	DisallowedUrl,

	#[error("origin returned status {0}")]
	BadHttpStatus(u16),

	#[error("exceeded redirect limit")]
	TooManyRedirects,

	#[error("redirect response missing Location header")]
	RedirectMissingLocation,

	#[error("no pool registered for ({service}, {region})")]
	ResourceNotFound { service: String, region: String },

	#[error("more than one pool registered for ({service}, {region})")]
	DuplicatePool { service: String, region: String },

	#[error("transient failure: {0}")]
	Transient(String),

	#[error("fatal: {0}")]
	Fatal(String),
}

impl From<crate::validator::ValidatorError> for CloudMirrorError {
	fn from(e: crate::validator::ValidatorError) -> Self {
		use crate::validator::ValidatorError as V;
		match e {
			V::InsecureUrl => CloudMirrorError::InsecureUrl,
			V::DisallowedUrl => CloudMirrorError::DisallowedUrl,
			V::BadHttpStatus(code) => CloudMirrorError::BadHttpStatus(code),
			V::TooManyRedirects => CloudMirrorError::TooManyRedirects,
			V::RedirectMissingLocation => CloudMirrorError::RedirectMissingLocation,
			V::MalformedUrl(m) | V::RequestFailed(m) => CloudMirrorError::InputError(m),
		}
	}
}

impl CloudMirrorError {
	/// Abstract, client-safe reason string. Never echoes adapter stack
	/// text or upstream diagnostic detail (§4.G contract).
	fn client_reason(&self) -> &'static str {
		match self {
			CloudMirrorError::InputError(_) => "malformed request",
			CloudMirrorError::InsecureUrl => "url rejected: insecure scheme",
			CloudMirrorError::DisallowedUrl => "url rejected: not on allowlist",
			CloudMirrorError::BadHttpStatus(_)
			| CloudMirrorError::TooManyRedirects
			| CloudMirrorError::RedirectMissingLocation => "url validation failed",
			CloudMirrorError::ResourceNotFound { .. } => "unknown service/region",
			CloudMirrorError::DuplicatePool { .. } => "internal configuration error",
			CloudMirrorError::Transient(_) => "temporarily unavailable",
			CloudMirrorError::Fatal(_) => "internal error",
		}
	}

	fn status_code(&self) -> StatusCode {
		match self {
			CloudMirrorError::InputError(_) => StatusCode::BAD_REQUEST,
			CloudMirrorError::InsecureUrl | CloudMirrorError::DisallowedUrl => {
				StatusCode::FORBIDDEN
			}
			CloudMirrorError::BadHttpStatus(_)
			| CloudMirrorError::TooManyRedirects
			| CloudMirrorError::RedirectMissingLocation => StatusCode::BAD_REQUEST,
			CloudMirrorError::ResourceNotFound { .. } => StatusCode::NOT_FOUND,
			CloudMirrorError::DuplicatePool { .. } => StatusCode::INTERNAL_SERVER_ERROR,
			CloudMirrorError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
			CloudMirrorError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
		}
	}
}

#[derive(Serialize)]
struct ErrorBody {
	error: String,
}

impl IntoResponse for CloudMirrorError {
	fn into_response(self) -> Response {
		let status = self.status_code();
		let body = ErrorBody {
			error: self.client_reason().to_string(),
		};
		(status, axum::Json(body)).into_response()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn input_error_maps_to_400() {
		let e = CloudMirrorError::InputError("bad b64url".to_string());
		assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
	}

	#[test]
	fn disallowed_url_maps_to_403_and_hides_detail() {
		let e = CloudMirrorError::DisallowedUrl;
		assert_eq!(e.status_code(), StatusCode::FORBIDDEN);
		assert_eq!(e.client_reason(), "url rejected: not on allowlist");
	}

	#[test]
	fn resource_not_found_maps_to_404() {
		let e = CloudMirrorError::ResourceNotFound {
			service: "s3".to_string(),
			region: "mars-1".to_string(),
		};
		assert_eq!(e.status_code(), StatusCode::NOT_FOUND);
	}

	#[test]
	fn transient_never_leaks_stack_text_in_client_reason() {
		let e = CloudMirrorError::Transient("dynamodb: ProvisionedThroughputExceeded".to_string());
		assert_eq!(e.client_reason(), "temporarily unavailable");
	}
}
