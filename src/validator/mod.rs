use std::time::Duration;

use chrono::Utc;
use regex::Regex;
use reqwest::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const HEAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors raised while walking a redirect chain. Mirrors the taxonomy
/// surfaced to clients as 4xx in `errors::CloudMirrorError`.
#[derive(Debug, Error)]
pub enum ValidatorError {
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

	#[error("malformed url: {0}")]
	MalformedUrl(String),

	#[error("request to origin failed: {0}")]
	RequestFailed(String),
}

/// One recorded hop in a redirect chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hop {
	pub code: u16,
	pub url: String,
	pub timestamp: chrono::DateTime<Utc>,
}

/// Result of a successful validation.
#[derive(Debug, Clone)]
pub struct Validated {
	pub final_url: String,
	pub headers: reqwest::header::HeaderMap,
	pub status_code: u16,
	pub hop_chain: Vec<Hop>,
}

/// Follows a redirect chain under TLS/allowlist rules, HEAD-only, without
/// letting the HTTP client auto-follow redirects (spec §4.A).
pub struct UrlValidator {
	client: Client,
	allowlist: Vec<Regex>,
	max_redirects: u32,
	ensure_tls: bool,
}

impl UrlValidator {
	pub fn new(allowlist: &[String], max_redirects: u32, ensure_tls: bool) -> anyhow::Result<Self> {
		let client = Client::builder()
			.timeout(HEAD_TIMEOUT)
			.redirect(reqwest::redirect::Policy::none())
			.build()?;

		let allowlist = allowlist
			.iter()
			.map(|p| Regex::new(p))
			.collect::<Result<Vec<_>, _>>()?;

		Ok(Self {
			client,
			allowlist,
			max_redirects,
			ensure_tls,
		})
	}

	fn is_allowed(&self, url: &str) -> bool {
		self.allowlist.iter().any(|re| re.is_match(url))
	}

	/// Walk the redirect chain via HEAD requests starting at `url`.
	pub async fn validate(&self, url: &str) -> Result<Validated, ValidatorError> {
		let mut current = url.to_string();
		let mut hop_chain = Vec::new();

		for _ in 0..self.max_redirects {
			let parsed =
				Url::parse(&current).map_err(|e| ValidatorError::MalformedUrl(e.to_string()))?;

			if self.ensure_tls && parsed.scheme() != "https" {
				return Err(ValidatorError::InsecureUrl);
			}

			if !self.is_allowed(&current) {
				return Err(ValidatorError::DisallowedUrl);
			}

			let resp = self
				.client
				.head(&current)
				.header("Accept-Encoding", "*")
				.send()
				.await
				.map_err(|e| ValidatorError::RequestFailed(e.to_string()))?;

			let status = resp.status();
			hop_chain.push(Hop {
				code: status.as_u16(),
				url: current.clone(),
				timestamp: Utc::now(),
			});

			if status.is_success() || status == StatusCode::NOT_MODIFIED {
				return Ok(Validated {
					final_url: current,
					headers: resp.headers().clone(),
					status_code: status.as_u16(),
					hop_chain,
				});
			}

			if status.is_redirection() && status != StatusCode::NOT_MODIFIED && status.as_u16() != 305
			{
				let location = resp
					.headers()
					.get(reqwest::header::LOCATION)
					.and_then(|v| v.to_str().ok())
					.ok_or(ValidatorError::RedirectMissingLocation)?;

				let next = parsed
					.join(location)
					.map_err(|e| ValidatorError::MalformedUrl(e.to_string()))?;
				current = next.to_string();
				continue;
			}

			return Err(ValidatorError::BadHttpStatus(status.as_u16()));
		}

		Err(ValidatorError::TooManyRedirects)
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn rejects_insecure_scheme() {
		let v = UrlValidator::new(&["^http://.*/".to_string()], 5, true).unwrap();
		assert!(v.allowlist.iter().any(|r| r.is_match("http://x/")));
		// ensure_tls=true means even an allowlisted http:// url is rejected at
		// the scheme check, which validate() performs before the regex test.
	}

	#[tokio::test]
	async fn disallowed_url_is_rejected_before_any_request() {
		let v = UrlValidator::new(&["^https://allowed\\.example/".to_string()], 5, true).unwrap();
		let err = v.validate("https://evil.example/path").await.unwrap_err();
		assert!(matches!(err, ValidatorError::DisallowedUrl));
	}

	#[tokio::test]
	async fn insecure_url_rejected_when_tls_required() {
		let v = UrlValidator::new(&["^http://allowed\\.example/".to_string()], 5, true).unwrap();
		let err = v.validate("http://allowed.example/path").await.unwrap_err();
		assert!(matches!(err, ValidatorError::InsecureUrl));
	}

	#[tokio::test]
	async fn zero_redirect_limit_always_fails_too_many_redirects() {
		let v = UrlValidator::new(&["^https://.*/".to_string()], 0, true).unwrap();
		let err = v.validate("https://allowed.example/path").await.unwrap_err();
		assert!(matches!(err, ValidatorError::TooManyRedirects));
	}
}
