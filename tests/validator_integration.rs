#![cfg(feature = "integration-tests")]

use cloud_mirror::validator::{UrlValidator, ValidatorError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn follows_a_single_redirect_hop_to_a_2xx_response() {
	let server = MockServer::start().await;

	Mock::given(method("HEAD"))
		.and(path("/start"))
		.respond_with(
			ResponseTemplate::new(302).insert_header("Location", format!("{}/final", server.uri())),
		)
		.mount(&server)
		.await;

	Mock::given(method("HEAD"))
		.and(path("/final"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let base = server.uri();
	let allowlist = vec![format!("^{}/.*", regex::escape(&base))];
	let validator = UrlValidator::new(&allowlist, 5, false).unwrap();

	let result = validator
		.validate(&format!("{base}/start"))
		.await
		.expect("validation should succeed");

	assert_eq!(result.final_url, format!("{base}/final"));
	assert_eq!(result.hop_chain.len(), 2);
	assert_eq!(result.hop_chain[0].code, 302);
	assert_eq!(result.hop_chain[1].code, 200);
}

#[tokio::test]
async fn non_redirect_non_success_status_fails_bad_http_status() {
	let server = MockServer::start().await;

	Mock::given(method("HEAD"))
		.and(path("/broken"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let base = server.uri();
	let allowlist = vec![format!("^{}/.*", regex::escape(&base))];
	let validator = UrlValidator::new(&allowlist, 5, false).unwrap();

	let err = validator.validate(&format!("{base}/broken")).await.unwrap_err();
	assert!(matches!(err, ValidatorError::BadHttpStatus(500)));
}

#[tokio::test]
async fn redirect_chain_longer_than_limit_fails_too_many_redirects() {
	let server = MockServer::start().await;

	for hop in 0..10 {
		Mock::given(method("HEAD"))
			.and(path(format!("/hop{hop}")))
			.respond_with(
				ResponseTemplate::new(302)
					.insert_header("Location", format!("{}/hop{}", server.uri(), hop + 1)),
			)
			.mount(&server)
			.await;
	}

	let base = server.uri();
	let allowlist = vec![format!("^{}/.*", regex::escape(&base))];
	let validator = UrlValidator::new(&allowlist, 3, false).unwrap();

	let err = validator.validate(&format!("{base}/hop0")).await.unwrap_err();
	assert!(matches!(err, ValidatorError::TooManyRedirects));
}
