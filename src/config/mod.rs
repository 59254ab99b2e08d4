use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Runtime configuration for Cloud Mirror.
///
/// Values are loaded from (in order): `config` file (optional) and environment
/// variables prefixed with `CM_` (e.g. `CM_PORT`). Mirrors the small,
/// intentionally conservative bootstrap used throughout this codebase.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
	pub host: String,
	pub port: u16,

	/// Comma-separated in config/env, exploded to one entry per region.
	pub regions: Vec<String>,

	/// Template with a `{region}` placeholder, e.g. `cloud-mirror-{region}`.
	pub bucket_name_template: String,
	pub bucket_lifespan_days: u32,
	pub bucket_acl: String,

	pub cache_ttl_secs: u64,
	pub max_wait_for_cached_copy_ms: u64,
	pub redirect_limit: u32,
	pub ensure_ssl: bool,

	/// Each entry must be anchored `^...` and end in `/` (spec §4.A).
	pub allowlist: Vec<String>,

	pub queue_batch_size: i32,
	pub queue_max_receive_count: i32,
	pub queue_visibility_timeout_secs: i32,
	pub queue_dead_letter_suffix: String,

	pub multipart_part_size_bytes: u64,
	pub multipart_queue_size: usize,

	pub workers_per_region: usize,

	pub aws_region: Option<String>,
	pub aws_endpoint_url: Option<String>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			host: "0.0.0.0".to_string(),
			port: 8080,
			regions: vec!["us-west-1".to_string()],
			bucket_name_template: "cloud-mirror-{region}".to_string(),
			bucket_lifespan_days: 7,
			bucket_acl: "public-read".to_string(),
			cache_ttl_secs: 3600,
			max_wait_for_cached_copy_ms: 30_000,
			redirect_limit: 5,
			ensure_ssl: true,
			allowlist: vec!["^https://.*/".to_string()],
			queue_batch_size: 10,
			queue_max_receive_count: 5,
			queue_visibility_timeout_secs: 120,
			queue_dead_letter_suffix: "-dlq".to_string(),
			multipart_part_size_bytes: 8 * 1024 * 1024,
			multipart_queue_size: 4,
			workers_per_region: 4,
			aws_region: None,
			aws_endpoint_url: None,
		}
	}
}

/// Partial settings used to overlay environment/file values on top of defaults.
#[derive(Debug, Deserialize, Default)]
struct PartialSettings {
	host: Option<String>,
	port: Option<u16>,
	regions: Option<String>,
	bucket_name_template: Option<String>,
	bucket_lifespan_days: Option<u32>,
	bucket_acl: Option<String>,
	cache_ttl_secs: Option<u64>,
	max_wait_for_cached_copy_ms: Option<u64>,
	redirect_limit: Option<u32>,
	ensure_ssl: Option<bool>,
	allowlist: Option<String>,
	queue_batch_size: Option<i32>,
	queue_max_receive_count: Option<i32>,
	queue_visibility_timeout_secs: Option<i32>,
	queue_dead_letter_suffix: Option<String>,
	multipart_part_size_bytes: Option<u64>,
	multipart_queue_size: Option<usize>,
	workers_per_region: Option<usize>,
	aws_region: Option<String>,
	aws_endpoint_url: Option<String>,
}

fn split_csv(s: &str) -> Vec<String> {
	s.split(',')
		.map(|p| p.trim().to_string())
		.filter(|p| !p.is_empty())
		.collect()
}

/// Load settings from config file (optional) and environment variables.
pub fn load() -> Result<Settings> {
	let builder = config::Config::builder()
		.add_source(config::File::with_name("config").required(false))
		.add_source(config::Environment::with_prefix("CM").separator("__"));

	let cfg = builder.build()?;
	let partial: PartialSettings = cfg.try_deserialize().unwrap_or_default();

	let mut s = Settings::default();

	if let Some(v) = partial.host {
		s.host = v;
	}
	if let Some(v) = partial.port {
		s.port = v;
	}
	if let Some(v) = partial.regions {
		s.regions = split_csv(&v);
	}
	if let Some(v) = partial.bucket_name_template {
		s.bucket_name_template = v;
	}
	if let Some(v) = partial.bucket_lifespan_days {
		s.bucket_lifespan_days = v;
	}
	if let Some(v) = partial.bucket_acl {
		s.bucket_acl = v;
	}
	if let Some(v) = partial.cache_ttl_secs {
		s.cache_ttl_secs = v;
	}
	if let Some(v) = partial.max_wait_for_cached_copy_ms {
		s.max_wait_for_cached_copy_ms = v;
	}
	if let Some(v) = partial.redirect_limit {
		s.redirect_limit = v;
	}
	if let Some(v) = partial.ensure_ssl {
		s.ensure_ssl = v;
	}
	if let Some(v) = partial.allowlist {
		s.allowlist = split_csv(&v);
	}
	if let Some(v) = partial.queue_batch_size {
		s.queue_batch_size = v;
	}
	if let Some(v) = partial.queue_max_receive_count {
		s.queue_max_receive_count = v;
	}
	if let Some(v) = partial.queue_visibility_timeout_secs {
		s.queue_visibility_timeout_secs = v;
	}
	if let Some(v) = partial.queue_dead_letter_suffix {
		s.queue_dead_letter_suffix = v;
	}
	if let Some(v) = partial.multipart_part_size_bytes {
		s.multipart_part_size_bytes = v;
	}
	if let Some(v) = partial.multipart_queue_size {
		s.multipart_queue_size = v;
	}
	if let Some(v) = partial.workers_per_region {
		s.workers_per_region = v;
	}
	if let Some(v) = partial.aws_region {
		s.aws_region = Some(v);
	}
	if let Some(v) = partial.aws_endpoint_url {
		s.aws_endpoint_url = Some(v);
	}

	// Explicit direct environment variable reads, as insurance against
	// environments where the `config` crate's prefix/separator mapping
	// doesn't behave as expected (CI sandboxes, test harnesses).
	if let Ok(v) = std::env::var("CM_HOST") {
		if !v.is_empty() {
			s.host = v;
		}
	}
	if let Ok(v) = std::env::var("CM_PORT") {
		if let Ok(p) = v.parse() {
			s.port = p;
		}
	}
	if let Ok(v) = std::env::var("CM_REGIONS") {
		if !v.is_empty() {
			s.regions = split_csv(&v);
		}
	}
	if let Ok(v) = std::env::var("CM_ALLOWLIST") {
		if !v.is_empty() {
			s.allowlist = split_csv(&v);
		}
	}
	if let Ok(v) = std::env::var("CM_AWS_REGION") {
		if !v.is_empty() {
			s.aws_region = Some(v);
		}
	}
	if let Ok(v) = std::env::var("CM_AWS_ENDPOINT_URL") {
		if !v.is_empty() {
			s.aws_endpoint_url = Some(v);
		}
	}

	validate(&s).context("invalid configuration")?;

	Ok(s)
}

/// Hard validation at process start (§10.3): every allowlist entry must
/// be anchored with `^` and end in `/`, and the region list must be
/// non-empty.
fn validate(s: &Settings) -> Result<()> {
	if s.regions.is_empty() {
		bail!("at least one region must be configured");
	}
	for pattern in &s.allowlist {
		if !pattern.starts_with('^') || !pattern.ends_with('/') {
			bail!(
				"allowlist pattern '{}' must be anchored with '^' and end with '/'",
				pattern
			);
		}
		regex::Regex::new(pattern)
			.with_context(|| format!("allowlist pattern '{}' is not a valid regex", pattern))?;
	}
	Ok(())
}

impl Settings {
	pub fn bucket_name_for(&self, region: &str) -> String {
		self.bucket_name_template.replace("{region}", region)
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use std::env;

	#[test]
	fn test_load_defaults_and_env_overlay() {
		let orig_regions = env::var_os("CM_REGIONS");
		let orig_host = env::var_os("CM_HOST");

		unsafe { env::remove_var("CM_REGIONS") };
		unsafe { env::remove_var("CM_HOST") };

		let s = load().expect("load should succeed with defaults");
		let d = Settings::default();
		assert_eq!(s.regions, d.regions);
		assert_eq!(s.host, d.host);

		unsafe { env::set_var("CM_REGIONS", "us-west-1,eu-west-2") };
		unsafe { env::set_var("CM_HOST", "127.0.0.1") };

		let s2 = load().expect("load should succeed with env");
		assert_eq!(s2.regions, vec!["us-west-1", "eu-west-2"]);
		assert_eq!(s2.host, "127.0.0.1");

		match orig_regions {
			Some(v) => unsafe { env::set_var("CM_REGIONS", v) },
			None => unsafe { env::remove_var("CM_REGIONS") },
		}
		match orig_host {
			Some(v) => unsafe { env::set_var("CM_HOST", v) },
			None => unsafe { env::remove_var("CM_HOST") },
		}
	}

	#[test]
	fn rejects_unanchored_allowlist_pattern() {
		let mut s = Settings::default();
		s.allowlist = vec!["https://.*".to_string()];
		assert!(validate(&s).is_err());
	}

	#[test]
	fn bucket_name_template_substitutes_region() {
		let s = Settings::default();
		assert_eq!(s.bucket_name_for("us-west-1"), "cloud-mirror-us-west-1");
	}
}
