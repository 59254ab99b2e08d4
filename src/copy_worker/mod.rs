use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tokio::time::timeout;
use tracing::{error, info, warn};

use crate::blob::{BlobStore, PutHeaders, metadata_keys};
use crate::observability::MetricsRegistry;
use crate::queue::CopyJob;
use crate::status_store::{StatusStore, cache_key, lock_key};
use crate::validator::UrlValidator;

const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// One worker pool per pool_id (spec §4.E). Consumes dequeued jobs under a
/// single-flight lock, streams origin bytes into the blob store, and
/// updates the status store at each transition.
pub struct CopyWorker {
	pool_id: String,
	status_store: Arc<dyn StatusStore>,
	blob_store: Arc<dyn BlobStore>,
	validator: Arc<UrlValidator>,
	http: Client,
	metrics: Arc<MetricsRegistry>,
	cache_ttl_secs: u64,
}

impl CopyWorker {
	pub fn new(
		pool_id: impl Into<String>,
		status_store: Arc<dyn StatusStore>,
		blob_store: Arc<dyn BlobStore>,
		validator: Arc<UrlValidator>,
		metrics: Arc<MetricsRegistry>,
		cache_ttl_secs: u64,
	) -> anyhow::Result<Self> {
		let http = Client::builder().build()?;
		Ok(Self {
			pool_id: pool_id.into(),
			status_store,
			blob_store,
			validator,
			http,
			metrics,
			cache_ttl_secs,
		})
	}

	/// Handles one dequeued job end to end. Returns `true` when the queue
	/// message should be acked (success, or a permanent rejection that
	/// should not be redelivered); `false` leaves it unacked for the
	/// queue's own redelivery/backoff.
	pub async fn handle(&self, job: CopyJob) -> bool {
		let key = cache_key(&self.pool_id, &job.url);
		let lock = lock_key(&key);

		// 1. Single-flight guard.
		let mut fields = HashMap::new();
		fields.insert("url".to_string(), job.url.clone());
		if let Err(e) = self.status_store.put_if_absent(&lock, fields, self.cache_ttl_secs).await {
			self.metrics.concurrent_copy_already_locked_total.inc();
			info!(pool_id = %self.pool_id, url = %job.url, "declined: copy already in flight ({e})");
			return true;
		}

		let result = self.copy(&job, &key).await;

		// 9. Release the lock regardless of outcome.
		if let Err(e) = self.status_store.delete(&lock).await {
			warn!(pool_id = %self.pool_id, url = %job.url, error = %e, "failed to release single-flight lock");
		}

		result
	}

	async fn copy(&self, job: &CopyJob, key: &str) -> bool {
		let start = Instant::now();

		// 2. Write pending.
		let mut pending_fields = HashMap::new();
		pending_fields.insert("url".to_string(), job.url.clone());
		pending_fields.insert("status".to_string(), "pending".to_string());
		if let Err(e) = self
			.status_store
			.put(key, pending_fields, self.cache_ttl_secs)
			.await
		{
			error!(pool_id = %self.pool_id, url = %job.url, error = %e, "status-store-failure writing pending");
			self.metrics.status_store_failure_total.inc();
			return false;
		}

		// 3. Validate the URL.
		let validated = match self.validator.validate(&job.url).await {
			Ok(v) => v,
			Err(e) => {
				self.fail(key, job, &e.to_string()).await;
				return true;
			}
		};

		// 4. Origin GET with inactivity timeout.
		let resp = match timeout(
			INACTIVITY_TIMEOUT,
			self.http
				.get(&validated.final_url)
				.header("Accept-Encoding", "*")
				.send(),
		)
		.await
		{
			Ok(Ok(r)) => r,
			Ok(Err(e)) => {
				self.fail(key, job, &format!("origin request failed: {e}")).await;
				return false;
			}
			Err(_) => {
				self.fail(key, job, "origin stream aborted: inactivity timeout").await;
				return false;
			}
		};

		let upstream_etag = resp
			.headers()
			.get(reqwest::header::ETAG)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("")
			.to_string();
		let upstream_content_length = resp.content_length();
		let content_type = resp
			.headers()
			.get(reqwest::header::CONTENT_TYPE)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("application/octet-stream")
			.to_string();

		// 5. Forwarded headers and metadata.
		let mut metadata = HashMap::new();
		metadata.insert(metadata_keys::UPSTREAM_ETAG.to_string(), upstream_etag);
		metadata.insert(
			metadata_keys::UPSTREAM_CONTENT_LENGTH.to_string(),
			upstream_content_length.map(|v| v.to_string()).unwrap_or_default(),
		);
		metadata.insert(metadata_keys::UPSTREAM_URL.to_string(), job.url.clone());
		metadata.insert(metadata_keys::STORED.to_string(), Utc::now().to_rfc3339());
		metadata.insert(
			metadata_keys::ADDRESSES.to_string(),
			json!(validated.hop_chain).to_string(),
		);

		let headers = PutHeaders {
			content_type,
			content_length: upstream_content_length,
			..Default::default()
		};

		// 6. Stream straight into the blob store; never buffered whole.
		let body_stream: crate::blob::ByteChunkStream = Box::pin(resp.bytes_stream());
		let observed = match self.blob_store.put(&job.url, body_stream, headers, metadata).await {
			Ok(n) => n,
			Err(e) => {
				let _ = self.blob_store.delete(&job.url).await;
				self.fail(key, job, &format!("blob put failed: {e}")).await;
				return false;
			}
		};

		if let Some(expected) = upstream_content_length {
			if expected != observed {
				warn!(
					pool_id = %self.pool_id,
					url = %job.url,
					expected,
					observed,
					"content-length mismatch between origin and observed bytes"
				);
				self.metrics.content_length_mismatch_total.inc();
			}
		}

		let elapsed = start.elapsed();
		self.metrics.copy_duration_ms.observe(elapsed.as_millis() as f64);
		self.metrics.copy_size_bytes.observe(observed as f64);
		if elapsed.as_secs_f64() > 0.0 {
			let kbps = (observed as f64 / 1024.0) / elapsed.as_secs_f64();
			self.metrics.copy_speed_kbps.observe(kbps);
		}

		// 7. Present on success.
		let mut present_fields = HashMap::new();
		present_fields.insert("url".to_string(), job.url.clone());
		present_fields.insert("status".to_string(), "present".to_string());
		if let Err(e) = self
			.status_store
			.put(key, present_fields, self.cache_ttl_secs)
			.await
		{
			error!(pool_id = %self.pool_id, url = %job.url, error = %e, "status-store-failure writing present");
			self.metrics.status_store_failure_total.inc();
			return false;
		}

		info!(pool_id = %self.pool_id, url = %job.url, bytes = observed, "copy complete");
		true
	}

	/// Best-effort blob cleanup, then overwrite status with `error`
	/// carrying the stack text (spec §4.E step 8).
	async fn fail(&self, key: &str, job: &CopyJob, stack: &str) {
		error!(pool_id = %self.pool_id, url = %job.url, stack, "copy failed");
		let _ = self.blob_store.delete(&job.url).await;

		let mut fields = HashMap::new();
		fields.insert("url".to_string(), job.url.clone());
		fields.insert("status".to_string(), "error".to_string());
		fields.insert("stack".to_string(), stack.to_string());
		if let Err(e) = self.status_store.put(key, fields, self.cache_ttl_secs).await {
			error!(pool_id = %self.pool_id, error = %e, "status-store-failure writing error state");
			self.metrics.status_store_failure_total.inc();
		}
	}
}
