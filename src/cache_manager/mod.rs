use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::warn;

use crate::blob::BlobStore;
use crate::observability::MetricsRegistry;
use crate::queue::{CopyJob, QueueError, QueueSender};
use crate::status_store::{StatusStore, StatusStoreError, cache_key};

const BACKFILL_HEAD_TIMEOUT: Duration = Duration::from_secs(30);

/// The three observable states of a cache entry, plus the "no entry"
/// state a reader sees before anything has been written (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
	Absent,
	Pending,
	Present,
	Error,
}

#[derive(Debug, Clone)]
pub struct RedirectLookup {
	pub status: CacheStatus,
	pub public_url: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheManagerError {
	#[error("status store error: {0}")]
	StatusStore(#[from] StatusStoreError),

	#[error("queue error: {0}")]
	Queue(#[from] QueueError),
}

/// Stateless orchestration over injected adapters: lookup, status
/// reads/writes, job enqueue, backfill on cold cache hit (spec §4.F).
pub struct CacheManager {
	pub pool_id: String,
	status_store: Arc<dyn StatusStore>,
	blob_store: Arc<dyn BlobStore>,
	queue_sender: Arc<dyn QueueSender>,
	metrics: Arc<MetricsRegistry>,
	cache_ttl_secs: u64,
	http: Client,
}

impl CacheManager {
	pub fn new(
		pool_id: impl Into<String>,
		status_store: Arc<dyn StatusStore>,
		blob_store: Arc<dyn BlobStore>,
		queue_sender: Arc<dyn QueueSender>,
		metrics: Arc<MetricsRegistry>,
		cache_ttl_secs: u64,
	) -> anyhow::Result<Self> {
		let http = Client::builder().timeout(BACKFILL_HEAD_TIMEOUT).build()?;
		Ok(Self {
			pool_id: pool_id.into(),
			status_store,
			blob_store,
			queue_sender,
			metrics,
			cache_ttl_secs,
			http,
		})
	}

	fn key_for(&self, url: &str) -> String {
		cache_key(&self.pool_id, url)
	}

	/// Reads status for `url`. On a cold miss, attempts a backfill (§9
	/// open question 1) before reporting `absent`.
	pub async fn get_url_for_redirect(
		&self,
		url: &str,
	) -> Result<RedirectLookup, CacheManagerError> {
		let key = self.key_for(url);
		let public_url = self.blob_store.public_url(url);

		match self.status_store.get(&key).await? {
			Some(fields) => {
				let status = match fields.get("status").map(String::as_str) {
					Some("present") => CacheStatus::Present,
					Some("pending") => CacheStatus::Pending,
					Some("error") => CacheStatus::Error,
					_ => CacheStatus::Absent,
				};
				Ok(RedirectLookup { status, public_url })
			}
			None => {
				if let Some(status) = self.backfill(url).await? {
					self.metrics.backfill_total.inc();
					Ok(RedirectLookup { status, public_url })
				} else {
					Ok(RedirectLookup {
						status: CacheStatus::Absent,
						public_url,
					})
				}
			}
		}
	}

	/// On cold status, HEAD the blob's *public* URL over plain HTTP — the
	/// same path a redirected client will take — so `present` is only
	/// adopted when the object is actually publicly readable, not merely
	/// visible to this process's AWS credentials (spec §3/§9). Only a 2xx
	/// response counts; adopts the capped TTL (30-minute safety margin).
	async fn backfill(&self, url: &str) -> Result<Option<CacheStatus>, CacheManagerError> {
		let key = self.key_for(url);
		let public_url = self.blob_store.public_url(url);

		let resp = match self.http.head(&public_url).send().await {
			Ok(r) if r.status().is_success() => r,
			_ => return Ok(None),
		};

		let mut headers = std::collections::HashMap::new();
		for (name, value) in resp.headers().iter() {
			if let Ok(v) = value.to_str() {
				headers.insert(name.as_str().to_string(), v.to_string());
			}
		}

		let ttl = match self.blob_store.expiration_date(&headers) {
			Some(expiry) => {
				let remaining = (expiry - Utc::now()).num_seconds() - 30 * 60;
				remaining.max(0) as u64
			}
			None => self.cache_ttl_secs,
		};

		let mut fields = std::collections::HashMap::new();
		fields.insert("url".to_string(), url.to_string());
		fields.insert("status".to_string(), "present".to_string());
		self.status_store.put(&key, fields, ttl).await?;

		Ok(Some(CacheStatus::Present))
	}

	/// Writes `pending` with TTL, enqueues a copy job.
	pub async fn request_put(&self, url: &str) -> Result<(), CacheManagerError> {
		let key = self.key_for(url);
		let mut fields = std::collections::HashMap::new();
		fields.insert("url".to_string(), url.to_string());
		fields.insert("status".to_string(), "pending".to_string());
		self.status_store.put(&key, fields, self.cache_ttl_secs).await?;

		let job = CopyJob::new(&self.pool_id, url);
		self.queue_sender.send(&job).await?;
		Ok(())
	}

	/// Deletes the blob then the status entry; ignores not-found on either.
	pub async fn purge(&self, url: &str) -> Result<(), CacheManagerError> {
		let key = self.key_for(url);
		if let Err(e) = self.blob_store.delete(url).await {
			warn!(pool_id = %self.pool_id, url, error = %e, "purge: blob delete failed, continuing");
		}
		self.status_store.delete(&key).await?;
		Ok(())
	}

	pub fn cache_ttl(&self) -> Duration {
		Duration::from_secs(self.cache_ttl_secs)
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;
	use crate::blob::{BlobStoreError, HeadResult, PutHeaders};
	use crate::queue::QueueError as QErr;
	use crate::status_store::StatusFields;
	use async_trait::async_trait;
	use std::collections::HashMap;
	use std::sync::Mutex;

	struct MockStatusStore {
		entries: Mutex<HashMap<String, StatusFields>>,
	}

	impl MockStatusStore {
		fn new() -> Self {
			Self {
				entries: Mutex::new(HashMap::new()),
			}
		}
	}

	#[async_trait]
	impl StatusStore for MockStatusStore {
		async fn get(&self, key: &str) -> Result<Option<StatusFields>, StatusStoreError> {
			Ok(self.entries.lock().unwrap().get(key).cloned())
		}
		async fn put(
			&self,
			key: &str,
			fields: StatusFields,
			_ttl_secs: u64,
		) -> Result<(), StatusStoreError> {
			self.entries.lock().unwrap().insert(key.to_string(), fields);
			Ok(())
		}
		async fn put_if_absent(
			&self,
			key: &str,
			fields: StatusFields,
			ttl_secs: u64,
		) -> Result<(), StatusStoreError> {
			let mut e = self.entries.lock().unwrap();
			if e.contains_key(key) {
				return Err(StatusStoreError::AlreadyLocked);
			}
			e.insert(key.to_string(), fields);
			drop(e);
			let _ = ttl_secs;
			Ok(())
		}
		async fn delete(&self, key: &str) -> Result<(), StatusStoreError> {
			self.entries.lock().unwrap().remove(key);
			Ok(())
		}
	}

	struct MockBlobStore {
		// Points at an address backfill's HTTP HEAD will hit. Unit tests use
		// an unroutable loopback port so the connection fails fast without
		// any real network access; the success path (HEAD returns 2xx) is
		// covered by a `wiremock`-backed test under `integration-tests`.
		base_url: String,
	}

	#[async_trait]
	impl BlobStore for MockBlobStore {
		async fn put(
			&self,
			_key: &str,
			_body: crate::blob::ByteChunkStream,
			_headers: PutHeaders,
			_metadata: HashMap<String, String>,
		) -> Result<u64, BlobStoreError> {
			Ok(0)
		}
		async fn delete(&self, _key: &str) -> Result<(), BlobStoreError> {
			Ok(())
		}
		async fn head(&self, _key: &str) -> Result<HeadResult, BlobStoreError> {
			Err(BlobStoreError::NotFound)
		}
		fn expiration_date(&self, _headers: &HashMap<String, String>) -> Option<chrono::DateTime<Utc>> {
			None
		}
		fn public_url(&self, key: &str) -> String {
			format!("{}/{key}", self.base_url)
		}
	}

	struct MockQueueSender {
		sent: Mutex<Vec<CopyJob>>,
	}

	#[async_trait]
	impl QueueSender for MockQueueSender {
		async fn send(&self, job: &CopyJob) -> Result<(), QErr> {
			self.sent.lock().unwrap().push(job.clone());
			Ok(())
		}
	}

	fn manager() -> (CacheManager, Arc<MockQueueSender>) {
		let sender = Arc::new(MockQueueSender {
			sent: Mutex::new(Vec::new()),
		});
		let mgr = CacheManager::new(
			"s3_us-west-1",
			Arc::new(MockStatusStore::new()),
			Arc::new(MockBlobStore {
				base_url: "http://127.0.0.1:1".to_string(),
			}),
			sender.clone(),
			Arc::new(MetricsRegistry::new()),
			3600,
		)
		.unwrap();
		(mgr, sender)
	}

	#[tokio::test]
	async fn cold_miss_without_blob_reports_absent() {
		let (mgr, _) = manager();
		let lookup = mgr.get_url_for_redirect("https://example.com/x").await.unwrap();
		assert_eq!(lookup.status, CacheStatus::Absent);
	}

	#[tokio::test]
	async fn request_put_enqueues_exactly_one_job() {
		let (mgr, sender) = manager();
		mgr.request_put("https://example.com/x").await.unwrap();
		assert_eq!(sender.sent.lock().unwrap().len(), 1);
		assert_eq!(sender.sent.lock().unwrap()[0].action, "put");
	}

	#[tokio::test]
	async fn purge_then_get_yields_absent() {
		let (mgr, _) = manager();
		mgr.request_put("https://example.com/x").await.unwrap();
		mgr.purge("https://example.com/x").await.unwrap();
		let lookup = mgr.get_url_for_redirect("https://example.com/x").await.unwrap();
		assert_eq!(lookup.status, CacheStatus::Absent);
	}
}
