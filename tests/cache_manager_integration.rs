#![cfg(feature = "integration-tests")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cloud_mirror::blob::{BlobStore, BlobStoreError, ByteChunkStream, HeadResult, PutHeaders};
use cloud_mirror::cache_manager::{CacheManager, CacheStatus};
use cloud_mirror::observability::MetricsRegistry;
use cloud_mirror::queue::{CopyJob, QueueError, QueueSender};
use cloud_mirror::status_store::{StatusFields, StatusStore, StatusStoreError};

use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[derive(Default)]
struct InMemoryStatusStore {
	entries: Mutex<HashMap<String, StatusFields>>,
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
	async fn get(&self, key: &str) -> Result<Option<StatusFields>, StatusStoreError> {
		Ok(self.entries.lock().unwrap().get(key).cloned())
	}
	async fn put(&self, key: &str, fields: StatusFields, _ttl_secs: u64) -> Result<(), StatusStoreError> {
		self.entries.lock().unwrap().insert(key.to_string(), fields);
		Ok(())
	}
	async fn put_if_absent(
		&self,
		key: &str,
		fields: StatusFields,
		_ttl_secs: u64,
	) -> Result<(), StatusStoreError> {
		let mut e = self.entries.lock().unwrap();
		if e.contains_key(key) {
			return Err(StatusStoreError::AlreadyLocked);
		}
		e.insert(key.to_string(), fields);
		Ok(())
	}
	async fn delete(&self, key: &str) -> Result<(), StatusStoreError> {
		self.entries.lock().unwrap().remove(key);
		Ok(())
	}
}

struct WiremockBackedBlobStore {
	base_url: String,
}

#[async_trait]
impl BlobStore for WiremockBackedBlobStore {
	async fn put(
		&self,
		_key: &str,
		_body: ByteChunkStream,
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
	fn expiration_date(&self, _headers: &HashMap<String, String>) -> Option<DateTime<Utc>> {
		None
	}
	fn public_url(&self, key: &str) -> String {
		format!("{}/{key}", self.base_url)
	}
}

struct NoopQueueSender;

#[async_trait]
impl QueueSender for NoopQueueSender {
	async fn send(&self, _job: &CopyJob) -> Result<(), QueueError> {
		Ok(())
	}
}

#[tokio::test]
async fn cold_miss_with_publicly_readable_blob_backfills_to_present() {
	let server = MockServer::start().await;

	Mock::given(method("HEAD"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	let manager = CacheManager::new(
		"s3_us-west-1",
		Arc::new(InMemoryStatusStore::default()),
		Arc::new(WiremockBackedBlobStore {
			base_url: server.uri(),
		}),
		Arc::new(NoopQueueSender),
		Arc::new(MetricsRegistry::new()),
		3600,
	)
	.unwrap();

	let lookup = manager.get_url_for_redirect("artifact.bin").await.unwrap();
	assert_eq!(lookup.status, CacheStatus::Present);
}

#[tokio::test]
async fn cold_miss_with_private_blob_stays_absent() {
	let server = MockServer::start().await;

	Mock::given(method("HEAD"))
		.respond_with(ResponseTemplate::new(403))
		.mount(&server)
		.await;

	let manager = CacheManager::new(
		"s3_us-west-1",
		Arc::new(InMemoryStatusStore::default()),
		Arc::new(WiremockBackedBlobStore {
			base_url: server.uri(),
		}),
		Arc::new(NoopQueueSender),
		Arc::new(MetricsRegistry::new()),
		3600,
	)
	.unwrap();

	let lookup = manager.get_url_for_redirect("artifact.bin").await.unwrap();
	assert_eq!(
		lookup.status,
		CacheStatus::Absent,
		"a blob only reachable via authenticated SDK access (not the public url) must not be adopted as present"
	);
}
