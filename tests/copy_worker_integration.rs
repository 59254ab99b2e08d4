#![cfg(feature = "integration-tests")]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;

use cloud_mirror::blob::{BlobStore, BlobStoreError, ByteChunkStream, HeadResult, PutHeaders};
use cloud_mirror::copy_worker::CopyWorker;
use cloud_mirror::observability::MetricsRegistry;
use cloud_mirror::queue::CopyJob;
use cloud_mirror::status_store::{StatusFields, StatusStore, StatusStoreError, cache_key, lock_key};
use cloud_mirror::validator::UrlValidator;

use wiremock::matchers::{method, path};
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

#[derive(Default)]
struct InMemoryBlobStore {
	objects: Mutex<HashMap<String, Vec<u8>>>,
	put_count: Mutex<u32>,
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
	async fn put(
		&self,
		key: &str,
		mut body: ByteChunkStream,
		_headers: PutHeaders,
		_metadata: HashMap<String, String>,
	) -> Result<u64, BlobStoreError> {
		let mut buf = Vec::new();
		while let Some(chunk) = body.next().await {
			let chunk = chunk.map_err(|e| BlobStoreError::Transient(e.to_string()))?;
			buf.extend_from_slice(&chunk);
		}
		*self.put_count.lock().unwrap() += 1;
		let len = buf.len() as u64;
		self.objects.lock().unwrap().insert(key.to_string(), buf);
		Ok(len)
	}

	async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
		self.objects.lock().unwrap().remove(key);
		Ok(())
	}

	async fn head(&self, key: &str) -> Result<HeadResult, BlobStoreError> {
		if self.objects.lock().unwrap().contains_key(key) {
			Ok(HeadResult {
				headers: HashMap::new(),
				status_code: 200,
			})
		} else {
			Err(BlobStoreError::NotFound)
		}
	}

	fn expiration_date(&self, _headers: &HashMap<String, String>) -> Option<DateTime<Utc>> {
		None
	}

	fn public_url(&self, key: &str) -> String {
		format!("https://bucket.s3.amazonaws.com/{key}")
	}
}

#[tokio::test]
async fn successful_copy_transitions_status_to_present_and_writes_one_blob() {
	let server = MockServer::start().await;

	Mock::given(method("HEAD"))
		.and(path("/artifact.bin"))
		.respond_with(ResponseTemplate::new(200))
		.mount(&server)
		.await;

	Mock::given(method("GET"))
		.and(path("/artifact.bin"))
		.respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello world".to_vec()))
		.mount(&server)
		.await;

	let base = server.uri();
	let url = format!("{base}/artifact.bin");

	let status_store = Arc::new(InMemoryStatusStore::default());
	let blob_store = Arc::new(InMemoryBlobStore::default());
	let validator = Arc::new(
		UrlValidator::new(&[format!("^{}/.*", regex::escape(&base))], 5, false).unwrap(),
	);
	let metrics = Arc::new(MetricsRegistry::new());

	let worker = CopyWorker::new(
		"s3_us-west-1",
		status_store.clone() as Arc<dyn StatusStore>,
		blob_store.clone() as Arc<dyn BlobStore>,
		validator,
		metrics,
		3600,
	)
	.unwrap();

	let job = CopyJob::new("s3_us-west-1", &url);
	let acked = worker.handle(job).await;
	assert!(acked);

	let key = cache_key("s3_us-west-1", &url);
	let fields = status_store.get(&key).await.unwrap().expect("entry must exist");
	assert_eq!(fields.get("status").map(String::as_str), Some("present"));

	assert_eq!(*blob_store.put_count.lock().unwrap(), 1);

	let lock = lock_key(&key);
	assert!(status_store.get(&lock).await.unwrap().is_none(), "lock must be released");
}

#[tokio::test]
async fn concurrent_copy_of_the_same_url_results_in_exactly_one_blob_write() {
	let server = MockServer::start().await;

	Mock::given(method("HEAD"))
		.and(path("/artifact.bin"))
		.respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(50)))
		.mount(&server)
		.await;

	Mock::given(method("GET"))
		.and(path("/artifact.bin"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_bytes(b"hello world".to_vec())
				.set_delay(std::time::Duration::from_millis(50)),
		)
		.mount(&server)
		.await;

	let base = server.uri();
	let url = format!("{base}/artifact.bin");

	let status_store = Arc::new(InMemoryStatusStore::default());
	let blob_store = Arc::new(InMemoryBlobStore::default());
	let metrics = Arc::new(MetricsRegistry::new());

	let mut handles = Vec::new();
	for _ in 0..5 {
		let status_store = status_store.clone();
		let blob_store = blob_store.clone();
		let metrics = metrics.clone();
		let validator = Arc::new(
			UrlValidator::new(&[format!("^{}/.*", regex::escape(&base))], 5, false).unwrap(),
		);
		let url = url.clone();
		handles.push(tokio::spawn(async move {
			let worker = CopyWorker::new(
				"s3_us-west-1",
				status_store as Arc<dyn StatusStore>,
				blob_store as Arc<dyn BlobStore>,
				validator,
				metrics,
				3600,
			)
			.unwrap();
			worker.handle(CopyJob::new("s3_us-west-1", &url)).await
		}));
	}

	for h in handles {
		h.await.unwrap();
	}

	assert_eq!(
		*blob_store.put_count.lock().unwrap(),
		1,
		"single-flight must bound concurrent copies of the same url to one blob write"
	);
	assert!(metrics.concurrent_copy_already_locked_total.get() >= 1);
}
