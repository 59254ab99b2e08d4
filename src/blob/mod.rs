use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
	BucketLifecycleConfiguration, ExpirationStatus, LifecycleExpiration, LifecycleRule,
	LifecycleRuleFilter, AbortIncompleteMultipartUpload,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{info, warn};

/// A boxed byte stream, as produced by `reqwest::Response::bytes_stream()`.
/// Letting the Copy Worker hand this straight to the Blob Store Adapter is
/// what keeps an origin body from ever being buffered whole in memory.
pub type ByteChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Errors from the Blob Store Adapter (spec §4.D).
#[derive(Debug, Error)]
pub enum BlobStoreError {
	#[error("blob store unavailable: {0}")]
	Transient(String),

	#[error("upload exceeded the maximum wall-clock watchdog")]
	UploadTimedOut,

	#[error("object not found")]
	NotFound,
}

#[derive(Debug, Default, Clone)]
pub struct PutHeaders {
	pub content_type: String,
	pub content_disposition: Option<String>,
	pub content_encoding: Option<String>,
	pub content_md5: Option<String>,
	pub content_length: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct HeadResult {
	pub headers: HashMap<String, String>,
	pub status_code: u16,
}

/// Streaming multipart put, delete, head, TTL introspection, public URL
/// construction. Implementations know nothing about the caller's retry
/// policy; they report what happened and let the Copy Worker decide.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
	/// Streams `body` straight into the store without buffering it whole
	/// in memory first; returns the number of bytes actually written.
	async fn put(
		&self,
		key: &str,
		body: ByteChunkStream,
		headers: PutHeaders,
		metadata: HashMap<String, String>,
	) -> Result<u64, BlobStoreError>;

	async fn delete(&self, key: &str) -> Result<(), BlobStoreError>;

	async fn head(&self, key: &str) -> Result<HeadResult, BlobStoreError>;

	/// Parses the store's per-object expiration signal out of `head` headers.
	fn expiration_date(&self, headers: &HashMap<String, String>) -> Option<DateTime<Utc>>;

	/// Deterministic, no network call.
	fn public_url(&self, key: &str) -> String;
}

pub struct S3BlobStore {
	client: Client,
	bucket: String,
	region: String,
	part_size_bytes: u64,
	upload_watchdog: Duration,
}

impl S3BlobStore {
	pub fn new(
		client: Client,
		bucket: impl Into<String>,
		region: impl Into<String>,
		part_size_bytes: u64,
		upload_watchdog: Duration,
	) -> Self {
		Self {
			client,
			bucket: bucket.into(),
			region: region.into(),
			part_size_bytes,
			upload_watchdog,
		}
	}

	/// Ensures the bucket exists and carries the lifecycle policy described
	/// in §4.D: expire objects after `lifespan_days`, abort incomplete
	/// multipart uploads after 1 day. "Already exists / already owned" is
	/// treated as success.
	pub async fn initialize(&self, lifespan_days: u32) -> Result<(), BlobStoreError> {
		match self.client.create_bucket().bucket(&self.bucket).send().await {
			Ok(_) => {}
			Err(e) => {
				let msg = e.to_string();
				if !msg.contains("BucketAlreadyOwnedByYou") && !msg.contains("BucketAlreadyExists")
				{
					return Err(BlobStoreError::Transient(msg));
				}
			}
		}

		let rule = LifecycleRule::builder()
			.id("cloud-mirror-expiry")
			.status(ExpirationStatus::Enabled)
			.filter(LifecycleRuleFilter::Prefix(String::new()))
			.expiration(
				LifecycleExpiration::builder()
					.days(lifespan_days as i32)
					.build(),
			)
			.abort_incomplete_multipart_upload(
				AbortIncompleteMultipartUpload::builder()
					.days_after_initiation(1)
					.build(),
			)
			.build()
			.map_err(|e| BlobStoreError::Transient(e.to_string()))?;

		self.client
			.put_bucket_lifecycle_configuration()
			.bucket(&self.bucket)
			.lifecycle_configuration(
				BucketLifecycleConfiguration::builder().rules(rule).build().map_err(|e| {
					BlobStoreError::Transient(e.to_string())
				})?,
			)
			.send()
			.await
			.map_err(|e| BlobStoreError::Transient(e.to_string()))?;

		info!(bucket = %self.bucket, lifespan_days, "blob store bucket initialized");
		Ok(())
	}

	/// Streams `source` straight into an S3 multipart upload, bounded by a
	/// hard watchdog on total wall-clock time (spec §4.D, §5 cancellation).
	async fn upload_multipart(
		&self,
		key: &str,
		mut source: ByteChunkStream,
		headers: PutHeaders,
		metadata: HashMap<String, String>,
	) -> Result<u64, BlobStoreError> {
		let upload = timeout(self.upload_watchdog, async {
			let create = self
				.client
				.create_multipart_upload()
				.bucket(&self.bucket)
				.key(key)
				.content_type(&headers.content_type)
				.set_metadata(Some(metadata))
				.send()
				.await
				.map_err(|e| BlobStoreError::Transient(e.to_string()))?;

			let upload_id = create
				.upload_id()
				.ok_or_else(|| BlobStoreError::Transient("missing upload id".to_string()))?
				.to_string();

			let result = async {
				let mut parts = Vec::new();
				let mut part_number = 1i32;
				let mut buf: Vec<u8> = Vec::with_capacity(self.part_size_bytes as usize);
				let mut total: u64 = 0;

				macro_rules! flush_part {
					() => {{
						if !buf.is_empty() {
							let body = ByteStream::from(std::mem::take(&mut buf));
							let part = self
								.client
								.upload_part()
								.bucket(&self.bucket)
								.key(key)
								.upload_id(&upload_id)
								.part_number(part_number)
								.body(body)
								.send()
								.await
								.map_err(|e| BlobStoreError::Transient(e.to_string()))?;
							parts.push(
								aws_sdk_s3::types::CompletedPart::builder()
									.part_number(part_number)
									.e_tag(part.e_tag().unwrap_or_default())
									.build(),
							);
							part_number += 1;
						}
					}};
				}

				while let Some(chunk) = source.next().await {
					let chunk = chunk.map_err(|e| BlobStoreError::Transient(e.to_string()))?;
					total += chunk.len() as u64;
					buf.extend_from_slice(&chunk);
					if buf.len() as u64 >= self.part_size_bytes {
						flush_part!();
					}
				}
				flush_part!();

				self.client
					.complete_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(&upload_id)
					.multipart_upload(
						aws_sdk_s3::types::CompletedMultipartUpload::builder()
							.set_parts(Some(parts))
							.build(),
					)
					.send()
					.await
					.map_err(|e| BlobStoreError::Transient(e.to_string()))?;

				Ok::<u64, BlobStoreError>(total)
			}
			.await;

			if result.is_err() {
				let _ = self
					.client
					.abort_multipart_upload()
					.bucket(&self.bucket)
					.key(key)
					.upload_id(&upload_id)
					.send()
					.await;
			}

			result
		})
		.await;

		match upload {
			Ok(r) => r,
			Err(_) => {
				warn!(key, "upload watchdog fired, aborting multipart upload");
				Err(BlobStoreError::UploadTimedOut)
			}
		}
	}
}

#[async_trait]
impl BlobStore for S3BlobStore {
	async fn put(
		&self,
		key: &str,
		body: ByteChunkStream,
		headers: PutHeaders,
		metadata: HashMap<String, String>,
	) -> Result<u64, BlobStoreError> {
		self.upload_multipart(key, body, headers, metadata).await
	}

	async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
		self.client
			.delete_object()
			.bucket(&self.bucket)
			.key(key)
			.send()
			.await
			.map_err(|e| BlobStoreError::Transient(e.to_string()))?;
		Ok(())
	}

	async fn head(&self, key: &str) -> Result<HeadResult, BlobStoreError> {
		match self.client.head_object().bucket(&self.bucket).key(key).send().await {
			Ok(out) => {
				let mut headers = HashMap::new();
				if let Some(ct) = out.content_type() {
					headers.insert("content-type".to_string(), ct.to_string());
				}
				if let Some(meta) = out.metadata() {
					for (k, v) in meta.iter() {
						headers.insert(k.clone(), v.clone());
					}
				}
				Ok(HeadResult {
					headers,
					status_code: 200,
				})
			}
			Err(e) => {
				if e.as_service_error().map(|s| s.is_not_found()).unwrap_or(false) {
					Err(BlobStoreError::NotFound)
				} else {
					Err(BlobStoreError::Transient(e.to_string()))
				}
			}
		}
	}

	fn expiration_date(&self, headers: &HashMap<String, String>) -> Option<DateTime<Utc>> {
		headers
			.get("cloud-mirror-expiration")
			.and_then(|v| DateTime::parse_from_rfc3339(v).ok())
			.map(|d| d.with_timezone(&Utc))
	}

	fn public_url(&self, key: &str) -> String {
		format!(
			"https://{}.s3-{}.amazonaws.com/{}",
			self.bucket, self.region, key
		)
	}
}

/// Namespaced metadata keys attached to every copied object (spec §6).
pub mod metadata_keys {
	pub const UPSTREAM_ETAG: &str = "cloud-mirror-upstream-etag";
	pub const UPSTREAM_CONTENT_LENGTH: &str = "cloud-mirror-upstream-content-length";
	pub const UPSTREAM_URL: &str = "cloud-mirror-upstream-url";
	pub const STORED: &str = "cloud-mirror-stored";
	pub const ADDRESSES: &str = "cloud-mirror-addresses";
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn public_url_is_deterministic_and_makes_no_network_call() {
		let store = S3BlobStore::new(
			aws_sdk_s3::Client::new(&aws_config::SdkConfig::builder().build()),
			"cloud-mirror-us-west-1",
			"us-west-1",
			8 * 1024 * 1024,
			Duration::from_secs(3600),
		);
		let url = store.public_url("https://example.com/a");
		assert_eq!(
			url,
			"https://cloud-mirror-us-west-1.s3-us-west-1.amazonaws.com/https://example.com/a"
		);
	}
}
