use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::AttributeValue;
use thiserror::Error;

/// Errors surfaced by the Status Store Adapter (spec §4.B). The adapter is
/// the only code that knows the external store's wire format.
#[derive(Debug, Error)]
pub enum StatusStoreError {
	#[error("status store unavailable: {0}")]
	Transient(String),

	#[error("conditional put failed: key already exists")]
	AlreadyLocked,
}

pub type StatusFields = HashMap<String, String>;

/// Narrow key/value contract over the external status store: get,
/// conditional put, delete, TTL. `get` returning a miss is an expected
/// outcome, never an error.
#[async_trait]
pub trait StatusStore: Send + Sync + 'static {
	async fn get(&self, key: &str) -> Result<Option<StatusFields>, StatusStoreError>;

	/// Atomic: fields and TTL are set together.
	async fn put(&self, key: &str, fields: StatusFields, ttl_secs: u64) -> Result<(), StatusStoreError>;

	/// Conditional put used for the single-flight lock (§4.E step 1):
	/// succeeds only if `key` does not already exist.
	async fn put_if_absent(
		&self,
		key: &str,
		fields: StatusFields,
		ttl_secs: u64,
	) -> Result<(), StatusStoreError>;

	async fn delete(&self, key: &str) -> Result<(), StatusStoreError>;
}

const PK_ATTR: &str = "pk";
const TTL_ATTR: &str = "expires_at";
const FIELD_PREFIX: &str = "f_";

/// DynamoDB-backed status store: a single table keyed by `pk`, a native
/// TTL attribute, and a conditional `attribute_not_exists(pk)` expression
/// for the single-flight lock.
pub struct DynamoStatusStore {
	client: Client,
	table_name: String,
}

impl DynamoStatusStore {
	pub fn new(client: Client, table_name: impl Into<String>) -> Self {
		Self {
			client,
			table_name: table_name.into(),
		}
	}

	fn now_epoch() -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or_default()
			.as_secs()
	}
}

#[async_trait]
impl StatusStore for DynamoStatusStore {
	async fn get(&self, key: &str) -> Result<Option<StatusFields>, StatusStoreError> {
		let out = self
			.client
			.get_item()
			.table_name(&self.table_name)
			.key(PK_ATTR, AttributeValue::S(key.to_string()))
			.send()
			.await
			.map_err(|e| StatusStoreError::Transient(e.to_string()))?;

		let Some(item) = out.item else {
			return Ok(None);
		};

		if let Some(AttributeValue::N(ts)) = item.get(TTL_ATTR) {
			if let Ok(expires) = ts.parse::<u64>() {
				if expires <= Self::now_epoch() {
					return Ok(None);
				}
			}
		}

		let mut fields = StatusFields::new();
		for (k, v) in item.iter() {
			if let Some(name) = k.strip_prefix(FIELD_PREFIX) {
				if let AttributeValue::S(s) = v {
					fields.insert(name.to_string(), s.clone());
				}
			}
		}
		Ok(Some(fields))
	}

	async fn put(&self, key: &str, fields: StatusFields, ttl_secs: u64) -> Result<(), StatusStoreError> {
		let mut req = self
			.client
			.put_item()
			.table_name(&self.table_name)
			.item(PK_ATTR, AttributeValue::S(key.to_string()))
			.item(
				TTL_ATTR,
				AttributeValue::N((Self::now_epoch() + ttl_secs).to_string()),
			);
		for (k, v) in fields {
			req = req.item(format!("{FIELD_PREFIX}{k}"), AttributeValue::S(v));
		}
		req.send()
			.await
			.map_err(|e| StatusStoreError::Transient(e.to_string()))?;
		Ok(())
	}

	async fn put_if_absent(
		&self,
		key: &str,
		fields: StatusFields,
		ttl_secs: u64,
	) -> Result<(), StatusStoreError> {
		let mut req = self
			.client
			.put_item()
			.table_name(&self.table_name)
			.item(PK_ATTR, AttributeValue::S(key.to_string()))
			.item(
				TTL_ATTR,
				AttributeValue::N((Self::now_epoch() + ttl_secs).to_string()),
			)
			.condition_expression(format!("attribute_not_exists({PK_ATTR})"));
		for (k, v) in fields {
			req = req.item(format!("{FIELD_PREFIX}{k}"), AttributeValue::S(v));
		}

		match req.send().await {
			Ok(_) => Ok(()),
			Err(e) => {
				if let Some(svc_err) = e.as_service_error() {
					if svc_err.is_conditional_check_failed_exception() {
						return Err(StatusStoreError::AlreadyLocked);
					}
				}
				Err(StatusStoreError::Transient(e.to_string()))
			}
		}
	}

	async fn delete(&self, key: &str) -> Result<(), StatusStoreError> {
		self.client
			.delete_item()
			.table_name(&self.table_name)
			.key(PK_ATTR, AttributeValue::S(key.to_string()))
			.send()
			.await
			.map_err(|e| StatusStoreError::Transient(e.to_string()))?;
		Ok(())
	}
}

/// Build the status-store cache key: `pool_id || "_" || percent_encode(url)`.
pub fn cache_key(pool_id: &str, url: &str) -> String {
	use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
	const FRAGMENT: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');
	format!("{pool_id}_{}", utf8_percent_encode(url, FRAGMENT))
}

/// Build the single-flight lock key for a cache key (spec §6).
pub fn lock_key(cache_key: &str) -> String {
	format!("LOCK-{cache_key}")
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn cache_key_is_pool_id_plus_percent_encoded_url() {
		let k = cache_key("s3_us-west-1", "https://example.com/a b");
		assert!(k.starts_with("s3_us-west-1_"));
		assert!(k.contains("%20"));
	}

	#[test]
	fn lock_key_has_lock_prefix() {
		assert_eq!(lock_key("foo"), "LOCK-foo");
	}
}
