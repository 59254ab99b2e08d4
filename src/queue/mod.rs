use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_sqs::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Errors from the Queue Adapter (spec §4.C). `Fatal` terminates the
/// process; the operator must fix credentials/permissions.
#[derive(Debug, Error)]
pub enum QueueError {
	#[error("queue authentication/API error: {0}")]
	Fatal(String),

	#[error("transient queue failure: {0}")]
	Transient(String),

	#[error("payload is not a JSON object")]
	NotAnObject,
}

/// `{pool_id, url, action: "put"}`, JSON-serialised (spec §3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyJob {
	pub id: String,
	pub url: String,
	pub action: String,
}

impl CopyJob {
	pub fn new(pool_id: impl Into<String>, url: impl Into<String>) -> Self {
		Self {
			id: pool_id.into(),
			url: url.into(),
			action: "put".to_string(),
		}
	}
}

#[async_trait]
pub trait QueueSender: Send + Sync + 'static {
	async fn send(&self, job: &CopyJob) -> Result<(), QueueError>;
}

#[async_trait]
pub trait QueueListener: Send + Sync + 'static {
	/// Long-lived consumer: fetch up to `batch_size` messages, process
	/// concurrently, ack on handler success, leave unacked on failure so
	/// redelivery/backoff is driven by the queue itself.
	async fn run<F, Fut>(&self, handler: F) -> Result<(), QueueError>
	where
		F: Fn(CopyJob) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = bool> + Send + 'static;

	/// Drains the dead-letter queue to emit metrics; receives raw bodies
	/// because a parse failure may have caused the dead-lettering.
	async fn run_dead_letter<F>(&self, handler: F) -> Result<(), QueueError>
	where
		F: Fn(String) + Send + Sync + 'static;

	async fn approximate_depth(&self) -> Result<(i32, i32), QueueError>;
}

/// SQS-backed queue: `initialize` provisions the dead-letter queue first,
/// then the primary queue bound to it via a redrive policy.
pub struct SqsQueue {
	client: Client,
	queue_url: String,
	dead_letter_url: String,
	batch_size: i32,
	visibility_timeout_secs: i32,
}

impl SqsQueue {
	/// Creates the dead-letter queue first, reads back its ARN, then
	/// creates the primary queue bound to it with the given redelivery cap.
	pub async fn initialize(
		client: Client,
		queue_name: &str,
		dead_letter_suffix: &str,
		max_receive_count: i32,
		visibility_timeout_secs: i32,
		batch_size: i32,
	) -> Result<Self, QueueError> {
		let dlq_name = format!("{queue_name}{dead_letter_suffix}");

		let dlq_create = client
			.create_queue()
			.queue_name(&dlq_name)
			.send()
			.await
			.map_err(|e| QueueError::Fatal(e.to_string()))?;
		let dead_letter_url = dlq_create
			.queue_url()
			.ok_or_else(|| QueueError::Fatal("dead-letter queue url missing".to_string()))?
			.to_string();

		let dlq_attrs = client
			.get_queue_attributes()
			.queue_url(&dead_letter_url)
			.attribute_names(aws_sdk_sqs::types::QueueAttributeName::QueueArn)
			.send()
			.await
			.map_err(|e| QueueError::Fatal(e.to_string()))?;
		let dlq_arn = dlq_attrs
			.attributes()
			.and_then(|a| a.get(&aws_sdk_sqs::types::QueueAttributeName::QueueArn))
			.ok_or_else(|| QueueError::Fatal("dead-letter queue arn missing".to_string()))?
			.to_string();

		let redrive_policy = serde_json::json!({
			"deadLetterTargetArn": dlq_arn,
			"maxReceiveCount": max_receive_count,
		})
		.to_string();

		let primary_create = client
			.create_queue()
			.queue_name(queue_name)
			.attributes(
				aws_sdk_sqs::types::QueueAttributeName::RedrivePolicy,
				redrive_policy,
			)
			.attributes(
				aws_sdk_sqs::types::QueueAttributeName::VisibilityTimeout,
				visibility_timeout_secs.to_string(),
			)
			.send()
			.await
			.map_err(|e| QueueError::Fatal(e.to_string()))?;
		let queue_url = primary_create
			.queue_url()
			.ok_or_else(|| QueueError::Fatal("primary queue url missing".to_string()))?
			.to_string();

		info!(queue_url, dead_letter_url, "queue initialized");

		Ok(Self {
			client,
			queue_url,
			dead_letter_url,
			batch_size,
			visibility_timeout_secs,
		})
	}

	pub fn queue_url(&self) -> &str {
		&self.queue_url
	}

	pub fn dead_letter_url(&self) -> &str {
		&self.dead_letter_url
	}
}

#[async_trait]
impl QueueSender for SqsQueue {
	async fn send(&self, job: &CopyJob) -> Result<(), QueueError> {
		let body = serde_json::to_string(job).map_err(|_| QueueError::NotAnObject)?;
		self.client
			.send_message()
			.queue_url(&self.queue_url)
			.message_body(body)
			.send()
			.await
			.map_err(|e| QueueError::Transient(e.to_string()))?;
		Ok(())
	}
}

#[async_trait]
impl QueueListener for SqsQueue {
	async fn run<F, Fut>(&self, handler: F) -> Result<(), QueueError>
	where
		F: Fn(CopyJob) -> Fut + Send + Sync + 'static,
		Fut: Future<Output = bool> + Send + 'static,
	{
		let handler = Arc::new(handler);
		loop {
			let received = self
				.client
				.receive_message()
				.queue_url(&self.queue_url)
				.max_number_of_messages(self.batch_size)
				.visibility_timeout(self.visibility_timeout_secs)
				.wait_time_seconds(5)
				.send()
				.await
				.map_err(|e| QueueError::Fatal(e.to_string()))?;

			let messages = received.messages.unwrap_or_default();
			if messages.is_empty() {
				continue;
			}

			let mut tasks = Vec::with_capacity(messages.len());
			for msg in messages {
				let client = self.client.clone();
				let queue_url = self.queue_url.clone();
				let handler = handler.clone();
				tasks.push(tokio::spawn(async move {
					let Some(body) = msg.body else { return };
					let Some(receipt) = msg.receipt_handle else { return };
					let job: CopyJob = match serde_json::from_str(&body) {
						Ok(j) => j,
						Err(e) => {
							warn!(error = %e, "dropping malformed queue message, will redeliver to DLQ eventually");
							return;
						}
					};

					let ok = handler(job).await;
					if ok {
						let _ = client
							.delete_message()
							.queue_url(&queue_url)
							.receipt_handle(receipt)
							.send()
							.await;
					}
				}));
			}
			for t in tasks {
				let _ = t.await;
			}
		}
	}

	async fn run_dead_letter<F>(&self, handler: F) -> Result<(), QueueError>
	where
		F: Fn(String) + Send + Sync + 'static,
	{
		loop {
			let received = self
				.client
				.receive_message()
				.queue_url(&self.dead_letter_url)
				.max_number_of_messages(self.batch_size)
				.wait_time_seconds(5)
				.send()
				.await
				.map_err(|e| QueueError::Fatal(e.to_string()))?;

			for msg in received.messages.unwrap_or_default() {
				if let Some(body) = msg.body {
					handler(body);
				}
				if let Some(receipt) = msg.receipt_handle {
					let _ = self
						.client
						.delete_message()
						.queue_url(&self.dead_letter_url)
						.receipt_handle(receipt)
						.send()
						.await;
				}
			}
		}
	}

	async fn approximate_depth(&self) -> Result<(i32, i32), QueueError> {
		let attrs = self
			.client
			.get_queue_attributes()
			.queue_url(&self.queue_url)
			.attribute_names(
				aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages,
			)
			.attribute_names(
				aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessagesNotVisible,
			)
			.send()
			.await
			.map_err(|e| QueueError::Transient(e.to_string()))?;

		let get = |name: aws_sdk_sqs::types::QueueAttributeName| -> i32 {
			attrs
				.attributes()
				.and_then(|a| a.get(&name))
				.and_then(|v| v.parse::<i32>().ok())
				.unwrap_or(0)
		};

		Ok((
			get(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages),
			get(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessagesNotVisible),
		))
	}
}

/// Periodic queue-depth probe, spawned once per fleet by the Fleet
/// Controller (spec §4.H).
pub async fn run_depth_probe(queue: Arc<SqsQueue>, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	loop {
		ticker.tick().await;
		match queue.approximate_depth().await {
			Ok((visible, in_flight)) => {
				tracing::debug!(visible, in_flight, "queue depth probe");
			}
			Err(e) => error!(error = %e, "queue depth probe failed"),
		}
	}
}

#[cfg(feature = "unit-tests")]
mod tests {
	use super::*;

	#[test]
	fn copy_job_serializes_with_put_action() {
		let job = CopyJob::new("s3_us-west-1", "https://example.com/x");
		let s = serde_json::to_string(&job).unwrap();
		assert!(s.contains("\"action\":\"put\""));
	}
}
