use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::blob::S3BlobStore;
use crate::cache_manager::CacheManager;
use crate::config::Settings;
use crate::copy_worker::CopyWorker;
use crate::observability::MetricsRegistry;
use crate::queue::{QueueError, QueueListener, SqsQueue, run_depth_probe};
use crate::status_store::DynamoStatusStore;
use crate::validator::UrlValidator;

/// One region's worth of wired adapters: a Blob Store, a Cache Manager,
/// a Queue Sender, and `workers_per_region` Copy Workers bound to the
/// same queue (spec §4.H).
pub struct RegionGroup {
	pub pool_id: String,
	pub cache_manager: Arc<CacheManager>,
}

/// Builds and runs one region group per configured region; starts the
/// dead-letter listener and the periodic queue-depth probe.
pub struct FleetController {
	pub groups: Vec<RegionGroup>,
}

impl FleetController {
	pub async fn build(
		settings: &Settings,
		service_name: &str,
		metrics: Arc<MetricsRegistry>,
	) -> anyhow::Result<Self> {
		let mut aws_cfg_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
		if let Some(region) = &settings.aws_region {
			aws_cfg_loader = aws_cfg_loader.region(aws_config::Region::new(region.clone()));
		}
		if let Some(endpoint) = &settings.aws_endpoint_url {
			aws_cfg_loader = aws_cfg_loader.endpoint_url(endpoint.clone());
		}
		let aws_cfg = aws_cfg_loader.load().await;

		let dynamo_client = aws_sdk_dynamodb::Client::new(&aws_cfg);
		let sqs_client = aws_sdk_sqs::Client::new(&aws_cfg);
		let s3_client = aws_sdk_s3::Client::new(&aws_cfg);

		let mut groups = Vec::with_capacity(settings.regions.len());
		let mut seen_pool_ids = HashSet::with_capacity(settings.regions.len());

		for region in &settings.regions {
			let pool_id = format!("{service_name}_{region}");
			if !seen_pool_ids.insert(pool_id.clone()) {
				anyhow::bail!(
					"duplicate pool '{pool_id}': region '{region}' is configured more than once"
				);
			}
			let bucket = settings.bucket_name_for(region);

			let blob_store = Arc::new(S3BlobStore::new(
				s3_client.clone(),
				bucket.clone(),
				region.clone(),
				settings.multipart_part_size_bytes,
				Duration::from_secs(60 * 60),
			));
			blob_store.initialize(settings.bucket_lifespan_days).await?;

			let status_store = Arc::new(DynamoStatusStore::new(
				dynamo_client.clone(),
				format!("cloud-mirror-status-{region}"),
			));

			let queue = Arc::new(
				SqsQueue::initialize(
					sqs_client.clone(),
					&pool_id,
					&settings.queue_dead_letter_suffix,
					settings.queue_max_receive_count,
					settings.queue_visibility_timeout_secs,
					settings.queue_batch_size,
				)
				.await?,
			);

			let validator = Arc::new(UrlValidator::new(
				&settings.allowlist,
				settings.redirect_limit,
				settings.ensure_ssl,
			)?);

			let cache_manager = Arc::new(CacheManager::new(
				pool_id.clone(),
				status_store.clone(),
				blob_store.clone() as Arc<dyn crate::blob::BlobStore>,
				queue.clone() as Arc<dyn crate::queue::QueueSender>,
				metrics.clone(),
				settings.cache_ttl_secs,
			)?);

			for worker_idx in 0..settings.workers_per_region {
				let worker = CopyWorker::new(
					pool_id.clone(),
					status_store.clone() as Arc<dyn crate::status_store::StatusStore>,
					blob_store.clone() as Arc<dyn crate::blob::BlobStore>,
					validator.clone(),
					metrics.clone(),
					settings.cache_ttl_secs,
				)?;
				let worker = Arc::new(worker);
				let queue_for_worker = queue.clone();
				let region_for_log = region.clone();
				tokio::spawn(async move {
					let worker = worker.clone();
					let result = queue_for_worker
						.run(move |job| {
							let worker = worker.clone();
							async move { worker.handle(job).await }
						})
						.await;
					if let Err(e) = result {
						error!(region = %region_for_log, worker_idx, error = %e, "copy worker queue listener exited");
						if matches!(e, QueueError::Fatal(_)) {
							std::process::exit(1);
						}
					}
				});
			}

			let dlq_metrics = metrics.clone();
			let dlq_queue = queue.clone();
			let region_for_dlq = region.clone();
			tokio::spawn(async move {
				let result = dlq_queue
					.run_dead_letter(move |_body| {
						dlq_metrics.dead_letters_total.inc();
					})
					.await;
				if let Err(e) = result {
					error!(region = %region_for_dlq, error = %e, "dead-letter listener exited");
					if matches!(e, QueueError::Fatal(_)) {
						std::process::exit(1);
					}
				}
			});

			tokio::spawn(run_depth_probe(queue.clone(), Duration::from_secs(30)));

			info!(pool_id, region, bucket, "region group started");
			groups.push(RegionGroup { pool_id, cache_manager });
		}

		Ok(Self { groups })
	}
}
