use std::sync::Arc;
use std::time::Duration;

use crate::cache_manager::CacheManager;
use crate::observability::MetricsRegistry;
use crate::validator::UrlValidator;

/// Application state passed to handlers via Axum's `State` extractor.
///
/// Holds the fleet-wide routing table (one `CacheManager` per pool_id),
/// the shared URL Validator used by the Redirect Service's first-poll
/// validation step, and the metrics registry.
#[derive(Clone)]
pub struct AppState {
	pub pools: Arc<Vec<(String, Arc<CacheManager>)>>,
	pub validator: Arc<UrlValidator>,
	pub metrics: Arc<MetricsRegistry>,
	pub max_wait_for_cached_copy: Duration,
}
