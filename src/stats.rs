use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::classify::Category;

// One hour, in milliseconds. Slower samples are clamped.
const MAX_TRACKED_MS: u64 = 3_600_000;

#[derive(Debug)]
pub struct ChatStats {
    pub request_count: AtomicU64,
    pub cached_count: AtomicU64,
    pub error_count: AtomicU64,
    errors_by_code: DashMap<&'static str, u64>,
    query_types: DashMap<Category, u64>,
    // Processing time in milliseconds
    latency_ms: Mutex<Histogram<u64>>,
    started: Instant,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub cached_responses: u64,
    pub average_response_time: u64,
    pub p95_response_time: u64,
    pub error_rate: String,
    pub errors_by_code: BTreeMap<String, u64>,
    pub query_type_distribution: BTreeMap<String, u64>,
    pub uptime_seconds: u64,
}

impl ChatStats {
    pub fn new() -> Result<Self, hdrhistogram::CreationError> {
        Ok(Self {
            request_count: AtomicU64::new(0),
            cached_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            errors_by_code: DashMap::new(),
            query_types: DashMap::new(),
            latency_ms: Mutex::new(Histogram::new_with_bounds(1, MAX_TRACKED_MS, 3)?),
            started: Instant::now(),
        })
    }

    pub fn record_success(&self, category: Category, cached: bool, elapsed: Duration) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if cached {
            self.cached_count.fetch_add(1, Ordering::Relaxed);
        }
        *self.query_types.entry(category).or_insert(0) += 1;

        let ms = (elapsed.as_millis() as u64).clamp(1, MAX_TRACKED_MS);
        if let Ok(mut histogram) = self.latency_ms.lock() {
            histogram.saturating_record(ms);
        }
    }

    pub fn record_failure(&self, code: &'static str) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.error_count.fetch_add(1, Ordering::Relaxed);
        *self.errors_by_code.entry(code).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total = self.request_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let error_rate = if total == 0 {
            "0%".to_string()
        } else {
            format!("{:.2}%", errors as f64 / total as f64 * 100.0)
        };

        let (average, p95) = match self.latency_ms.lock() {
            Ok(h) if h.len() > 0 => (h.mean().round() as u64, h.value_at_quantile(0.95)),
            _ => (0, 0),
        };

        StatsSnapshot {
            total_requests: total,
            cached_responses: self.cached_count.load(Ordering::Relaxed),
            average_response_time: average,
            p95_response_time: p95,
            error_rate,
            errors_by_code: self
                .errors_by_code
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            query_type_distribution: self
                .query_types
                .iter()
                .map(|e| (e.key().to_string(), *e.value()))
                .collect(),
            uptime_seconds: self.started.elapsed().as_secs(),
        }
    }
}
