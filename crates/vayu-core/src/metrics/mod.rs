use crate::error::VayuError;
use crate::model::{ErrorCode, ResponseSample, ResultRecord};
use crate::storage::Storage;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;
use uuid::Uuid;

const DEFAULT_SAMPLE_RATE: u64 = 100;
const DEFAULT_ERROR_CAP: usize = 10_000;
const DEFAULT_SUCCESS_SAMPLE_CAP: usize = 1_000;
const DEFAULT_RESPONSE_SAMPLE_CAP: usize = 1_000;

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Percentiles {
    pub min: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveStats {
    pub elapsed_seconds: f64,
    pub requests_completed: u64,
    pub requests_failed: u64,
    pub current_rps: f64,
    pub avg_latency_ms: f64,
    pub current_concurrency: u64,
    pub throughput: f64,
    pub send_rate: f64,
    pub status_codes: HashMap<u16, u64>,
}

/// Optimized for tens of thousands of concurrent insertions. The hot path
/// (`record_success` / `record_error`) touches only relaxed atomics; the
/// sampled vectors behind `Mutex`es are written to at most once per `rate`
/// calls, so contention on them stays low regardless of request volume.
pub struct MetricsCollector {
    run_id: Uuid,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_latency_sum_micros: AtomicU64,
    status_2xx: AtomicU64,
    status_3xx: AtomicU64,
    status_4xx: AtomicU64,
    status_5xx: AtomicU64,
    in_flight: AtomicU64,

    sample_rate: u64,
    sample_counter: AtomicU64,

    latencies: Mutex<Vec<f64>>,
    errors: Mutex<Vec<ResultRecord>>,
    success_results: Mutex<Vec<ResultRecord>>,
    response_samples: Mutex<Vec<ResponseSample>>,
    status_code_counts: Mutex<HashMap<u16, u64>>,

    error_cap: usize,
    success_sample_cap: usize,
    response_sample_cap: usize,

    last_snapshot: Mutex<(Instant, u64)>,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new(run_id: Uuid) -> Self {
        Self::with_sample_rate(run_id, DEFAULT_SAMPLE_RATE)
    }

    pub fn with_sample_rate(run_id: Uuid, sample_rate: u64) -> Self {
        let now = Instant::now();
        Self {
            run_id,
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_latency_sum_micros: AtomicU64::new(0),
            status_2xx: AtomicU64::new(0),
            status_3xx: AtomicU64::new(0),
            status_4xx: AtomicU64::new(0),
            status_5xx: AtomicU64::new(0),
            in_flight: AtomicU64::new(0),
            sample_rate: sample_rate.max(1),
            sample_counter: AtomicU64::new(0),
            latencies: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            success_results: Mutex::new(Vec::new()),
            response_samples: Mutex::new(Vec::new()),
            status_code_counts: Mutex::new(HashMap::new()),
            error_cap: DEFAULT_ERROR_CAP,
            success_sample_cap: DEFAULT_SUCCESS_SAMPLE_CAP,
            response_sample_cap: DEFAULT_RESPONSE_SAMPLE_CAP,
            last_snapshot: Mutex::new((now, 0)),
            started_at: now,
        }
    }

    pub fn request_started(&self) {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful completion. `O(1)`: atomic increments plus a
    /// mutex touch only when `fetch_add(1) % rate == 0` picks this one as a
    /// sample.
    pub fn record_success(&self, status_code: u16, latency_ms: f64, response_sample: Option<ResponseSample>) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_latency_sum_micros
            .fetch_add((latency_ms * 1000.0) as u64, Ordering::Release);
        self.bump_status_class(status_code);

        {
            let mut counts = self.status_code_counts.lock().expect("poisoned");
            *counts.entry(status_code).or_insert(0) += 1;
        }

        let should_sample = self.sample_counter.fetch_add(1, Ordering::Relaxed) % self.sample_rate == 0;
        if should_sample {
            self.push_capped(&self.latencies, latency_ms, usize::MAX);
            self.push_capped(
                &self.success_results,
                ResultRecord {
                    timestamp: Utc::now(),
                    status_code: Some(status_code),
                    latency_ms,
                    error_code: None,
                    error_message: None,
                    trace: None,
                },
                self.success_sample_cap,
            );
            if let Some(sample) = response_sample {
                self.push_capped(&self.response_samples, sample, self.response_sample_cap);
            }
        } else {
            self.latencies.lock().expect("poisoned").push(latency_ms);
        }
    }

    /// Records a failed request. Errors are never sampled — every one is
    /// kept, bounded only by `error_cap`.
    pub fn record_error(&self, error_code: ErrorCode, message: String, latency_ms: f64, status_code: Option<u16>) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.total_latency_sum_micros
            .fetch_add((latency_ms * 1000.0) as u64, Ordering::Release);
        if let Some(code) = status_code {
            self.bump_status_class(code);
            let mut counts = self.status_code_counts.lock().expect("poisoned");
            *counts.entry(code).or_insert(0) += 1;
        }

        self.push_capped(
            &self.errors,
            ResultRecord {
                timestamp: Utc::now(),
                status_code,
                latency_ms,
                error_code: Some(error_code),
                error_message: Some(message),
                trace: None,
            },
            self.error_cap,
        );
        self.latencies.lock().expect("poisoned").push(latency_ms);
    }

    fn bump_status_class(&self, status_code: u16) {
        let counter = match status_code {
            200..=299 => &self.status_2xx,
            300..=399 => &self.status_3xx,
            400..=499 => &self.status_4xx,
            500..=599 => &self.status_5xx,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn push_capped<T>(&self, bucket: &Mutex<Vec<T>>, value: T, cap: usize) {
        let mut guard = bucket.lock().expect("poisoned");
        if guard.len() < cap {
            guard.push(value);
        }
        // At cap: drop-and-keep-counting. `sample_counter` above continues
        // to advance regardless, so the 1-in-N sampling cadence never skews.
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Post-run only: sorts the latencies vector once. Callers must ensure
    /// no further `record_*` calls are in flight (guaranteed by the run
    /// lifecycle reaching a terminal state before this is invoked).
    pub fn calculate_percentiles(&self) -> Percentiles {
        let mut sorted = self.latencies.lock().expect("poisoned").clone();
        if sorted.is_empty() {
            return Percentiles { min: 0.0, p50: 0.0, p75: 0.0, p90: 0.0, p95: 0.0, p99: 0.0, p999: 0.0, max: 0.0 };
        }
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let at = |p: f64| -> f64 {
            let idx = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
            let idx = idx.saturating_sub(1).min(sorted.len() - 1);
            sorted[idx]
        };
        Percentiles {
            min: sorted[0],
            p50: at(50.0),
            p75: at(75.0),
            p90: at(90.0),
            p95: at(95.0),
            p99: at(99.0),
            p999: at(99.9),
            max: sorted[sorted.len() - 1],
        }
    }

    /// Live snapshot for SSE/polling consumers. `current_rps` differentiates
    /// `total_requests` between this call and the last one.
    pub fn live_stats(&self) -> LiveStats {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.total_errors.load(Ordering::Acquire);
        let sum_micros = self.total_latency_sum_micros.load(Ordering::Acquire);

        let (current_rps, elapsed_seconds) = {
            let mut last = self.last_snapshot.lock().expect("poisoned");
            let now = Instant::now();
            let dt = now.duration_since(last.0).as_secs_f64();
            let rps = if dt > 0.0 { (total.saturating_sub(last.1)) as f64 / dt } else { 0.0 };
            *last = (now, total);
            (rps, self.started_at.elapsed().as_secs_f64())
        };

        let avg_latency_ms = if total > 0 { (sum_micros as f64 / 1000.0) / total as f64 } else { 0.0 };
        let throughput = if elapsed_seconds > 0.0 { total as f64 / elapsed_seconds } else { 0.0 };

        LiveStats {
            elapsed_seconds,
            requests_completed: total.saturating_sub(failed),
            requests_failed: failed,
            current_rps,
            avg_latency_ms,
            current_concurrency: self.in_flight.load(Ordering::Relaxed),
            throughput,
            send_rate: current_rps,
            status_codes: self.status_code_counts.lock().expect("poisoned").clone(),
        }
    }

    pub fn status_class_counts(&self) -> (u64, u64, u64, u64) {
        (
            self.status_2xx.load(Ordering::Relaxed),
            self.status_3xx.load(Ordering::Relaxed),
            self.status_4xx.load(Ordering::Relaxed),
            self.status_5xx.load(Ordering::Relaxed),
        )
    }

    /// Estimated resident memory of the sampled buffers, for admin
    /// introspection.
    pub fn memory_estimate_bytes(&self) -> usize {
        let latencies = self.latencies.lock().expect("poisoned").len() * std::mem::size_of::<f64>();
        let errors = self.errors.lock().expect("poisoned").len() * std::mem::size_of::<ResultRecord>();
        let successes = self.success_results.lock().expect("poisoned").len() * std::mem::size_of::<ResultRecord>();
        let samples = self.response_samples.lock().expect("poisoned").len() * std::mem::size_of::<ResponseSample>();
        latencies + errors + successes + samples
    }

    /// Single-transaction flush: errors + sampled successes as a combined
    /// results batch, plus the status-code/percentile histogram row, into
    /// Storage.
    pub async fn flush(&self, storage: &Storage) -> Result<(), VayuError> {
        let mut batch = self.errors.lock().expect("poisoned").clone();
        batch.extend(self.success_results.lock().expect("poisoned").iter().cloned());
        let status_codes = self.status_code_counts.lock().expect("poisoned").clone();
        let percentiles = self.calculate_percentiles();
        storage.flush_run_results(self.run_id, batch, status_codes, percentiles).await
    }
}
