use crate::core::ShardId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    started: Instant,
    total: u64,
    failed: u64,
}

/// Query outcomes over a sliding time window, kept as fixed-width buckets.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    span: Duration,
    bucket_width: Duration,
    buckets: VecDeque<Bucket>,
}

impl RollingWindow {
    pub fn new(span: Duration) -> Self {
        let span = span.max(Duration::from_millis(100));
        Self {
            span,
            bucket_width: (span / 10).max(Duration::from_millis(10)),
            buckets: VecDeque::new(),
        }
    }

    pub fn record(&mut self, now: Instant, failed: bool) {
        self.prune(now);
        let start_new = match self.buckets.back() {
            Some(last) => now.duration_since(last.started) >= self.bucket_width,
            None => true,
        };
        if start_new {
            self.buckets.push_back(Bucket {
                started: now,
                total: 0,
                failed: 0,
            });
        }
        if let Some(bucket) = self.buckets.back_mut() {
            bucket.total += 1;
            if failed {
                bucket.failed += 1;
            }
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.buckets.front() {
            if now.duration_since(front.started) > self.span {
                self.buckets.pop_front();
            } else {
                break;
            }
        }
    }

    /// `(error_rate, queries_per_second)` over the live part of the window.
    pub fn rates(&mut self, now: Instant) -> (f64, f64) {
        self.prune(now);
        let (total, failed) = self
            .buckets
            .iter()
            .fold((0u64, 0u64), |(t, f), b| (t + b.total, f + b.failed));
        if total == 0 {
            return (0.0, 0.0);
        }
        let observed = self
            .buckets
            .front()
            .map(|b| now.duration_since(b.started))
            .unwrap_or_default()
            .clamp(Duration::from_secs(1), self.span);
        (
            failed as f64 / total as f64,
            total as f64 / observed.as_secs_f64(),
        )
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }
}

/// Cumulative query counters for one shard.
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    total_queries: u64,
    failed_queries: u64,
    total_latency: Duration,
    min_latency: Option<Duration>,
    max_latency: Duration,
    window_started: Instant,
    window_started_at: DateTime<Utc>,
    rolling: RollingWindow,
}

/// Point-in-time view of [`ShardMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub shard_id: ShardId,
    pub total_queries: u64,
    pub failed_queries: u64,
    pub error_rate: f64,
    pub average_latency_ms: f64,
    pub min_latency_ms: f64,
    pub max_latency_ms: f64,
    pub queries_per_second: f64,
    pub window_started_at: DateTime<Utc>,
}

impl ShardMetrics {
    pub fn new(error_window: Duration) -> Self {
        Self {
            total_queries: 0,
            failed_queries: 0,
            total_latency: Duration::ZERO,
            min_latency: None,
            max_latency: Duration::ZERO,
            window_started: Instant::now(),
            window_started_at: Utc::now(),
            rolling: RollingWindow::new(error_window),
        }
    }

    pub fn record(&mut self, latency: Duration, failed: bool) {
        self.total_queries += 1;
        if failed {
            self.failed_queries += 1;
        }
        self.total_latency += latency;
        self.min_latency = Some(self.min_latency.map_or(latency, |min| min.min(latency)));
        self.max_latency = self.max_latency.max(latency);
        self.rolling.record(Instant::now(), failed);
    }

    /// Error rate and QPS over the recent window, used for classification.
    pub fn rolling_rates(&mut self) -> (f64, f64) {
        self.rolling.rates(Instant::now())
    }

    pub fn snapshot(&self, shard_id: ShardId) -> MetricsSnapshot {
        let ms = |d: Duration| d.as_secs_f64() * 1000.0;
        let (error_rate, average_latency_ms) = if self.total_queries == 0 {
            (0.0, 0.0)
        } else {
            (
                self.failed_queries as f64 / self.total_queries as f64,
                ms(self.total_latency) / self.total_queries as f64,
            )
        };
        let elapsed = self.window_started.elapsed().as_secs_f64();
        let queries_per_second = if elapsed > 0.0 {
            self.total_queries as f64 / elapsed
        } else {
            0.0
        };

        MetricsSnapshot {
            shard_id,
            total_queries: self.total_queries,
            failed_queries: self.failed_queries,
            error_rate,
            average_latency_ms,
            min_latency_ms: self.min_latency.map(ms).unwrap_or(0.0),
            max_latency_ms: ms(self.max_latency),
            queries_per_second,
            window_started_at: self.window_started_at,
        }
    }

    /// Zeroes every counter and restarts the window.
    pub fn reset(&mut self) {
        let span = self.rolling.span;
        *self = Self::new(span);
    }
}
