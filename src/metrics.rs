//! In-process statistics for the anomaly detection pipeline.

use crate::types::fraud::{ModelSource, RiskLevel};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::info;

const MAX_SAMPLES: usize = 10_000;

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

fn push_sample(samples: &RwLock<Vec<u64>>, duration: Duration) {
    let mut samples = write(samples);
    samples.push(duration.as_micros() as u64);
    // Keep only the most recent half once full
    if samples.len() > MAX_SAMPLES {
        samples.drain(0..MAX_SAMPLES / 2);
    }
}

/// Metrics collector for pipeline activity
pub struct PipelineMetrics {
    /// Events decoded from the feed
    pub transactions_received: AtomicU64,
    /// Payloads skipped because they could not be decoded
    pub decode_failures: AtomicU64,
    pub batches_processed: AtomicU64,
    pub transactions_scored: AtomicU64,
    /// Transactions no model could score
    pub transactions_unscored: AtomicU64,
    pub anomalies_detected: AtomicU64,
    pub models_trained: AtomicU64,
    pub training_failures: AtomicU64,
    /// Fraud records that could not be persisted
    pub persistence_failures: AtomicU64,
    anomalies_by_level: RwLock<HashMap<RiskLevel, u64>>,
    anomalies_by_source: RwLock<HashMap<ModelSource, u64>>,
    /// Batch processing times (in microseconds)
    batch_times: RwLock<Vec<u64>>,
    /// User model training times (in microseconds)
    training_times: RwLock<Vec<u64>>,
    /// Anomaly score distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    start_time: Instant,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self {
            transactions_received: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            batches_processed: AtomicU64::new(0),
            transactions_scored: AtomicU64::new(0),
            transactions_unscored: AtomicU64::new(0),
            anomalies_detected: AtomicU64::new(0),
            models_trained: AtomicU64::new(0),
            training_failures: AtomicU64::new(0),
            persistence_failures: AtomicU64::new(0),
            anomalies_by_level: RwLock::new(HashMap::new()),
            anomalies_by_source: RwLock::new(HashMap::new()),
            batch_times: RwLock::new(Vec::with_capacity(1000)),
            training_times: RwLock::new(Vec::with_capacity(100)),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
        }
    }

    pub fn record_received(&self) {
        self.transactions_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed batch
    pub fn record_batch(&self, processing_time: Duration, unscored: usize) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.transactions_unscored
            .fetch_add(unscored as u64, Ordering::Relaxed);
        push_sample(&self.batch_times, processing_time);
    }

    /// Record one scored transaction
    pub fn record_score(&self, score: f64) {
        self.transactions_scored.fetch_add(1, Ordering::Relaxed);
        let bucket = (score.clamp(0.0, 1.0) * 10.0).min(9.0) as usize;
        write(&self.score_buckets)[bucket] += 1;
    }

    pub fn record_anomaly(&self, risk_level: RiskLevel, source: ModelSource) {
        self.anomalies_detected.fetch_add(1, Ordering::Relaxed);
        *write(&self.anomalies_by_level).entry(risk_level).or_insert(0) += 1;
        *write(&self.anomalies_by_source).entry(source).or_insert(0) += 1;
    }

    pub fn record_training(&self, duration: Duration, succeeded: bool) {
        if succeeded {
            self.models_trained.fetch_add(1, Ordering::Relaxed);
            push_sample(&self.training_times, duration);
        } else {
            self.training_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_persistence_failures(&self, count: usize) {
        self.persistence_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn get_batch_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&read(&self.batch_times))
    }

    pub fn get_training_stats(&self) -> LatencyStats {
        LatencyStats::from_samples(&read(&self.training_times))
    }

    /// Current throughput (transactions per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.transactions_received.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_score_distribution(&self) -> [u64; 10] {
        *read(&self.score_buckets)
    }

    pub fn get_anomalies_by_level(&self) -> HashMap<RiskLevel, u64> {
        read(&self.anomalies_by_level).clone()
    }

    pub fn get_anomalies_by_source(&self) -> HashMap<ModelSource, u64> {
        read(&self.anomalies_by_source).clone()
    }

    /// Print summary statistics
    pub fn print_summary(&self) {
        let received = self.transactions_received.load(Ordering::Relaxed);
        let scored = self.transactions_scored.load(Ordering::Relaxed);
        let anomalies = self.anomalies_detected.load(Ordering::Relaxed);
        let anomaly_rate = if scored > 0 {
            (anomalies as f64 / scored as f64) * 100.0
        } else {
            0.0
        };

        let batches = self.get_batch_stats();
        let training = self.get_training_stats();
        let by_level = self.get_anomalies_by_level();
        let by_source = self.get_anomalies_by_source();
        let score_dist = self.get_score_distribution();

        info!("╔══════════════════════════════════════════════════════════════╗");
        info!("║          ANOMALY DETECTION PIPELINE - METRICS SUMMARY        ║");
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Transactions Received: {:>8}  │  Throughput: {:>6.1} tx/s  ║",
            received,
            self.get_throughput()
        );
        info!(
            "║ Anomalies Detected:    {:>8}  │  Anomaly Rate: {:>5.1}%    ║",
            anomalies, anomaly_rate
        );
        info!(
            "║ Unscored: {:>6}  Decode failures: {:>6}  Persist failures: {:>4} ║",
            self.transactions_unscored.load(Ordering::Relaxed),
            self.decode_failures.load(Ordering::Relaxed),
            self.persistence_failures.load(Ordering::Relaxed)
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!(
            "║ Batch Time (μs): mean={:>6} p50={:>6} p95={:>6} p99={:>6} ║",
            batches.mean_us, batches.p50_us, batches.p95_us, batches.p99_us
        );
        info!(
            "║ User Models: trained={:>5} failed={:>5} mean={:>8}μs        ║",
            self.models_trained.load(Ordering::Relaxed),
            self.training_failures.load(Ordering::Relaxed),
            training.mean_us
        );
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Anomalies by Risk Level:                                     ║");
        for level in [RiskLevel::High, RiskLevel::Medium, RiskLevel::Low] {
            let count = by_level.get(&level).copied().unwrap_or(0);
            let pct = if anomalies > 0 {
                (count as f64 / anomalies as f64) * 100.0
            } else {
                0.0
            };
            info!("║   {:10}: {:>6} ({:>5.1}%)                                ║", level.as_str(), count, pct);
        }
        info!("║ Anomalies by Model:                                          ║");
        for source in [ModelSource::User, ModelSource::Global] {
            let count = by_source.get(&source).copied().unwrap_or(0);
            info!("║   {:10}: {:>6}                                         ║", source.as_str(), count);
        }
        info!("╠══════════════════════════════════════════════════════════════╣");
        info!("║ Anomaly Score Distribution:                                  ║");
        let total: u64 = score_dist.iter().sum();
        for (i, &count) in score_dist.iter().enumerate() {
            let pct = if total > 0 { (count as f64 / total as f64) * 100.0 } else { 0.0 };
            let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
            info!(
                "║   {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                i as f64 / 10.0,
                (i + 1) as f64 / 10.0,
                count,
                pct,
                bar
            );
        }
        info!("╚══════════════════════════════════════════════════════════════╝");
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency percentiles over recorded samples
#[derive(Debug, Default, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

impl LatencyStats {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut sorted = samples.to_vec();
        sorted.sort_unstable();
        let count = sorted.len();
        let at = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        Self {
            count: count as u64,
            mean_us: sorted.iter().sum::<u64>() / count as u64,
            p50_us: at(0.5),
            p95_us: at(0.95),
            p99_us: at(0.99),
            max_us: sorted[count - 1],
        }
    }
}

/// Real-time metrics reporter that prints periodic summaries
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // the first tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();

        metrics.record_received();
        metrics.record_received();
        metrics.record_score(0.35);
        metrics.record_score(1.0);
        metrics.record_anomaly(RiskLevel::High, ModelSource::Global);
        metrics.record_batch(Duration::from_micros(900), 1);

        assert_eq!(metrics.transactions_received.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.transactions_scored.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.transactions_unscored.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.anomalies_detected.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_anomalies_by_source().get(&ModelSource::Global), Some(&1));

        let dist = metrics.get_score_distribution();
        assert_eq!(dist[3], 1);
        assert_eq!(dist[9], 1);
    }

    #[test]
    fn test_training_outcomes() {
        let metrics = PipelineMetrics::new();
        metrics.record_training(Duration::from_millis(4), true);
        metrics.record_training(Duration::from_millis(1), false);

        assert_eq!(metrics.models_trained.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.training_failures.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_training_stats().count, 1);
    }

    #[test]
    fn test_latency_stats() {
        let samples: Vec<u64> = (1..=100).collect();
        let stats = LatencyStats::from_samples(&samples);

        assert_eq!(stats.count, 100);
        assert_eq!(stats.mean_us, 50);
        assert_eq!(stats.p50_us, 51);
        assert_eq!(stats.p99_us, 100);
        assert_eq!(stats.max_us, 100);
        assert_eq!(LatencyStats::from_samples(&[]), LatencyStats::default());
    }
}
