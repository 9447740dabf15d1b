// Numan Thabit 2025
use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use tokio::time::{interval_at, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{error::LoadCheckError, metrics_source::MetricsSource};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// How long and how often to sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceWindow {
    pub duration: Duration,
    pub interval: Duration,
}

/// Per-tick retry with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

/// PromQL expressions evaluated on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQueries {
    pub cpu_cores: String,
    pub memory_bytes: String,
    /// Cumulative counter; converted to a rate between ticks.
    pub net_rx_bytes: String,
    /// Cumulative counter; converted to a rate between ticks.
    pub net_tx_bytes: String,
    pub running_pods: String,
}

impl ResourceQueries {
    pub fn for_namespace(namespace: &str) -> Self {
        Self {
            cpu_cores: format!(
                r#"sum(rate(container_cpu_usage_seconds_total{{namespace="{namespace}"}}[1m]))"#
            ),
            memory_bytes: format!(
                r#"sum(container_memory_working_set_bytes{{namespace="{namespace}"}})"#
            ),
            net_rx_bytes: format!(
                r#"sum(container_network_receive_bytes_total{{namespace="{namespace}"}})"#
            ),
            net_tx_bytes: format!(
                r#"sum(container_network_transmit_bytes_total{{namespace="{namespace}"}})"#
            ),
            running_pods: format!(
                r#"sum(kube_pod_status_phase{{namespace="{namespace}",phase="Running"}})"#
            ),
        }
    }
}

/// One sampling tick. Rates are absent on the first tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSample {
    pub sampled_at: DateTime<Utc>,
    pub cpu_cores: f64,
    pub memory_mb: f64,
    pub net_rx_bytes_per_sec: Option<f64>,
    pub net_tx_bytes_per_sec: Option<f64>,
    pub running_pods: u64,
}

#[derive(Debug, Clone, Copy)]
struct Reading {
    taken: Instant,
    cpu_cores: f64,
    memory_bytes: f64,
    rx_total: f64,
    tx_total: f64,
    running_pods: f64,
}

pub struct ResourceSampler {
    source: Arc<dyn MetricsSource>,
    queries: ResourceQueries,
    window: ResourceWindow,
    retry: RetryPolicy,
}

impl ResourceSampler {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        queries: ResourceQueries,
        window: ResourceWindow,
        retry: RetryPolicy,
    ) -> Result<Self, LoadCheckError> {
        if window.interval.is_zero() {
            return Err(LoadCheckError::invalid(
                "resource_interval must be greater than 0",
            ));
        }
        if window.interval > window.duration {
            return Err(LoadCheckError::invalid(
                "resource_interval must not exceed resource_duration",
            ));
        }
        Ok(Self {
            source,
            queries,
            window,
            retry,
        })
    }

    /// Sample until the window closes or `cancel` fires. A tick that fails
    /// every retry makes monitoring unavailable for the whole run.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<ResourceSample>, LoadCheckError> {
        info!(
            source = %self.source.describe(),
            duration_ms = self.window.duration.as_millis() as u64,
            interval_ms = self.window.interval.as_millis() as u64,
            "starting resource sampling"
        );
        let start = Instant::now();
        let end = start + self.window.duration;
        let mut ticker = interval_at(start, self.window.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut samples = Vec::new();
        let mut previous: Option<Reading> = None;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = sleep_until(end) => break,
                _ = ticker.tick() => {}
            }

            let reading = self.read_with_retry().await?;
            let sample = to_sample(&reading, previous.as_ref());
            info!(
                cpu_cores = sample.cpu_cores,
                memory_mb = sample.memory_mb,
                running_pods = sample.running_pods,
                "resource sample"
            );
            samples.push(sample);
            previous = Some(reading);
        }
        Ok(samples)
    }

    async fn read_with_retry(&self) -> Result<Reading, LoadCheckError> {
        let attempts = self.retry.attempts.max(1);
        let mut backoff = self.retry.backoff;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.read().await {
                Ok(reading) => return Ok(reading),
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "metrics query failed");
                    last_error = err.to_string();
                }
            }
            if attempt < attempts {
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
        Err(LoadCheckError::MetricsUnavailable(format!(
            "{} unreachable after {attempts} attempts: {last_error}",
            self.source.describe()
        )))
    }

    async fn read(&self) -> Result<Reading, crate::error::MetricsError> {
        let at = Utc::now();
        let (cpu_cores, memory_bytes, rx_total, tx_total, running_pods) = tokio::try_join!(
            self.source.query(&self.queries.cpu_cores, at),
            self.source.query(&self.queries.memory_bytes, at),
            self.source.query(&self.queries.net_rx_bytes, at),
            self.source.query(&self.queries.net_tx_bytes, at),
            self.source.query(&self.queries.running_pods, at),
        )?;
        Ok(Reading {
            taken: Instant::now(),
            cpu_cores,
            memory_bytes,
            rx_total,
            tx_total,
            running_pods,
        })
    }
}

fn to_sample(current: &Reading, previous: Option<&Reading>) -> ResourceSample {
    let elapsed = previous.map(|prev| current.taken.saturating_duration_since(prev.taken));
    let rate = |now: f64, before: Option<f64>| -> Option<f64> {
        let secs = elapsed?.as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let before = before?;
        // counter restarted; everything since the restart is new traffic
        let delta = if now >= before { now - before } else { now };
        Some(delta / secs)
    };
    ResourceSample {
        sampled_at: Utc::now(),
        cpu_cores: current.cpu_cores,
        memory_mb: current.memory_bytes / BYTES_PER_MB,
        net_rx_bytes_per_sec: rate(current.rx_total, previous.map(|p| p.rx_total)),
        net_tx_bytes_per_sec: rate(current.tx_total, previous.map(|p| p.tx_total)),
        running_pods: current.running_pods.max(0.0).round() as u64,
    }
}

/// Average, minimum and maximum of one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    decimals: i32,
}

impl MetricSummary {
    fn over(values: impl IntoIterator<Item = f64>, decimals: i32) -> Option<Self> {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for value in values {
            count += 1;
            sum += value;
            min = min.min(value);
            max = max.max(value);
        }
        (count > 0).then(|| Self {
            avg: sum / count as f64,
            min,
            max,
            decimals,
        })
    }
}

impl Serialize for MetricSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let scale = 10f64.powi(self.decimals);
        let round = |value: f64| (value * scale).round() / scale;
        let mut state = serializer.serialize_struct("MetricSummary", 3)?;
        state.serialize_field("avg", &round(self.avg))?;
        state.serialize_field("min", &round(self.min))?;
        state.serialize_field("max", &round(self.max))?;
        state.end()
    }
}

/// Aggregate over all samples of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub sample_count: usize,
    pub cpu_cores: MetricSummary,
    pub memory_mb: MetricSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_rx_bytes_per_sec: Option<MetricSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net_tx_bytes_per_sec: Option<MetricSummary>,
    /// Pod count observed on the last tick.
    pub running_pods: u64,
}

impl ResourceStats {
    pub fn from_samples(samples: &[ResourceSample]) -> Option<Self> {
        let last = samples.last()?;
        Some(Self {
            sample_count: samples.len(),
            cpu_cores: MetricSummary::over(samples.iter().map(|s| s.cpu_cores), 3)?,
            memory_mb: MetricSummary::over(samples.iter().map(|s| s.memory_mb), 2)?,
            net_rx_bytes_per_sec: MetricSummary::over(
                samples.iter().filter_map(|s| s.net_rx_bytes_per_sec),
                1,
            ),
            net_tx_bytes_per_sec: MetricSummary::over(
                samples.iter().filter_map(|s| s.net_tx_bytes_per_sec),
                1,
            ),
            running_pods: last.running_pods,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::error::MetricsError;

    /// Counters grow by 1000 bytes per rx query; fails the first `failures` cpu queries.
    struct FakeSource {
        rx_calls: AtomicUsize,
        cpu_calls: AtomicUsize,
        failures: usize,
    }

    impl FakeSource {
        fn new(failures: usize) -> Self {
            Self {
                rx_calls: AtomicUsize::new(0),
                cpu_calls: AtomicUsize::new(0),
                failures,
            }
        }
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        fn describe(&self) -> String {
            "fake".to_string()
        }

        async fn query(&self, query: &str, _at: DateTime<Utc>) -> Result<f64, MetricsError> {
            match query {
                "cpu" => {
                    let call = self.cpu_calls.fetch_add(1, Ordering::SeqCst);
                    if call < self.failures {
                        Err(MetricsError::Query("connection refused".into()))
                    } else {
                        Ok(0.5)
                    }
                }
                "mem" => Ok(64.0 * BYTES_PER_MB),
                "rx" => Ok(1_000.0 * (self.rx_calls.fetch_add(1, Ordering::SeqCst) + 1) as f64),
                "tx" => Ok(10.0),
                "pods" => Ok(4.0),
                other => Err(MetricsError::Query(format!("unknown query {other}"))),
            }
        }
    }

    fn queries() -> ResourceQueries {
        ResourceQueries {
            cpu_cores: "cpu".into(),
            memory_bytes: "mem".into(),
            net_rx_bytes: "rx".into(),
            net_tx_bytes: "tx".into(),
            running_pods: "pods".into(),
        }
    }

    fn sampler(source: Arc<FakeSource>) -> ResourceSampler {
        ResourceSampler::new(
            source,
            queries(),
            ResourceWindow {
                duration: Duration::from_secs(1),
                interval: Duration::from_millis(250),
            },
            RetryPolicy {
                attempts: 3,
                backoff: Duration::from_millis(10),
            },
        )
        .expect("valid window")
    }

    #[test]
    fn zero_interval_window_is_rejected() {
        let err = ResourceSampler::new(
            Arc::new(FakeSource::new(0)),
            queries(),
            ResourceWindow {
                duration: Duration::from_secs(1),
                interval: Duration::ZERO,
            },
            RetryPolicy::default(),
        )
        .err()
        .expect("zero interval must be rejected");
        assert!(matches!(err, LoadCheckError::InvalidConfiguration(_)));
        assert!(err.to_string().contains("greater than 0"));

        let err = ResourceSampler::new(
            Arc::new(FakeSource::new(0)),
            queries(),
            ResourceWindow {
                duration: Duration::from_millis(100),
                interval: Duration::from_secs(1),
            },
            RetryPolicy::default(),
        )
        .err()
        .expect("interval longer than window must be rejected");
        assert!(err.to_string().contains("must not exceed"));
    }

    #[tokio::test(start_paused = true)]
    async fn samples_every_interval_until_window_closes() {
        let source = Arc::new(FakeSource::new(0));
        let samples = sampler(Arc::clone(&source))
            .run(&CancellationToken::new())
            .await
            .expect("sampling succeeds");

        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].net_rx_bytes_per_sec, None);
        for sample in &samples[1..] {
            let rate = sample.net_rx_bytes_per_sec.expect("rate after first tick");
            assert!((rate - 4_000.0).abs() < 1e-6, "rate {rate}");
            assert_eq!(sample.net_tx_bytes_per_sec, Some(0.0));
        }
        assert!(samples.iter().all(|s| (s.memory_mb - 64.0).abs() < 1e-9));

        let stats = ResourceStats::from_samples(&samples).expect("stats");
        assert_eq!(stats.sample_count, 4);
        assert_eq!(stats.running_pods, 4);
        assert!((stats.cpu_cores.avg - 0.5).abs() < 1e-9);
        let rx = stats.net_rx_bytes_per_sec.expect("rx aggregate");
        assert!((rx.min - 4_000.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried() {
        let source = Arc::new(FakeSource::new(2));
        let samples = sampler(Arc::clone(&source))
            .run(&CancellationToken::new())
            .await
            .expect("third attempt succeeds");
        assert!(!samples.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_marks_metrics_unavailable() {
        let source = Arc::new(FakeSource::new(usize::MAX));
        let err = sampler(Arc::clone(&source))
            .run(&CancellationToken::new())
            .await
            .expect_err("every attempt fails");
        assert!(matches!(err, LoadCheckError::MetricsUnavailable(_)));
        assert_eq!(source.cpu_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_sampling() {
        let source = Arc::new(FakeSource::new(0));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let samples = sampler(source).run(&cancel).await.expect("cancelled cleanly");
        assert!(samples.is_empty());
    }

    #[test]
    fn counter_reset_uses_new_value_as_delta() {
        let before = Instant::now();
        let prev = Reading {
            taken: before,
            cpu_cores: 0.0,
            memory_bytes: 0.0,
            rx_total: 50_000.0,
            tx_total: 100.0,
            running_pods: 2.0,
        };
        let current = Reading {
            taken: before + Duration::from_secs(2),
            rx_total: 4_000.0,
            tx_total: 300.0,
            ..prev
        };
        let sample = to_sample(&current, Some(&prev));
        assert_eq!(sample.net_rx_bytes_per_sec, Some(2_000.0));
        assert_eq!(sample.net_tx_bytes_per_sec, Some(100.0));
        assert_eq!(sample.running_pods, 2);
    }

    #[test]
    fn stats_need_at_least_one_sample() {
        assert!(ResourceStats::from_samples(&[]).is_none());
    }

    #[test]
    fn summary_serializes_rounded() {
        let summary = MetricSummary::over([0.12345, 0.2], 3).expect("summary");
        let json = serde_json::to_value(summary).expect("json");
        assert_eq!(json["min"], serde_json::json!(0.123));
        assert_eq!(json["max"], serde_json::json!(0.2));
    }
}
