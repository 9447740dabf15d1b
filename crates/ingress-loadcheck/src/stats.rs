// Numan Thabit 2025
//! Latency summaries computed with the nearest-rank method.

use std::{collections::BTreeMap, time::Duration};

use serde::Serialize;

use crate::{outcome::RequestOutcome, report::round};

/// Summary of one latency population.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PercentileStats {
    pub count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    #[serde(serialize_with = "round::pct")]
    pub success_rate_pct: f64,
    #[serde(serialize_with = "round::latency")]
    pub avg_ms: f64,
    #[serde(serialize_with = "round::latency")]
    pub p50_ms: f64,
    #[serde(serialize_with = "round::latency")]
    pub p90_ms: f64,
    #[serde(serialize_with = "round::latency")]
    pub p95_ms: f64,
    #[serde(serialize_with = "round::latency")]
    pub p99_ms: f64,
    #[serde(serialize_with = "round::latency")]
    pub max_ms: f64,
    #[serde(serialize_with = "round::rate")]
    pub requests_per_second: f64,
    /// Failure label to occurrence count.
    pub errors: BTreeMap<String, u64>,
}

impl PercentileStats {
    /// Stats for a single target's outcomes.
    pub fn from_outcomes(outcomes: &[RequestOutcome], elapsed: Duration) -> Self {
        Self::pooled(std::iter::once(outcomes), elapsed)
    }

    /// Stats over the union of several populations. Latencies are pooled and
    /// sorted before ranking, so this is not an average of per-part percentiles.
    pub fn pooled<'a, I>(parts: I, elapsed: Duration) -> Self
    where
        I: IntoIterator<Item = &'a [RequestOutcome]>,
    {
        let mut latencies = Vec::new();
        let mut success_count = 0u64;
        let mut errors = BTreeMap::new();
        for outcome in parts.into_iter().flatten() {
            latencies.push(outcome.latency_ms);
            match outcome.outcome.failure_label() {
                None => success_count += 1,
                Some(label) => *errors.entry(label).or_insert(0) += 1,
            }
        }
        summarize(latencies, success_count, errors, elapsed)
    }
}

fn summarize(
    mut latencies: Vec<f64>,
    success_count: u64,
    errors: BTreeMap<String, u64>,
    elapsed: Duration,
) -> PercentileStats {
    let count = latencies.len() as u64;
    if count == 0 {
        return PercentileStats {
            errors,
            ..PercentileStats::default()
        };
    }

    latencies.sort_by(f64::total_cmp);
    let sum: f64 = latencies.iter().sum();
    let elapsed_secs = elapsed.as_secs_f64();

    PercentileStats {
        count,
        success_count,
        failure_count: count - success_count,
        success_rate_pct: success_count as f64 * 100.0 / count as f64,
        avg_ms: sum / count as f64,
        p50_ms: percentile(&latencies, 0.50),
        p90_ms: percentile(&latencies, 0.90),
        p95_ms: percentile(&latencies, 0.95),
        p99_ms: percentile(&latencies, 0.99),
        max_ms: latencies[latencies.len() - 1],
        requests_per_second: if elapsed_secs > 0.0 {
            count as f64 / elapsed_secs
        } else {
            0.0
        },
        errors,
    }
}

/// Nearest-rank percentile over an ascending slice: the value at rank
/// `ceil(q * n) - 1`, clamped to the slice. Returns 0 for an empty slice.
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let n = sorted.len();
    // tolerate float noise such as 0.95 * 20 = 19.000000000000004
    let rank = (q * n as f64 - 1e-9).ceil() as i64 - 1;
    let idx = rank.clamp(0, n as i64 - 1) as usize;
    sorted[idx]
}
