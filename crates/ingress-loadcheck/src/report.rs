// Numan Thabit 2025
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write as _,
    time::Duration,
};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use crate::{sampler::ResourceStats, stats::PercentileStats};

/// Fixed-precision serializers for report numbers.
pub mod round {
    use serde::Serializer;

    fn to(value: f64, decimals: i32) -> f64 {
        let scale = 10f64.powi(decimals);
        (value * scale).round() / scale
    }

    /// Latencies in milliseconds: 2 decimals.
    pub fn latency<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to(*value, 2))
    }

    /// Rates: 1 decimal.
    pub fn rate<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to(*value, 1))
    }

    /// Percentages: 1 decimal.
    pub fn pct<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(to(*value, 1))
    }
}

/// The single immutable result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub requested: usize,
    pub concurrency: usize,
    pub duration_ms: u64,
    pub interrupted: bool,
    pub per_target: BTreeMap<String, PercentileStats>,
    pub combined: PercentileStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceStats>,
    pub degraded_targets: BTreeSet<String>,
}

/// Inputs gathered by the run stages.
#[derive(Debug)]
pub struct ReportInputs {
    pub requested: usize,
    pub concurrency: usize,
    pub elapsed: Duration,
    pub interrupted: bool,
    pub per_target: BTreeMap<String, PercentileStats>,
    pub combined: PercentileStats,
    pub resources: Option<ResourceStats>,
    pub degraded_targets: BTreeSet<String>,
}

impl RunReport {
    pub fn build(inputs: ReportInputs) -> Self {
        Self {
            generated_at: Utc::now(),
            requested: inputs.requested,
            concurrency: inputs.concurrency,
            duration_ms: inputs.elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
            interrupted: inputs.interrupted,
            per_target: inputs.per_target,
            combined: inputs.combined,
            resources: inputs.resources,
            degraded_targets: inputs.degraded_targets,
        }
    }

    pub fn render_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("### 🚦 Load-test summary\n");
        out.push_str(
            "| Host | Requests | Success % | Avg (ms) | P50 (ms) | P90 (ms) | P95 (ms) | P99 (ms) | Max (ms) | Req/s | Failures |\n",
        );
        out.push_str("| --- | ---: | ---: | ---: | ---: | ---: | ---: | ---: | ---: | ---: | ---: |\n");
        for (host, stats) in &self.per_target {
            push_row(&mut out, host, stats);
        }
        push_row(&mut out, "**combined**", &self.combined);

        let _ = writeln!(
            out,
            "\nMeasured {} of {} requests in {:.2}s with {} workers (generated {}).",
            self.combined.count,
            self.requested,
            self.duration_ms as f64 / 1_000.0,
            self.concurrency,
            self.generated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        if self.interrupted {
            out.push_str("\n⚠️ Run interrupted before every request completed.\n");
        }
        if !self.degraded_targets.is_empty() {
            let hosts: Vec<String> = self
                .degraded_targets
                .iter()
                .map(|host| format!("`{host}`"))
                .collect();
            let _ = writeln!(
                out,
                "\nDegraded targets (failed warm-up, excluded from measurement): {}",
                hosts.join(", ")
            );
        }
        if !self.combined.errors.is_empty() {
            let breakdown: Vec<String> = self
                .combined
                .errors
                .iter()
                .map(|(label, count)| format!("{label}: {count}"))
                .collect();
            let _ = writeln!(out, "\nFailures by kind: {}", breakdown.join(", "));
        }

        if let Some(resources) = &self.resources {
            out.push_str("\n### 📊 Resource utilization\n");
            out.push_str("| Metric | Average | Min | Max |\n");
            out.push_str("| --- | ---: | ---: | ---: |\n");
            let cpu = &resources.cpu_cores;
            let _ = writeln!(
                out,
                "| CPU (cores) | {:.3} | {:.3} | {:.3} |",
                cpu.avg, cpu.min, cpu.max
            );
            let mem = &resources.memory_mb;
            let _ = writeln!(
                out,
                "| Memory (MB) | {:.1} | {:.1} | {:.1} |",
                mem.avg, mem.min, mem.max
            );
            if let Some(rx) = &resources.net_rx_bytes_per_sec {
                let _ = writeln!(
                    out,
                    "| Network RX (B/s) | {:.1} | {:.1} | {:.1} |",
                    rx.avg, rx.min, rx.max
                );
            }
            if let Some(tx) = &resources.net_tx_bytes_per_sec {
                let _ = writeln!(
                    out,
                    "| Network TX (B/s) | {:.1} | {:.1} | {:.1} |",
                    tx.avg, tx.min, tx.max
                );
            }
            let _ = writeln!(
                out,
                "\nRunning pods: {} ({} samples)",
                resources.running_pods, resources.sample_count
            );
        }
        out
    }
}

fn push_row(out: &mut String, host: &str, stats: &PercentileStats) {
    let _ = writeln!(
        out,
        "| {host} | {} | {:.1}% | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.2} | {:.1} | {} |",
        stats.count,
        stats.success_rate_pct,
        stats.avg_ms,
        stats.p50_ms,
        stats.p90_ms,
        stats.p95_ms,
        stats.p99_ms,
        stats.max_ms,
        stats.requests_per_second,
        stats.failure_count,
    );
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        outcome::{Outcome, RequestOutcome},
        sampler::ResourceSample,
    };

    fn outcomes(target: &str, latencies: &[f64]) -> Vec<RequestOutcome> {
        latencies
            .iter()
            .map(|&latency_ms| RequestOutcome {
                target_name: target.to_string(),
                issued_at: Utc::now(),
                latency_ms,
                outcome: Outcome::Success { status: 200 },
            })
            .collect()
    }

    fn report(resources: Option<ResourceStats>) -> RunReport {
        let elapsed = Duration::from_millis(1_500);
        let foo = outcomes("foo.localhost", &[10.123, 20.456, 30.789]);
        let mut bar = outcomes("bar.localhost", &[5.0]);
        bar.push(RequestOutcome {
            target_name: "bar.localhost".into(),
            issued_at: Utc::now(),
            latency_ms: 10_000.0,
            outcome: Outcome::Timeout,
        });
        let mut per_target = BTreeMap::new();
        per_target.insert(
            "foo.localhost".to_string(),
            PercentileStats::from_outcomes(&foo, elapsed),
        );
        per_target.insert(
            "bar.localhost".to_string(),
            PercentileStats::from_outcomes(&bar, elapsed),
        );
        let combined = PercentileStats::pooled([foo.as_slice(), bar.as_slice()], elapsed);
        RunReport::build(ReportInputs {
            requested: 5,
            concurrency: 2,
            elapsed,
            interrupted: false,
            per_target,
            combined,
            resources,
            degraded_targets: BTreeSet::from(["baz.localhost".to_string()]),
        })
    }

    #[test]
    fn rendering_is_idempotent() {
        let report = report(None);
        assert_eq!(
            report.render_json().expect("json"),
            report.render_json().expect("json")
        );
        assert_eq!(report.render_markdown(), report.render_markdown());
    }

    #[test]
    fn json_uses_stable_names_and_rounding() {
        let report = report(None);
        let value: serde_json::Value =
            serde_json::from_str(&report.render_json().expect("json")).expect("parse");
        let foo = &value["per_target"]["foo.localhost"];
        assert_eq!(foo["count"], 3);
        assert_eq!(foo["p50_ms"], serde_json::json!(20.46));
        assert_eq!(foo["requests_per_second"], serde_json::json!(2.0));
        assert_eq!(value["per_target"]["bar.localhost"]["success_rate_pct"], serde_json::json!(50.0));
        assert_eq!(value["combined"]["count"], 5);
        assert_eq!(value["combined"]["errors"]["timeout"], 1);
        assert_eq!(value["degraded_targets"], serde_json::json!(["baz.localhost"]));
        assert!(value.get("resources").is_none());
        assert!(value.get("generated_at").is_some());
    }

    #[test]
    fn markdown_has_fixed_columns_and_combined_row() {
        let markdown = report(None).render_markdown();
        assert!(markdown.contains(
            "| Host | Requests | Success % | Avg (ms) | P50 (ms) | P90 (ms) | P95 (ms) | P99 (ms) | Max (ms) | Req/s | Failures |"
        ));
        let bar_row = markdown.find("| bar.localhost |").expect("bar row");
        let foo_row = markdown.find("| foo.localhost |").expect("foo row");
        let combined_row = markdown.find("| **combined** | 5 |").expect("combined row");
        assert!(bar_row < foo_row && foo_row < combined_row);
        assert!(markdown.contains("`baz.localhost`"));
        assert!(markdown.contains("timeout: 1"));
        assert!(!markdown.contains("Resource utilization"));
    }

    #[test]
    fn resource_table_follows_latency_table() {
        let sample = |cpu_cores: f64, rx: Option<f64>| ResourceSample {
            sampled_at: Utc::now(),
            cpu_cores,
            memory_mb: 128.0,
            net_rx_bytes_per_sec: rx,
            net_tx_bytes_per_sec: rx,
            running_pods: 4,
        };
        let stats = ResourceStats::from_samples(&[sample(0.1, None), sample(0.3, Some(2_048.0))])
            .expect("stats");
        let report = report(Some(stats));

        let markdown = report.render_markdown();
        let latency = markdown.find("Load-test summary").expect("latency table");
        let resources = markdown.find("Resource utilization").expect("resource table");
        assert!(latency < resources);
        assert!(markdown.contains("| CPU (cores) | 0.200 | 0.100 | 0.300 |"));
        assert!(markdown.contains("| Network RX (B/s) | 2048.0 | 2048.0 | 2048.0 |"));
        assert!(markdown.contains("Running pods: 4 (2 samples)"));

        let value: serde_json::Value =
            serde_json::from_str(&report.render_json().expect("json")).expect("parse");
        assert_eq!(value["resources"]["running_pods"], 4);
        assert_eq!(value["resources"]["cpu_cores"]["avg"], serde_json::json!(0.2));
    }
}
