// Numan Thabit 2025
use std::{collections::BTreeSet, sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::{
    error::LoadCheckError,
    probe::HttpProber,
    targets::{Target, TargetRegistry},
};

/// Warm-up knobs; warm-up time is never part of the measurement span.
#[derive(Debug, Clone, Copy)]
pub struct WarmupPolicy {
    pub retries: u32,
    pub delay: Duration,
    /// Wall-clock budget for the whole warm-up phase.
    pub deadline: Option<Duration>,
}

impl WarmupPolicy {
    pub fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

#[derive(Debug, Clone)]
pub struct WarmupResult {
    /// Targets admitted to measurement, in registry order.
    pub admitted: Vec<Arc<Target>>,
    pub degraded: BTreeSet<String>,
}

/// Warm every target concurrently. Targets that never answer with a 2xx are
/// degraded; if none survive the run cannot proceed.
pub async fn run(
    registry: &TargetRegistry,
    prober: &HttpProber,
    policy: WarmupPolicy,
) -> Result<WarmupResult, LoadCheckError> {
    let budget_end = policy.deadline.map(|budget| Instant::now() + budget);
    let results = join_all(
        registry
            .targets()
            .iter()
            .map(|target| warm_target(target, prober, policy, budget_end)),
    )
    .await;

    let mut admitted = Vec::with_capacity(registry.len());
    let mut degraded = BTreeSet::new();
    for (target, result) in registry.targets().iter().zip(results) {
        match result {
            Ok(()) => admitted.push(Arc::clone(target)),
            Err(err) => {
                warn!(host = %target.name(), error = %err, "target degraded; excluded from measurement");
                degraded.insert(target.name().to_string());
            }
        }
    }

    if admitted.is_empty() {
        return Err(LoadCheckError::AllTargetsDegraded {
            targets: registry.names().map(str::to_string).collect(),
        });
    }

    Ok(WarmupResult { admitted, degraded })
}

async fn warm_target(
    target: &Target,
    prober: &HttpProber,
    policy: WarmupPolicy,
    budget_end: Option<Instant>,
) -> Result<(), LoadCheckError> {
    let attempts = policy.attempts();
    let mut made = 0;
    for attempt in 1..=attempts {
        if budget_end.is_some_and(|end| Instant::now() >= end) {
            warn!(host = %target.name(), attempt, "warm-up budget exhausted");
            break;
        }
        made = attempt;
        let probe = prober.probe(target).await;
        if probe.outcome.is_2xx() {
            info!(
                host = %target.name(),
                attempt,
                latency_ms = probe.latency_ms(),
                "warm-up succeeded"
            );
            return Ok(());
        }
        info!(
            host = %target.name(),
            attempt,
            attempts,
            outcome = ?probe.outcome,
            "warm-up attempt failed"
        );
        if attempt < attempts && !policy.delay.is_zero() {
            let pause = match budget_end {
                Some(end) => policy.delay.min(end.saturating_duration_since(Instant::now())),
                None => policy.delay,
            };
            sleep(pause).await;
        }
    }
    Err(LoadCheckError::WarmupExhausted {
        target: target.name().to_string(),
        attempts: made,
    })
}
