// Numan Thabit 2025
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use rand::{rngs::StdRng, SeedableRng};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    config::Config,
    dispatch::{self, DispatchSettings},
    error::LoadCheckError,
    metrics_source::MetricsSource,
    outcome::SeriesBook,
    probe::HttpProber,
    report::{ReportInputs, RunReport},
    sampler::{ResourceQueries, ResourceSampler, ResourceStats},
    stats::PercentileStats,
    targets::TargetRegistry,
    warmup,
};

/// Shared state for one load-check run.
pub struct RunContext {
    config: Arc<Config>,
    registry: Arc<TargetRegistry>,
    series: Arc<SeriesBook>,
    prober: HttpProber,
    cancel: CancellationToken,
}

impl RunContext {
    pub fn new(config: Config) -> Result<Self, LoadCheckError> {
        config.validate()?;
        let registry = TargetRegistry::from_specs(&config.targets)?;
        let series = SeriesBook::new(registry.names());
        let prober = HttpProber::new(
            &registry,
            config.method.clone(),
            config.request_timeout,
            config.concurrency,
        )?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            series: Arc::new(series),
            prober,
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    /// Token that stops the run; in-flight requests are abandoned.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Warm up, then measure while sampling resources, then aggregate.
    ///
    /// `metrics` is only consulted when the configuration carries a resource
    /// window. Monitoring failures never fail the run.
    pub async fn execute(
        &self,
        metrics: Option<Arc<dyn MetricsSource>>,
    ) -> Result<RunReport, LoadCheckError> {
        let result = self.measure(metrics.clone()).await;
        if let Some(source) = metrics {
            source.close().await;
        }
        result
    }

    async fn measure(
        &self,
        metrics: Option<Arc<dyn MetricsSource>>,
    ) -> Result<RunReport, LoadCheckError> {
        let config = &self.config;
        let warm = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                warn!("run cancelled during warm-up; nothing was measured");
                return Ok(RunReport::build(ReportInputs {
                    requested: config.requests,
                    concurrency: config.concurrency,
                    elapsed: Duration::ZERO,
                    interrupted: true,
                    per_target: BTreeMap::new(),
                    combined: PercentileStats::default(),
                    resources: None,
                    degraded_targets: BTreeSet::new(),
                }));
            }
            warm = warmup::run(&self.registry, &self.prober, config.warmup_policy()) => warm?,
        };

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let settings = DispatchSettings {
            total_requests: config.requests,
            concurrency: config.concurrency,
        };

        let sampler = match (metrics, config.resource_window()) {
            (Some(source), Some(window)) => Some(ResourceSampler::new(
                source,
                ResourceQueries::for_namespace(&config.metrics.namespace),
                window,
                config.sampler_retry(),
            )?),
            _ => None,
        };
        let sampling = async {
            match &sampler {
                Some(sampler) => Some(sampler.run(&self.cancel).await),
                None => None,
            }
        };

        let (summary, samples) = tokio::join!(
            dispatch::run(
                &warm.admitted,
                &self.prober,
                &self.series,
                settings,
                &mut rng,
                &self.cancel,
            ),
            sampling
        );

        let resources = match samples {
            Some(Ok(samples)) => {
                let stats = ResourceStats::from_samples(&samples);
                if stats.is_none() {
                    warn!("resource sampling produced no samples");
                }
                stats
            }
            Some(Err(err)) => {
                warn!(error = %err, "resource monitoring disabled for this run");
                None
            }
            None => None,
        };

        let mut per_target = BTreeMap::new();
        let mut series = Vec::with_capacity(warm.admitted.len());
        for target in &warm.admitted {
            if let Some(snapshot) = self.series.snapshot(target.name()) {
                per_target.insert(
                    target.name().to_string(),
                    PercentileStats::from_outcomes(snapshot.outcomes(), summary.elapsed),
                );
                series.push(snapshot);
            }
        }
        let combined = PercentileStats::pooled(
            series.iter().map(|snapshot| snapshot.outcomes()),
            summary.elapsed,
        );

        info!(
            recorded = summary.recorded,
            requested = config.requests,
            success_rate_pct = combined.success_rate_pct,
            p95_ms = combined.p95_ms,
            interrupted = summary.interrupted,
            degraded = warm.degraded.len(),
            "load check finished"
        );

        Ok(RunReport::build(ReportInputs {
            requested: config.requests,
            concurrency: config.concurrency,
            elapsed: summary.elapsed,
            interrupted: summary.interrupted,
            per_target,
            combined,
            resources,
            degraded_targets: warm.degraded,
        }))
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::targets::TargetSpec;

    #[test]
    fn rejects_invalid_configuration_before_any_io() {
        let config = Config {
            concurrency: 0,
            ..Config::default()
        };
        let err = RunContext::new(config)
            .err()
            .expect("zero concurrency must be rejected");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn duplicate_targets_are_rejected() {
        let url = Url::parse("http://127.0.0.1:1/").expect("url");
        let config = Config {
            targets: vec![
                TargetSpec::new("dup", url.clone()),
                TargetSpec::new("dup", url),
            ],
            request_timeout: Duration::from_millis(100),
            ..Config::default()
        };
        let err = RunContext::new(config).err().expect("duplicate names");
        assert!(matches!(err, LoadCheckError::InvalidConfiguration(_)));
    }
}
