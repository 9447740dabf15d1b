// Numan Thabit 2025
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use humantime::format_duration;
use reqwest::Method;
use serde::Deserialize;
use serde_with::{serde_as, DisplayFromStr, DurationSecondsWithFrac};
use tracing::info;
use url::Url;

use crate::{
    error::LoadCheckError,
    metrics_source::{MetricsConfig, MetricsMode, PortForwardConfig},
    sampler::{ResourceWindow, RetryPolicy},
    targets::{self, TargetSpec},
    warmup::WarmupPolicy,
};

const DEFAULT_CONFIG_PATH: &str = "ops/ingress-loadcheck.toml";
const DEFAULT_REQUESTS: usize = 200;
const DEFAULT_CONCURRENCY: usize = 20;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_WARMUP_RETRIES: u32 = 2;
const DEFAULT_WARMUP_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_SAMPLER_ATTEMPTS: u32 = 3;
const DEFAULT_SAMPLER_BACKOFF: Duration = Duration::from_millis(250);
const DEFAULT_PROMETHEUS_URL: &str = "http://localhost:9090";
const DEFAULT_METRICS_NAMESPACE: &str = "echo";
const DEFAULT_OUTPUT_DIR: &str = "artifacts";

#[derive(Parser, Debug, Clone, Default)]
#[command(
    author,
    version,
    about = "Load and resource check for the PR ingress deployment",
    rename_all = "kebab-case"
)]
pub struct CliArgs {
    /// Path to a TOML configuration file.
    #[arg(long, value_name = "PATH", env = "INGRESS_LOADCHECK_CONFIG")]
    pub config: Option<PathBuf>,

    /// Target as NAME=URL; repeat for several targets. Replaces file targets.
    #[arg(long = "target", value_name = "NAME=URL", action = clap::ArgAction::Append)]
    pub targets: Vec<String>,

    /// Total number of measurement requests.
    #[arg(long)]
    pub requests: Option<usize>,

    /// Number of concurrent workers.
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Per-request deadline.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub timeout: Option<Duration>,

    /// HTTP method for every request.
    #[arg(long)]
    pub method: Option<String>,

    /// Warm-up retries after the first attempt.
    #[arg(long)]
    pub warmup_retries: Option<u32>,

    /// Pause between warm-up attempts.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub warmup_delay: Option<Duration>,

    /// Wall-clock budget for the whole warm-up phase.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub warmup_deadline: Option<Duration>,

    /// How long to sample resource metrics (requires --resource-interval).
    #[arg(long, value_parser = humantime::parse_duration)]
    pub resource_duration: Option<Duration>,

    /// Interval between resource samples (requires --resource-duration).
    #[arg(long, value_parser = humantime::parse_duration)]
    pub resource_interval: Option<Duration>,

    /// Attempts per sampling tick before monitoring is given up.
    #[arg(long)]
    pub sampler_attempts: Option<u32>,

    /// Initial backoff between sampling attempts; doubles per retry.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub sampler_backoff: Option<Duration>,

    /// How to reach Prometheus.
    #[arg(long, value_enum)]
    pub metrics_mode: Option<MetricsMode>,

    /// Prometheus base URL.
    #[arg(long)]
    pub prometheus_url: Option<Url>,

    /// Namespace whose workloads are sampled.
    #[arg(long)]
    pub metrics_namespace: Option<String>,

    /// Kubeconfig used for the port-forward.
    #[arg(long, value_name = "PATH")]
    pub kubeconfig: Option<PathBuf>,

    /// Hard ceiling for the whole run; in-flight work is abandoned when it expires.
    #[arg(long, value_parser = humantime::parse_duration)]
    pub run_deadline: Option<Duration>,

    /// Seed for target selection, for reproducible traffic.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Directory receiving the JSON and Markdown reports.
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Shared pipeline state file updated with the report location.
    #[arg(long, value_name = "PATH")]
    pub state_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub targets: Vec<TargetSpec>,
    pub requests: usize,
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub method: Method,
    pub warmup_retries: u32,
    pub warmup_delay: Duration,
    pub warmup_deadline: Option<Duration>,
    pub resource_duration: Option<Duration>,
    pub resource_interval: Option<Duration>,
    pub sampler_attempts: u32,
    pub sampler_backoff: Duration,
    pub metrics: MetricsConfig,
    pub run_deadline: Option<Duration>,
    pub seed: Option<u64>,
    pub output_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            targets: targets::default_specs(),
            requests: DEFAULT_REQUESTS,
            concurrency: DEFAULT_CONCURRENCY,
            request_timeout: DEFAULT_TIMEOUT,
            method: Method::GET,
            warmup_retries: DEFAULT_WARMUP_RETRIES,
            warmup_delay: DEFAULT_WARMUP_DELAY,
            warmup_deadline: None,
            resource_duration: None,
            resource_interval: None,
            sampler_attempts: DEFAULT_SAMPLER_ATTEMPTS,
            sampler_backoff: DEFAULT_SAMPLER_BACKOFF,
            metrics: MetricsConfig {
                mode: MetricsMode::Auto,
                prometheus_url: default_prometheus_url(),
                namespace: DEFAULT_METRICS_NAMESPACE.to_string(),
                port_forward: PortForwardConfig::default(),
            },
            run_deadline: None,
            seed: None,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            state_file: None,
            config_path: None,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    targets: Option<Vec<TargetSpec>>,
    requests: Option<usize>,
    concurrency: Option<usize>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    timeout_seconds: Option<Duration>,
    method: Option<String>,
    warmup_retries: Option<u32>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    warmup_delay_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    warmup_deadline_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    resource_duration_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    resource_interval_seconds: Option<Duration>,
    sampler_attempts: Option<u32>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    sampler_backoff_seconds: Option<Duration>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    run_deadline_seconds: Option<Duration>,
    seed: Option<u64>,
    output_dir: Option<PathBuf>,
    state_file: Option<PathBuf>,
    #[serde(default)]
    metrics: FileMetricsConfig,
}

#[serde_as]
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileMetricsConfig {
    mode: Option<MetricsMode>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    #[serde(default)]
    prometheus_url: Option<Url>,
    namespace: Option<String>,
    service: Option<String>,
    service_namespace: Option<String>,
    remote_port: Option<u16>,
    kubeconfig: Option<PathBuf>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    #[serde(default)]
    ready_timeout_seconds: Option<Duration>,
}

impl Config {
    pub fn from_cli(cli: &CliArgs) -> Result<Self> {
        let file_cfg =
            load_file_config(cli.config.as_deref()).context("failed to load config file")?;
        let config = merge(cli, file_cfg)?;
        config.validate()?;
        config.log_summary();
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadCheckError> {
        if self.targets.is_empty() {
            return Err(LoadCheckError::invalid("at least one target is required"));
        }
        if self.requests == 0 {
            return Err(LoadCheckError::invalid("requests must be greater than 0"));
        }
        if self.concurrency == 0 {
            return Err(LoadCheckError::invalid("concurrency must be greater than 0"));
        }
        if self.request_timeout.is_zero() {
            return Err(LoadCheckError::invalid("timeout must be greater than 0"));
        }
        if self.sampler_attempts == 0 {
            return Err(LoadCheckError::invalid(
                "sampler_attempts must be greater than 0",
            ));
        }
        match (self.resource_duration, self.resource_interval) {
            (None, None) => {}
            (Some(_), None) => {
                return Err(LoadCheckError::invalid(
                    "resource_duration is set but resource_interval is missing",
                ))
            }
            (None, Some(_)) => {
                return Err(LoadCheckError::invalid(
                    "resource_interval is set but resource_duration is missing",
                ))
            }
            (Some(duration), Some(interval)) => {
                if interval.is_zero() {
                    return Err(LoadCheckError::invalid(
                        "resource_interval must be greater than 0",
                    ));
                }
                if interval > duration {
                    return Err(LoadCheckError::invalid(format!(
                        "resource_interval ({}) must not exceed resource_duration ({})",
                        format_duration(interval),
                        format_duration(duration)
                    )));
                }
            }
        }
        Ok(())
    }

    /// Sampling window, when resource monitoring is enabled.
    pub fn resource_window(&self) -> Option<ResourceWindow> {
        Some(ResourceWindow {
            duration: self.resource_duration?,
            interval: self.resource_interval?,
        })
    }

    pub fn warmup_policy(&self) -> WarmupPolicy {
        WarmupPolicy {
            retries: self.warmup_retries,
            delay: self.warmup_delay,
            deadline: self.warmup_deadline,
        }
    }

    pub fn sampler_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.sampler_attempts,
            backoff: self.sampler_backoff,
        }
    }

    fn log_summary(&self) {
        let targets: Vec<String> = self
            .targets
            .iter()
            .map(|target| format!("{}={}", target.name, target.url))
            .collect();
        info!(
            targets = ?targets,
            requests = self.requests,
            concurrency = self.concurrency,
            timeout = %format_duration(self.request_timeout),
            method = %self.method,
            warmup_retries = self.warmup_retries,
            warmup_delay = %format_duration(self.warmup_delay),
            warmup_deadline = ?self.warmup_deadline,
            resource_window = ?self.resource_window(),
            metrics_mode = ?self.metrics.mode,
            prometheus = %self.metrics.prometheus_url,
            run_deadline = ?self.run_deadline,
            seed = ?self.seed,
            output_dir = %self.output_dir.display(),
            "ingress-loadcheck configuration"
        );
    }
}

fn merge(cli: &CliArgs, file_cfg: Option<(PathBuf, FileConfig)>) -> Result<Config> {
    let (cfg_path, file_cfg) = file_cfg.unzip();
    let file_cfg = file_cfg.unwrap_or_default();
    let defaults = Config::default();

    let targets = if cli.targets.is_empty() {
        file_cfg.targets.unwrap_or(defaults.targets)
    } else {
        cli.targets
            .iter()
            .map(|raw| parse_target_arg(raw))
            .collect::<Result<Vec<_>>>()?
    };

    let method = match cli.method.clone().or(file_cfg.method) {
        Some(raw) => Method::from_bytes(raw.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| LoadCheckError::invalid(format!("invalid http method '{raw}'")))?,
        None => defaults.method,
    };

    let file_metrics = file_cfg.metrics;
    let metrics = MetricsConfig {
        mode: pick(cli.metrics_mode, file_metrics.mode, defaults.metrics.mode),
        prometheus_url: pick(
            cli.prometheus_url.clone(),
            file_metrics.prometheus_url,
            defaults.metrics.prometheus_url,
        ),
        namespace: pick(
            cli.metrics_namespace.clone(),
            file_metrics.namespace,
            defaults.metrics.namespace,
        ),
        port_forward: PortForwardConfig {
            service: file_metrics
                .service
                .unwrap_or(defaults.metrics.port_forward.service),
            namespace: file_metrics
                .service_namespace
                .unwrap_or(defaults.metrics.port_forward.namespace),
            remote_port: file_metrics
                .remote_port
                .unwrap_or(defaults.metrics.port_forward.remote_port),
            kubeconfig: cli.kubeconfig.clone().or(file_metrics.kubeconfig),
            ready_timeout: file_metrics
                .ready_timeout_seconds
                .unwrap_or(defaults.metrics.port_forward.ready_timeout),
        },
    };

    Ok(Config {
        targets,
        requests: pick(cli.requests, file_cfg.requests, defaults.requests),
        concurrency: pick(cli.concurrency, file_cfg.concurrency, defaults.concurrency),
        request_timeout: pick(
            cli.timeout,
            file_cfg.timeout_seconds,
            defaults.request_timeout,
        ),
        method,
        warmup_retries: pick(
            cli.warmup_retries,
            file_cfg.warmup_retries,
            defaults.warmup_retries,
        ),
        warmup_delay: pick(
            cli.warmup_delay,
            file_cfg.warmup_delay_seconds,
            defaults.warmup_delay,
        ),
        warmup_deadline: cli.warmup_deadline.or(file_cfg.warmup_deadline_seconds),
        resource_duration: cli
            .resource_duration
            .or(file_cfg.resource_duration_seconds),
        resource_interval: cli
            .resource_interval
            .or(file_cfg.resource_interval_seconds),
        sampler_attempts: pick(
            cli.sampler_attempts,
            file_cfg.sampler_attempts,
            defaults.sampler_attempts,
        ),
        sampler_backoff: pick(
            cli.sampler_backoff,
            file_cfg.sampler_backoff_seconds,
            defaults.sampler_backoff,
        ),
        metrics,
        run_deadline: cli.run_deadline.or(file_cfg.run_deadline_seconds),
        seed: cli.seed.or(file_cfg.seed),
        output_dir: pick(
            cli.output_dir.clone(),
            file_cfg.output_dir,
            defaults.output_dir,
        ),
        state_file: cli.state_file.clone().or(file_cfg.state_file),
        config_path: cfg_path,
    })
}

fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn default_prometheus_url() -> Url {
    Url::parse(DEFAULT_PROMETHEUS_URL).expect("default prometheus url is valid")
}

fn parse_target_arg(raw: &str) -> Result<TargetSpec> {
    let (name, url) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("invalid --target '{raw}': missing '='"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("invalid --target '{raw}': missing name");
    }
    let url = Url::parse(url.trim()).with_context(|| format!("invalid --target '{raw}'"))?;
    Ok(TargetSpec::new(name, url))
}

fn load_file_config(path: Option<&Path>) -> Result<Option<(PathBuf, FileConfig)>> {
    if let Some(path) = path {
        return read_config(path).map(|cfg| Some((path.to_path_buf(), cfg)));
    }

    let default_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if default_path.exists() {
        return read_config(&default_path).map(|cfg| Some((default_path, cfg)));
    }

    Ok(None)
}

fn read_config(path: &Path) -> Result<FileConfig> {
    if !path.exists() {
        bail!("config file {} does not exist", path.display());
    }
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let cfg: FileConfig = toml::from_str(&data)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(cfg)
}
