// Numan Thabit 2025
use std::{path::PathBuf, process::Stdio, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use tokio::{
    process::{Child, Command},
    sync::Mutex,
    time::{sleep, timeout, Instant},
};
use tracing::{info, warn};

use crate::error::MetricsError;

/// Instantaneous query capability over a time-series backend.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Human-readable endpoint description for logs.
    fn describe(&self) -> String;

    /// Evaluate `query` at `at`, summing every returned series.
    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<f64, MetricsError>;

    /// Release resources held by the source.
    async fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MetricsMode {
    /// Query the configured URL as-is.
    Direct,
    /// Always reach Prometheus through `kubectl port-forward`.
    PortForward,
    /// Use the direct URL when healthy, otherwise open a port-forward.
    Auto,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PortForwardConfig {
    pub service: String,
    pub namespace: String,
    pub remote_port: u16,
    pub kubeconfig: Option<PathBuf>,
    pub ready_timeout: Duration,
}

impl Default for PortForwardConfig {
    fn default() -> Self {
        Self {
            service: "prometheus".to_string(),
            namespace: "monitoring".to_string(),
            remote_port: 9090,
            kubeconfig: None,
            ready_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsConfig {
    pub mode: MetricsMode,
    pub prometheus_url: Url,
    /// Kubernetes namespace whose workloads are sampled.
    pub namespace: String,
    pub port_forward: PortForwardConfig,
}

/// Build the source selected by `config.mode`.
pub async fn connect(config: &MetricsConfig) -> Result<Arc<dyn MetricsSource>, MetricsError> {
    let direct = PrometheusSource::new(config.prometheus_url.clone())?;
    match config.mode {
        MetricsMode::Direct => {
            if !direct.ready().await {
                return Err(MetricsError::Tunnel(format!(
                    "prometheus at {} is not healthy",
                    config.prometheus_url
                )));
            }
            Ok(Arc::new(direct))
        }
        MetricsMode::PortForward => Ok(Arc::new(
            PortForwardSource::open(&config.port_forward, direct).await?,
        )),
        MetricsMode::Auto => {
            if direct.ready().await {
                info!(url = %config.prometheus_url, "prometheus reachable directly");
                return Ok(Arc::new(direct));
            }
            info!(
                url = %config.prometheus_url,
                "prometheus not directly reachable; attempting port-forward"
            );
            Ok(Arc::new(
                PortForwardSource::open(&config.port_forward, direct).await?,
            ))
        }
    }
}

/// Prometheus HTTP API client (`/api/v1/query`).
#[derive(Debug, Clone)]
pub struct PrometheusSource {
    client: Client,
    base: Url,
}

impl PrometheusSource {
    pub fn new(mut base: Url) -> Result<Self, MetricsError> {
        // relative joins must extend a route prefix, not replace its last segment
        if !base.path().ends_with('/') {
            let prefixed = format!("{}/", base.path());
            base.set_path(&prefixed);
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(2)
            .build()?;
        Ok(Self { client, base })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn ready(&self) -> bool {
        let Ok(url) = self.base.join("-/healthy") else {
            return false;
        };
        match self
            .client
            .get(url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl MetricsSource for PrometheusSource {
    fn describe(&self) -> String {
        self.base.to_string()
    }

    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<f64, MetricsError> {
        let url = self
            .base
            .join("api/v1/query")
            .map_err(|err| MetricsError::Query(err.to_string()))?;
        let time = format!("{:.3}", at.timestamp_millis() as f64 / 1_000.0);
        let response = self
            .client
            .get(url)
            .query(&[("query", query), ("time", time.as_str())])
            .send()
            .await?;
        let status = response.status();
        let body: QueryResponse = match response.json().await {
            Ok(body) => body,
            Err(_) if !status.is_success() => return Err(MetricsError::Status(status)),
            Err(err) => return Err(MetricsError::Decode(err.to_string())),
        };
        body.into_value()
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    value: (f64, String),
}

impl QueryResponse {
    fn into_value(self) -> Result<f64, MetricsError> {
        if self.status != "success" {
            return Err(MetricsError::Query(
                self.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        let data = self
            .data
            .ok_or_else(|| MetricsError::Decode("missing data".to_string()))?;
        match data.result_type.as_str() {
            "vector" => {
                let samples: Vec<VectorSample> = serde_json::from_value(data.result)
                    .map_err(|err| MetricsError::Decode(err.to_string()))?;
                samples
                    .iter()
                    .map(|sample| parse_sample(&sample.value.1))
                    .try_fold(0.0, |acc, value| value.map(|v| acc + v))
            }
            "scalar" => {
                let (_, raw): (f64, String) = serde_json::from_value(data.result)
                    .map_err(|err| MetricsError::Decode(err.to_string()))?;
                parse_sample(&raw)
            }
            other => Err(MetricsError::Decode(format!(
                "unsupported result type {other}"
            ))),
        }
    }
}

fn parse_sample(raw: &str) -> Result<f64, MetricsError> {
    let value = raw
        .parse::<f64>()
        .map_err(|err| MetricsError::Decode(format!("sample '{raw}': {err}")))?;
    // rate() over an idle window yields NaN; count it as zero
    Ok(if value.is_finite() { value } else { 0.0 })
}

/// Prometheus reached through a `kubectl port-forward` child process.
pub struct PortForwardSource {
    inner: PrometheusSource,
    child: Mutex<Option<Child>>,
    grace: Duration,
}

impl PortForwardSource {
    /// Spawn the tunnel towards `direct`'s local port and wait until Prometheus answers.
    pub async fn open(
        config: &PortForwardConfig,
        direct: PrometheusSource,
    ) -> Result<Self, MetricsError> {
        let host = direct.base().host_str().unwrap_or_default();
        if !matches!(host, "localhost" | "127.0.0.1") {
            return Err(MetricsError::Tunnel(format!(
                "port-forward only supported for localhost targets, got {host}"
            )));
        }
        let local_port = direct.base().port_or_known_default().unwrap_or(9090);

        let mut cmd = Command::new("kubectl");
        cmd.kill_on_drop(true)
            .arg("port-forward")
            .arg(format!("svc/{}", config.service))
            .arg(format!("{local_port}:{}", config.remote_port))
            .arg("-n")
            .arg(&config.namespace)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(kubeconfig) = &config.kubeconfig {
            cmd.env("KUBECONFIG", kubeconfig);
        }

        info!(
            service = %config.service,
            namespace = %config.namespace,
            local_port,
            "starting kubectl port-forward for prometheus"
        );
        let mut child = cmd
            .spawn()
            .map_err(|err| MetricsError::Tunnel(format!("failed to spawn kubectl: {err}")))?;

        let deadline = Instant::now() + config.ready_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(MetricsError::Tunnel(format!(
                    "kubectl port-forward exited unexpectedly with {status}"
                )));
            }
            if direct.ready().await {
                info!(url = %direct.base(), "port-forward established");
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(MetricsError::Tunnel(
                    "timed out waiting for port-forward to become ready".to_string(),
                ));
            }
            sleep(Duration::from_millis(500)).await;
        }

        Ok(Self {
            inner: direct,
            child: Mutex::new(Some(child)),
            grace: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl MetricsSource for PortForwardSource {
    fn describe(&self) -> String {
        format!("{} (port-forward)", self.inner.base())
    }

    async fn query(&self, query: &str, at: DateTime<Utc>) -> Result<f64, MetricsError> {
        self.inner.query(query, at).await
    }

    async fn close(&self) {
        let Some(mut child) = self.child.lock().await.take() else {
            return;
        };
        info!("stopping prometheus port-forward");
        if let Err(err) = child.start_kill() {
            warn!(%err, "failed to signal port-forward");
        }
        match timeout(self.grace, child.wait()).await {
            Ok(Ok(status)) => info!(?status, "port-forward exited"),
            Ok(Err(err)) => warn!(%err, "failed to await port-forward exit"),
            Err(_) => warn!("port-forward did not exit in time"),
        }
    }
}
