// Numan Thabit 2025
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use tokio::time::{timeout, Instant};

use crate::{
    error::LoadCheckError,
    outcome::{NetworkErrorKind, Outcome, RequestOutcome},
    targets::{Target, TargetRegistry},
};

/// A single timed exchange with a target.
#[derive(Debug, Clone)]
pub struct Probe {
    pub issued_at: DateTime<Utc>,
    pub latency: Duration,
    pub outcome: Outcome,
}

impl Probe {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1_000.0
    }

    pub fn into_outcome(self, target: &Target) -> RequestOutcome {
        RequestOutcome {
            target_name: target.name().to_string(),
            issued_at: self.issued_at,
            latency_ms: self.latency_ms(),
            outcome: self.outcome,
        }
    }
}

/// HTTP client shared by warm-up and measurement, enforcing the per-request
/// deadline around the whole exchange (headers and body).
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: Client,
    method: Method,
    deadline: Duration,
}

impl HttpProber {
    pub fn new(
        registry: &TargetRegistry,
        method: Method,
        deadline: Duration,
        pool_size: usize,
    ) -> Result<Self, LoadCheckError> {
        let mut builder = Client::builder()
            .tcp_nodelay(true)
            .pool_max_idle_per_host(pool_size.max(1))
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .connect_timeout(deadline);
        for target in registry.targets() {
            if let (Some(addr), Some(host)) = (target.resolve(), target.base_url().host_str()) {
                builder = builder.resolve(host, addr);
            }
        }
        let client = builder
            .build()
            .map_err(|err| LoadCheckError::Client(err.to_string()))?;
        Ok(Self {
            client,
            method,
            deadline,
        })
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Issue one request. Never fails: every failure is folded into the outcome.
    pub async fn probe(&self, target: &Target) -> Probe {
        let issued_at = Utc::now();
        let start = Instant::now();
        let outcome = match timeout(self.deadline, self.exchange(target)).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Timeout,
        };
        Probe {
            issued_at,
            latency: start.elapsed(),
            outcome,
        }
    }

    async fn exchange(&self, target: &Target) -> Outcome {
        let response = match self
            .client
            .request(self.method.clone(), target.request_url().clone())
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => return classify_error(&err),
        };

        let status = response.status();
        let code = status.as_u16();
        if !status.is_success() {
            // drain so the connection returns to the pool
            let _ = response.bytes().await;
            return Outcome::HttpError { status: code };
        }

        match target.expect_body() {
            Some(marker) => match response.text().await {
                Ok(body) if body.contains(marker) => Outcome::Success { status: code },
                Ok(_) => Outcome::UnexpectedBody { status: code },
                Err(err) => classify_error(&err),
            },
            None => match response.bytes().await {
                Ok(_) => Outcome::Success { status: code },
                Err(err) => classify_error(&err),
            },
        }
    }
}

fn classify_error(err: &reqwest::Error) -> Outcome {
    if err.is_timeout() {
        Outcome::Timeout
    } else {
        Outcome::NetworkError {
            error: NetworkErrorKind::classify(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use url::Url;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::targets::TargetSpec;

    fn registry_for(spec: TargetSpec) -> TargetRegistry {
        TargetRegistry::from_specs(&[spec]).expect("registry")
    }

    fn prober(registry: &TargetRegistry, deadline: Duration) -> HttpProber {
        HttpProber::new(registry, Method::GET, deadline, 4).expect("prober")
    }

    #[tokio::test]
    async fn success_requires_expected_marker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("hello from foo"))
            .mount(&server)
            .await;

        let url = Url::parse(&server.uri()).expect("uri");
        let ok = registry_for(TargetSpec::new("foo", url.clone()).with_expect_body("foo"));
        let probe = prober(&ok, Duration::from_secs(2))
            .probe(&ok.targets()[0])
            .await;
        assert_eq!(probe.outcome, Outcome::Success { status: 200 });

        let wrong = registry_for(TargetSpec::new("bar", url).with_expect_body("bar"));
        let probe = prober(&wrong, Duration::from_secs(2))
            .probe(&wrong.targets()[0])
            .await;
        assert_eq!(probe.outcome, Outcome::UnexpectedBody { status: 200 });
        assert!(probe.outcome.is_2xx());
    }

    #[tokio::test]
    async fn non_2xx_is_recorded_as_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let registry = registry_for(TargetSpec::new(
            "foo",
            Url::parse(&server.uri()).expect("uri"),
        ));
        let probe = prober(&registry, Duration::from_secs(2))
            .probe(&registry.targets()[0])
            .await;
        assert_eq!(probe.outcome, Outcome::HttpError { status: 503 });
    }

    #[tokio::test]
    async fn slow_response_times_out_at_deadline() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let registry = registry_for(TargetSpec::new(
            "foo",
            Url::parse(&server.uri()).expect("uri"),
        ));
        let probe = prober(&registry, Duration::from_millis(150))
            .probe(&registry.targets()[0])
            .await;
        assert_eq!(probe.outcome, Outcome::Timeout);
        assert!(probe.latency < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let registry = registry_for(TargetSpec::new(
            "gone",
            Url::parse(&format!("http://{addr}/")).expect("url"),
        ));
        let probe = prober(&registry, Duration::from_secs(2))
            .probe(&registry.targets()[0])
            .await;
        assert_eq!(
            probe.outcome,
            Outcome::NetworkError {
                error: NetworkErrorKind::Connect
            }
        );
    }
}
