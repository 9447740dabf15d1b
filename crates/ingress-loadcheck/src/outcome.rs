// Numan Thabit 2025
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Transport-level failure classes, derived from the client error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    Connect,
    Request,
    Body,
    Redirect,
    Other,
}

impl NetworkErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Request => "request",
            Self::Body => "body",
            Self::Redirect => "redirect",
            Self::Other => "other",
        }
    }

    pub fn classify(err: &reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Connect
        } else if err.is_body() || err.is_decode() {
            Self::Body
        } else if err.is_redirect() {
            Self::Redirect
        } else if err.is_request() {
            Self::Request
        } else {
            Self::Other
        }
    }
}

/// Result of one HTTP exchange. Failures are data, never errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success { status: u16 },
    HttpError { status: u16 },
    /// 2xx response whose body lacked the target's expected marker.
    UnexpectedBody { status: u16 },
    NetworkError { error: NetworkErrorKind },
    Timeout,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// True for any 2xx response, regardless of body checks.
    pub fn is_2xx(&self) -> bool {
        match self {
            Self::Success { status } | Self::UnexpectedBody { status } => {
                (200..300).contains(status)
            }
            _ => false,
        }
    }

    /// Stable label used for failure breakdowns; `None` for successes.
    pub fn failure_label(&self) -> Option<String> {
        match self {
            Self::Success { .. } => None,
            Self::HttpError { status } => Some(format!("http_{status}")),
            Self::UnexpectedBody { status } => Some(format!("unexpected_body_{status}")),
            Self::NetworkError { error } => Some(format!("network_{}", error.as_str())),
            Self::Timeout => Some("timeout".to_string()),
        }
    }
}

/// One measured request. Write-once.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestOutcome {
    pub target_name: String,
    pub issued_at: DateTime<Utc>,
    pub latency_ms: f64,
    pub outcome: Outcome,
}

/// Measurement-phase outcomes for one target, in completion order.
#[derive(Debug, Clone, Default)]
pub struct LatencySeries {
    target: String,
    outcomes: Vec<RequestOutcome>,
}

impl LatencySeries {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            outcomes: Vec::new(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn outcomes(&self) -> &[RequestOutcome] {
        &self.outcomes
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn push(&mut self, outcome: RequestOutcome) -> bool {
        if outcome.target_name != self.target {
            return false;
        }
        self.outcomes.push(outcome);
        true
    }
}

/// Concurrency-safe per-target accumulators shared by dispatch workers.
///
/// The set of series is fixed at construction; each append takes the owning
/// series' lock, so a record is either fully visible or not at all.
#[derive(Debug)]
pub struct SeriesBook {
    series: HashMap<String, Mutex<LatencySeries>>,
    recorded: AtomicUsize,
}

impl SeriesBook {
    pub fn new<I, S>(targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let series = targets
            .into_iter()
            .map(|name| {
                let name = name.as_ref().to_string();
                (name.clone(), Mutex::new(LatencySeries::new(name)))
            })
            .collect();
        Self {
            series,
            recorded: AtomicUsize::new(0),
        }
    }

    /// Append an outcome to its target's series. Returns `false` when the
    /// outcome names a target this book does not track.
    pub fn record(&self, outcome: RequestOutcome) -> bool {
        let Some(slot) = self.series.get(&outcome.target_name) else {
            tracing::warn!(host = %outcome.target_name, "dropping outcome for unknown target");
            return false;
        };
        let mut series = slot.lock();
        if series.push(outcome) {
            self.recorded.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Total outcomes recorded across all targets.
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Acquire)
    }

    /// Copy of one target's series.
    pub fn snapshot(&self, target: &str) -> Option<LatencySeries> {
        self.series.get(target).map(|slot| slot.lock().clone())
    }
}
