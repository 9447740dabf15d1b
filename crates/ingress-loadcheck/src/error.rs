// Numan Thabit 2025
use std::fmt;

/// Failures surfaced by the load-check engine.
///
/// Only [`LoadCheckError::InvalidConfiguration`] and
/// [`LoadCheckError::AllTargetsDegraded`] abort a run; the remaining variants
/// are logged and folded into the report as data.
#[derive(Debug, thiserror::Error)]
pub enum LoadCheckError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("all targets failed warm-up ({}); no measurement requests were issued", DisplayList(.targets))]
    AllTargetsDegraded { targets: Vec<String> },
    #[error("warm-up for {target} failed after {attempts} attempts")]
    WarmupExhausted { target: String, attempts: u32 },
    #[error("resource metrics unavailable: {0}")]
    MetricsUnavailable(String),
    #[error("failed to build http client: {0}")]
    Client(String),
}

impl LoadCheckError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfiguration(message.into())
    }

    /// Process exit code the binary reports for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::InvalidConfiguration(_) => 2,
            Self::AllTargetsDegraded { .. } => 3,
            _ => 1,
        }
    }
}

struct DisplayList<'a>(&'a [String]);

impl fmt::Display for DisplayList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

/// Errors raised by a [`crate::metrics_source::MetricsSource`] backend.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("metrics transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("metrics endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("query rejected: {0}")]
    Query(String),
    #[error("malformed query response: {0}")]
    Decode(String),
    #[error("tunnel failed: {0}")]
    Tunnel(String),
}
