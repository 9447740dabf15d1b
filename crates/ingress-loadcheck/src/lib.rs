// Numan Thabit 2025
//! ingress-loadcheck: post-deploy HTTP load and resource check for the PR ingress.

/// Report files and shared pipeline state.
pub mod artifacts;
/// CLI and TOML configuration.
pub mod config;
/// Bounded-concurrency measurement phase.
pub mod dispatch;
/// Error taxonomy and exit codes.
pub mod error;
/// Time-series backends queried during sampling.
pub mod metrics_source;
/// Request outcomes and per-target latency series.
pub mod outcome;
/// Single timed HTTP exchange.
pub mod probe;
/// JSON and Markdown run reports.
pub mod report;
/// End-to-end orchestration of one run.
pub mod runner;
/// Periodic resource sampling.
pub mod sampler;
/// Latency percentiles and success rates.
pub mod stats;
/// Target definitions and registry.
pub mod targets;
/// Pre-measurement readiness checks.
pub mod warmup;

pub use config::{CliArgs, Config};
pub use error::{LoadCheckError, MetricsError};
pub use report::RunReport;
pub use runner::RunContext;
