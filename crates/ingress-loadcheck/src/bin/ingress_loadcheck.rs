// Numan Thabit 2025
use std::{process::ExitCode, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use ingress_loadcheck::{
    artifacts,
    config::{CliArgs, Config},
    error::LoadCheckError,
    metrics_source::{self, MetricsSource},
    RunContext,
};
use tokio::{signal, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = CliArgs::parse();
    let config = match Config::from_cli(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %format!("{err:#}"), "invalid configuration");
            return ExitCode::from(2);
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "load check failed");
            let code = err
                .downcast_ref::<LoadCheckError>()
                .map(LoadCheckError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let ctx = RunContext::new(config)?;
    let config = ctx.config();

    let metrics = connect_metrics(config).await;

    let cancel = ctx.cancel_token();
    let watchdog = tokio::spawn(cancel_on_signal(cancel.clone(), config.run_deadline));

    let outcome = ctx.execute(metrics).await;
    cancel.cancel();
    watchdog.abort();
    let report = outcome?;

    let paths = artifacts::write_report(&config.output_dir, &report)
        .context("failed to write report artifacts")?;
    info!(
        json = %paths.json.display(),
        markdown = %paths.markdown.display(),
        "wrote load-test reports"
    );
    if let Some(state_file) = &config.state_file {
        artifacts::update_state(state_file, &paths, &report)
            .context("failed to update pipeline state")?;
        info!(state = %state_file.display(), "updated pipeline state");
    }

    println!("{}", report.render_markdown());
    Ok(())
}

async fn connect_metrics(config: &Config) -> Option<Arc<dyn MetricsSource>> {
    config.resource_window()?;
    match metrics_source::connect(&config.metrics).await {
        Ok(source) => {
            info!(source = %source.describe(), "resource monitoring enabled");
            Some(source)
        }
        Err(err) => {
            warn!(error = %err, "resource monitoring unavailable; continuing without it");
            None
        }
    }
}

async fn cancel_on_signal(cancel: CancellationToken, deadline: Option<Duration>) {
    let expired = async {
        match deadline {
            Some(deadline) => sleep(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = cancel.cancelled() => return,
        res = signal::ctrl_c() => {
            if let Err(err) = res {
                warn!(%err, "failed to install shutdown handler");
                return;
            }
            info!("shutdown signal received; abandoning in-flight requests");
        }
        _ = expired => {
            warn!("run deadline reached; abandoning in-flight requests");
        }
    }
    cancel.cancel();
}
