// Numan Thabit 2025
use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{outcome::SeriesBook, probe::HttpProber, targets::Target};

#[derive(Debug, Clone, Copy)]
pub struct DispatchSettings {
    pub total_requests: usize,
    pub concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchSummary {
    /// Wall-clock span of the measurement phase.
    pub elapsed: Duration,
    pub recorded: usize,
    /// Set when cancellation stopped the phase before every request finished.
    pub interrupted: bool,
}

/// Pick a target index for every request, uniformly and independently.
pub fn plan_assignments<R: Rng + ?Sized>(targets: usize, total: usize, rng: &mut R) -> Vec<usize> {
    if targets == 0 {
        return Vec::new();
    }
    (0..total).map(|_| rng.gen_range(0..targets)).collect()
}

/// Run the measurement phase: `concurrency` workers drain a bounded queue of
/// assignments, each recording exactly one outcome per completed request.
pub async fn run<R: Rng + ?Sized>(
    admitted: &[Arc<Target>],
    prober: &HttpProber,
    series: &Arc<SeriesBook>,
    settings: DispatchSettings,
    rng: &mut R,
    cancel: &CancellationToken,
) -> DispatchSummary {
    let plan = plan_assignments(admitted.len(), settings.total_requests, rng);
    let workers = settings.concurrency.max(1);
    let (tx, rx) = mpsc::channel::<Arc<Target>>(workers * 2);
    let queue = Arc::new(Mutex::new(rx));

    info!(
        requests = plan.len(),
        workers,
        targets = admitted.len(),
        "starting measurement phase"
    );

    let start = Instant::now();
    let mut pool = JoinSet::new();
    for id in 0..workers {
        pool.spawn(worker(
            id,
            Arc::clone(&queue),
            prober.clone(),
            Arc::clone(series),
            cancel.clone(),
        ));
    }

    for index in plan {
        let target = Arc::clone(&admitted[index]);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(target) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    drop(tx);

    let mut recorded = 0;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(count) => recorded += count,
            Err(err) => warn!(error = %err, "dispatch worker panicked"),
        }
    }
    let elapsed = start.elapsed();
    let interrupted = recorded < settings.total_requests;

    if interrupted {
        warn!(
            recorded,
            requested = settings.total_requests,
            "measurement phase interrupted; in-flight requests abandoned"
        );
    } else {
        info!(
            recorded,
            elapsed_ms = elapsed.as_millis() as u64,
            "measurement phase complete"
        );
    }

    DispatchSummary {
        elapsed,
        recorded,
        interrupted,
    }
}

async fn worker(
    id: usize,
    queue: Arc<Mutex<mpsc::Receiver<Arc<Target>>>>,
    prober: HttpProber,
    series: Arc<SeriesBook>,
    cancel: CancellationToken,
) -> usize {
    let mut recorded = 0;
    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(target) = next else {
            break;
        };

        let probe = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            probe = prober.probe(&target) => probe,
        };

        if !probe.outcome.is_success() {
            debug!(
                worker = id,
                host = %target.name(),
                outcome = ?probe.outcome,
                latency_ms = probe.latency_ms(),
                "request failed"
            );
        }
        if series.record(probe.into_outcome(&target)) {
            recorded += 1;
        }
    }
    recorded
}
