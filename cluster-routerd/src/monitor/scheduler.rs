use std::time::{Duration, Instant};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use super::prober::ReachabilityProber;
use super::{ProbeOutcome, ReachabilityMonitor, RoundTarget};

/// Probe loop: one round, then sleep for the current interval, until stopped.
/// Stop is only observed between rounds.
pub async fn run(
    monitor: ReachabilityMonitor,
    mut interval_rx: watch::Receiver<Duration>,
    max_concurrent: usize,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }

        let targets = match monitor.start_round().await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!("Watch table unavailable, stopping scheduler: {}", e);
                break;
            }
        };

        if !targets.is_empty() {
            let started = Instant::now();
            let count = targets.len();
            let outcomes = probe_round(monitor.prober().as_ref(), targets, max_concurrent).await;
            let online = outcomes.iter().filter(|o| o.online).count();

            match monitor.finish_round(outcomes).await {
                Ok(changed) => tracing::debug!(
                    targets = count,
                    online,
                    changed,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Probe round complete"
                ),
                Err(e) => {
                    tracing::warn!("Watch table unavailable, stopping scheduler: {}", e);
                    break;
                }
            }
        }

        let period = *interval_rx.borrow_and_update();
        tokio::select! {
            _ = tokio::time::sleep(period) => {}
            _ = cancel.cancelled() => break,
        }
    }

    tracing::info!("Reachability scheduler shutting down");
}

/// Probe every target with at most `max_concurrent` probes in flight and
/// wait for all of them.
pub async fn probe_round(
    prober: &dyn ReachabilityProber,
    targets: Vec<RoundTarget>,
    max_concurrent: usize,
) -> Vec<ProbeOutcome> {
    stream::iter(targets)
        .map(|target| async move {
            let online = prober.probe(&target.address).await;
            tracing::trace!("{} ({}) probed {}", target.name, target.address, online);
            ProbeOutcome {
                target,
                online,
                checked_at: Utc::now(),
            }
        })
        .buffer_unordered(max_concurrent.max(1))
        .collect()
        .await
}
