//! Reachability monitor
//!
//! The watch table is owned by a dedicated thread; callers and the scheduler
//! talk to it through a command channel. The scheduler re-probes every
//! watched target once per interval.

pub mod prober;
pub mod scheduler;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::types::WatchTarget;
use crate::error::MonitorError;
use self::prober::ReachabilityProber;

/// A target as handed to a probe round
#[derive(Debug, Clone)]
pub struct RoundTarget {
    pub name: String,
    pub address: String,
    generation: u64,
}

/// Result of probing one target during a round
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub target: RoundTarget,
    pub online: bool,
    pub checked_at: DateTime<Utc>,
}

/// Commands sent to the table thread
enum MonitorCommand {
    Insert(WatchTarget, oneshot::Sender<Result<(), MonitorError>>),
    Remove(String, oneshot::Sender<()>),
    IsOnline(String, oneshot::Sender<Result<bool, MonitorError>>),
    IsWatching(String, oneshot::Sender<bool>),
    List(oneshot::Sender<Vec<WatchTarget>>),
    StartRound(oneshot::Sender<Vec<RoundTarget>>),
    FinishRound(Vec<ProbeOutcome>, oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),
}

struct Entry {
    target: WatchTarget,
    /// Bumped on every (re-)registration so late round results for a
    /// replaced target are dropped
    generation: u64,
}

#[derive(Default)]
struct WatchTable {
    entries: HashMap<String, Entry>,
    next_generation: u64,
    stopped: bool,
}

impl WatchTable {
    fn insert(&mut self, target: WatchTarget) -> Result<(), MonitorError> {
        if self.stopped {
            return Err(MonitorError::Stopped);
        }
        self.next_generation += 1;
        let generation = self.next_generation;
        self.entries.insert(target.name.clone(), Entry { target, generation });
        Ok(())
    }

    fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    fn is_online(&self, name: &str) -> Result<bool, MonitorError> {
        self.entries
            .get(name)
            .map(|entry| entry.target.online)
            .ok_or_else(|| MonitorError::NotWatched(name.to_string()))
    }

    fn list(&self) -> Vec<WatchTarget> {
        let mut targets: Vec<WatchTarget> = self.entries.values().map(|e| e.target.clone()).collect();
        targets.sort_by(|a, b| a.name.cmp(&b.name));
        targets
    }

    fn round_targets(&self) -> Vec<RoundTarget> {
        self.entries
            .values()
            .map(|entry| RoundTarget {
                name: entry.target.name.clone(),
                address: entry.target.address.clone(),
                generation: entry.generation,
            })
            .collect()
    }

    /// Write back round results. Returns how many targets changed state.
    fn apply(&mut self, outcomes: Vec<ProbeOutcome>) -> usize {
        if self.stopped {
            return 0;
        }

        let mut changed = 0;
        for outcome in outcomes {
            let Some(entry) = self.entries.get_mut(&outcome.target.name) else {
                continue;
            };
            if entry.generation != outcome.target.generation {
                continue;
            }
            if entry.target.online != outcome.online {
                tracing::info!(
                    "{} ({}) is now {}",
                    entry.target.name,
                    entry.target.address,
                    if outcome.online { "online" } else { "offline" }
                );
                changed += 1;
            }
            entry.target.online = outcome.online;
            entry.target.last_checked = outcome.checked_at;
        }
        changed
    }

    fn stop(&mut self) {
        self.stopped = true;
        self.entries.clear();
    }
}

/// Handle to the reachability monitor. Cheap to clone; every clone talks to
/// the same table and scheduler.
#[derive(Clone)]
pub struct ReachabilityMonitor {
    tx: mpsc::Sender<MonitorCommand>,
    prober: Arc<dyn ReachabilityProber>,
    interval_tx: Arc<watch::Sender<Duration>>,
    cancel: CancellationToken,
}

impl ReachabilityMonitor {
    /// Spawn the table thread and start the scheduler immediately.
    /// Must be called from within a tokio runtime.
    pub fn start(
        prober: Arc<dyn ReachabilityProber>,
        interval: Duration,
        max_concurrent_probes: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MonitorCommand>(256);

        thread::spawn(move || {
            let mut table = WatchTable::default();
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    MonitorCommand::Insert(target, reply) => {
                        let _ = reply.send(table.insert(target));
                    }
                    MonitorCommand::Remove(name, reply) => {
                        table.remove(&name);
                        let _ = reply.send(());
                    }
                    MonitorCommand::IsOnline(name, reply) => {
                        let _ = reply.send(table.is_online(&name));
                    }
                    MonitorCommand::IsWatching(name, reply) => {
                        let _ = reply.send(table.entries.contains_key(&name));
                    }
                    MonitorCommand::List(reply) => {
                        let _ = reply.send(table.list());
                    }
                    MonitorCommand::StartRound(reply) => {
                        let _ = reply.send(table.round_targets());
                    }
                    MonitorCommand::FinishRound(outcomes, reply) => {
                        let _ = reply.send(table.apply(outcomes));
                    }
                    MonitorCommand::Stop(reply) => {
                        table.stop();
                        let _ = reply.send(());
                    }
                }
            }
            tracing::debug!("Watch table thread exiting");
        });

        let (interval_tx, interval_rx) = watch::channel(interval);
        let monitor = Self {
            tx,
            prober,
            interval_tx: Arc::new(interval_tx),
            cancel: CancellationToken::new(),
        };

        let handle = tokio::spawn(scheduler::run(
            monitor.clone(),
            interval_rx,
            max_concurrent_probes.max(1),
            monitor.cancel.clone(),
        ));

        tracing::info!("Reachability monitor started, interval {:?}", interval);
        (monitor, handle)
    }

    /// Register or replace `name`, probe it right away and return the result.
    pub async fn watch(&self, name: &str, address: &str) -> Result<bool, MonitorError> {
        if self.cancel.is_cancelled() {
            return Err(MonitorError::Stopped);
        }

        let online = self.prober.probe(address).await;
        let target = WatchTarget {
            name: name.to_string(),
            address: address.to_string(),
            online,
            last_checked: Utc::now(),
        };

        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Insert(target, reply)).await?;
        rx.await.map_err(|_| MonitorError::Stopped)??;

        tracing::info!("Watching {} at {} ({})", name, address, if online { "online" } else { "offline" });
        Ok(online)
    }

    /// Stop watching `name`. Removing an unknown name is a no-op.
    pub async fn unwatch(&self, name: &str) -> Result<(), MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::Remove(name.to_string(), reply)).await?;
        rx.await.map_err(|_| MonitorError::Stopped)?;
        tracing::info!("Stopped watching {}", name);
        Ok(())
    }

    /// Last known liveness of `name`; does not probe.
    pub async fn is_online(&self, name: &str) -> Result<bool, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::IsOnline(name.to_string(), reply)).await?;
        rx.await.map_err(|_| MonitorError::Stopped)?
    }

    pub async fn is_watching(&self, name: &str) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.send(MonitorCommand::IsWatching(name.to_string(), reply)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// All watched targets, sorted by name
    pub async fn targets(&self) -> Result<Vec<WatchTarget>, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::List(reply)).await?;
        rx.await.map_err(|_| MonitorError::Stopped)
    }

    /// Change the probe period; applies from the next sleep on.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_tx.send_replace(interval);
        tracing::info!("Monitor interval set to {:?}", interval);
    }

    pub fn interval(&self) -> Duration {
        *self.interval_tx.borrow()
    }

    /// Stop the scheduler and clear the table. A round already in flight
    /// finishes, but its results are discarded.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let (reply, rx) = oneshot::channel();
        if self.send(MonitorCommand::Stop(reply)).await.is_ok() {
            let _ = rx.await;
        }
        tracing::info!("Reachability monitor stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn prober(&self) -> &Arc<dyn ReachabilityProber> {
        &self.prober
    }

    pub(crate) async fn start_round(&self) -> Result<Vec<RoundTarget>, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::StartRound(reply)).await?;
        rx.await.map_err(|_| MonitorError::Stopped)
    }

    pub(crate) async fn finish_round(&self, outcomes: Vec<ProbeOutcome>) -> Result<usize, MonitorError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCommand::FinishRound(outcomes, reply)).await?;
        rx.await.map_err(|_| MonitorError::Stopped)
    }

    async fn send(&self, cmd: MonitorCommand) -> Result<(), MonitorError> {
        self.tx.send(cmd).await.map_err(|_| MonitorError::Stopped)
    }
}
