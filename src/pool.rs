use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Barrier;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::stats::StatAggregator;
use crate::targets::TargetSet;
use crate::transport::Transport;
use crate::worker::{Pacing, Worker};

/// Result of a bounded shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolShutdown {
    pub joined: usize,
    /// Still running when the grace period ran out. Left to finish on their own.
    pub abandoned: usize,
}

/// The workers of one run. `stop` consumes the pool, so a pool can neither be
/// restarted nor stopped twice.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Spawns `workers` workers sharing `cancel` and `stats`. Returns once every
    /// worker is running.
    pub async fn start<T: Transport>(
        workers: usize,
        pacing: Pacing,
        stats: Arc<StatAggregator>,
        targets: TargetSet,
        transport: Arc<T>,
        cancel: CancellationToken,
    ) -> Self {
        let active = Arc::new(AtomicUsize::new(0));
        let ready = Arc::new(Barrier::new(workers + 1));
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let worker = Worker::new(
                id,
                transport.clone(),
                targets.clone(),
                stats.clone(),
                pacing,
                cancel.clone(),
            );
            handles.push(tokio::spawn(worker.run(active.clone(), ready.clone())));
        }

        ready.wait().await;
        let started = active.load(Ordering::SeqCst);
        metrics::gauge!("netstress_active_workers").set(started as f64);
        tracing::info!(workers = started, "worker pool started");

        WorkerPool {
            handles,
            cancel,
            active,
        }
    }

    /// Workers currently inside their loop.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Signals every worker and waits at most `grace` for them to return.
    pub async fn stop(self, grace: Duration) -> PoolShutdown {
        self.cancel.cancel();

        let total = self.handles.len();
        let mut pending: FuturesUnordered<_> = self.handles.into_iter().collect();
        let mut joined = 0;
        let drained = time::timeout(grace, async {
            while let Some(result) = pending.next().await {
                if let Err(e) = result {
                    tracing::warn!(error = %e, "worker task failed");
                }
                joined += 1;
            }
        })
        .await;

        // Dropping a JoinHandle detaches the task; stragglers are not aborted.
        drop(pending);
        let abandoned = total - joined;
        if drained.is_err() {
            tracing::warn!(abandoned, ?grace, "workers still unwinding after grace period");
        }
        metrics::gauge!("netstress_active_workers").set(self.active.load(Ordering::SeqCst) as f64);
        tracing::info!(joined, abandoned, "worker pool stopped");

        PoolShutdown { joined, abandoned }
    }
}
