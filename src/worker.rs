use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Barrier;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::config::{EngineSettings, LoadMode, RunPlan};
use crate::stats::StatAggregator;
use crate::targets::TargetSet;
use crate::transport::Transport;

/// How long a worker waits between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub delay: Duration,
    pub mode: LoadMode,
    pub failure_backoff: Duration,
    pub saturation_pause: Duration,
}

impl Pacing {
    pub fn new(plan: &RunPlan, settings: &EngineSettings) -> Self {
        Pacing {
            delay: plan.delay,
            mode: plan.mode,
            failure_backoff: settings.failure_backoff,
            saturation_pause: settings.saturation_pause,
        }
    }

    fn after_success(&self) -> Duration {
        match self.mode {
            LoadMode::Probe => self.delay,
            LoadMode::Saturate => self.delay.max(self.saturation_pause),
        }
    }

    fn after_failure(&self) -> Duration {
        match self.mode {
            LoadMode::Probe => self.delay,
            // A dead link fails fast; don't spin on it.
            LoadMode::Saturate => self.delay.max(self.failure_backoff),
        }
    }
}

pub struct Worker<T> {
    id: usize,
    transport: Arc<T>,
    targets: TargetSet,
    stats: Arc<StatAggregator>,
    pacing: Pacing,
    cancel: CancellationToken,
}

impl<T: Transport> Worker<T> {
    pub fn new(
        id: usize,
        transport: Arc<T>,
        targets: TargetSet,
        stats: Arc<StatAggregator>,
        pacing: Pacing,
        cancel: CancellationToken,
    ) -> Self {
        Worker {
            id,
            transport,
            targets,
            stats,
            pacing,
            cancel,
        }
    }

    /// Registers in `active`, waits at `ready` with the rest of the pool, then loops
    /// until cancelled.
    pub async fn run(self, active: Arc<AtomicUsize>, ready: Arc<Barrier>) {
        active.fetch_add(1, Ordering::SeqCst);
        let _active = ActiveGuard(active);
        ready.wait().await;
        tracing::trace!(worker = self.id, "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let target = self.targets.pick();
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                result = self.transport.fetch(target) => result,
            };

            let pause = match result {
                Ok(fetched) => {
                    tracing::trace!(worker = self.id, %target, status = %fetched.status, bytes = fetched.bytes, "request completed");
                    self.stats.record_success(start.elapsed(), fetched.bytes);
                    self.pacing.after_success()
                }
                Err(e) => {
                    tracing::debug!(worker = self.id, %target, error = %e, "request failed");
                    self.stats.record_error();
                    self.pacing.after_failure()
                }
            };

            if pause.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(pause) => {}
            }
        }

        tracing::trace!(worker = self.id, "worker stopped");
    }
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{mock_targets, ScriptedTransport};

    fn pacing(mode: LoadMode, delay_ms: u64) -> Pacing {
        Pacing {
            delay: Duration::from_millis(delay_ms),
            mode,
            failure_backoff: Duration::from_secs(1),
            saturation_pause: Duration::from_millis(50),
        }
    }

    fn spawn_worker(
        transport: &Arc<ScriptedTransport>,
        stats: &Arc<StatAggregator>,
        pacing: Pacing,
        cancel: &CancellationToken,
    ) -> (tokio::task::JoinHandle<()>, Arc<AtomicUsize>) {
        let worker = Worker::new(
            0,
            transport.clone(),
            mock_targets(),
            stats.clone(),
            pacing,
            cancel.clone(),
        );
        let active = Arc::new(AtomicUsize::new(0));
        let handle = tokio::spawn(worker.run(active.clone(), Arc::new(Barrier::new(1))));
        (handle, active)
    }

    #[test]
    fn saturation_backs_off_after_failures() {
        let saturate = pacing(LoadMode::Saturate, 10);
        assert_eq!(saturate.after_failure(), Duration::from_secs(1));
        assert_eq!(saturate.after_success(), Duration::from_millis(50));

        let endpoints = pacing(LoadMode::Probe, 10);
        assert_eq!(endpoints.after_failure(), Duration::from_millis(10));
        assert_eq!(endpoints.after_success(), Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn records_successes_and_failures() {
        let transport = ScriptedTransport::new(Duration::from_millis(50))
            .failing_every(3)
            .with_body(64)
            .shared();
        let stats = Arc::new(StatAggregator::new(100));
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&transport, &stats, pacing(LoadMode::Probe, 50), &cancel);

        // Six full cycles of 50ms request + 50ms delay.
        time::sleep(Duration::from_millis(575)).await;
        cancel.cancel();
        handle.await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(transport.calls(), 6);
        assert_eq!(snap.requests, 4);
        assert_eq!(snap.errors, 2);
        assert_eq!(snap.bytes, 4 * 64);
        assert!(snap.samples.iter().all(|s| *s == Duration::from_millis(50)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_the_delay() {
        let transport = ScriptedTransport::new(Duration::from_millis(1)).shared();
        let stats = Arc::new(StatAggregator::new(10));
        let cancel = CancellationToken::new();
        let (handle, active) =
            spawn_worker(&transport, &stats, pacing(LoadMode::Probe, 60_000), &cancel);

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(active.load(Ordering::SeqCst), 1);
        let stopped_at = Instant::now();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(stopped_at.elapsed(), Duration::ZERO);
        assert_eq!(transport.calls(), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_an_in_flight_request() {
        let transport = ScriptedTransport::new(Duration::from_secs(30)).shared();
        let stats = Arc::new(StatAggregator::new(10));
        let cancel = CancellationToken::new();
        let (handle, _) = spawn_worker(&transport, &stats, pacing(LoadMode::Saturate, 0), &cancel);

        time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await.unwrap();

        let snap = stats.snapshot();
        assert_eq!(transport.calls(), 1);
        assert_eq!((snap.requests, snap.errors), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn never_starts_when_already_cancelled() {
        let transport = ScriptedTransport::new(Duration::from_millis(1)).shared();
        let stats = Arc::new(StatAggregator::new(10));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let (handle, _) = spawn_worker(&transport, &stats, pacing(LoadMode::Probe, 10), &cancel);
        handle.await.unwrap();
        assert_eq!(transport.calls(), 0);
    }
}
