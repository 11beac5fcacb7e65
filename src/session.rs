use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, EngineSettings, RunConfig, RunPlan};
use crate::pool::WorkerPool;
use crate::stats::{FinalReport, LiveStats, StatAggregator, StopReason};
use crate::targets::TargetSet;
use crate::transport::Transport;
use crate::worker::Pacing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("a run is already in progress; stop it first")]
    AlreadyRunning,
    #[error("run task ended before its workers started")]
    Aborted,
}

/// Everything the engine reports to whoever renders it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Started { plan: RunPlan, active_workers: usize },
    Live(LiveStats),
    Finished(FinalReport),
}

pub type EventReceiver = mpsc::Receiver<SessionEvent>;

/// Events buffered for a slow consumer. Live events past this are dropped.
pub const EVENT_BUFFER: usize = 64;

/// Stop signal for one run. The first stopper decides the reason.
struct RunControl {
    cancel: CancellationToken,
    reason: OnceLock<StopReason>,
}

impl RunControl {
    fn new() -> Self {
        RunControl {
            cancel: CancellationToken::new(),
            reason: OnceLock::new(),
        }
    }

    /// Returns false when the run was already stopping.
    fn stop(&self, reason: StopReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.cancel.cancel();
        first
    }

    fn reason(&self) -> StopReason {
        self.reason.get().copied().unwrap_or(StopReason::Manual)
    }
}

struct Shared<T> {
    targets: TargetSet,
    transport: Arc<T>,
    settings: EngineSettings,
    state: watch::Sender<SessionState>,
    control: Mutex<Option<Arc<RunControl>>>,
    events: mpsc::Sender<SessionEvent>,
}

/// Runs at most one load run at a time. Cloning yields another handle to the
/// same session.
pub struct Session<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Session {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(targets: TargetSet, transport: Arc<T>, settings: EngineSettings) -> (Self, EventReceiver) {
        let (events, rx) = mpsc::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(SessionState::Idle);
        let session = Session {
            shared: Arc::new(Shared {
                targets,
                transport,
                settings,
                state,
                control: Mutex::new(None),
                events,
            }),
        };
        (session, rx)
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.state() != SessionState::Idle
    }

    /// Validates `config`, starts the pool and returns the derived plan. Invalid
    /// configurations and overlapping starts leave the session untouched.
    pub async fn request_start(&self, config: RunConfig) -> Result<RunPlan, StartError> {
        let plan = config.plan().inspect_err(|e| {
            tracing::warn!(error = %e, "rejected run configuration");
        })?;

        let claimed = self.shared.state.send_if_modified(|state| {
            if *state == SessionState::Idle {
                *state = SessionState::Starting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(StartError::AlreadyRunning);
        }

        tracing::info!(
            intensity = config.intensity,
            workers = plan.workers,
            delay = ?plan.delay,
            duration = ?plan.duration,
            mode = ?plan.mode,
            targets = self.shared.targets.len(),
            "starting run"
        );

        let control = Arc::new(RunControl::new());
        *self.shared.control.lock() = Some(control.clone());

        // The run is driven by its own task from here on, so dropping this
        // future can't strand the session in `Starting`.
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(run(self.shared.clone(), control, plan, started_tx));
        started_rx.await.map_err(|_| StartError::Aborted)?;

        Ok(plan)
    }

    /// Signals the current run to stop. Does nothing when idle.
    pub fn request_stop(&self) {
        if let Some(control) = self.shared.control.lock().as_ref() {
            if control.stop(StopReason::Manual) {
                tracing::info!("stop requested");
            }
        }
    }

    /// Resolves once the session is idle again.
    pub async fn wait_idle(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|s| *s == SessionState::Idle).await;
    }
}

async fn expire_after(control: Arc<RunControl>, bound: Duration) {
    tokio::select! {
        _ = control.cancel.cancelled() => {}
        _ = time::sleep(bound) => {
            if control.stop(StopReason::DurationElapsed) {
                tracing::info!(?bound, "duration limit reached");
            }
        }
    }
}

async fn report_live(
    stats: Arc<StatAggregator>,
    period: Duration,
    cancel: CancellationToken,
    events: mpsc::Sender<SessionEvent>,
) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous = stats.snapshot();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let current = stats.snapshot();
        let live = LiveStats::new(&current, &previous);
        tracing::debug!(requests = live.requests, errors = live.errors, rate = live.recent_rate, "live stats");
        if !try_emit(&events, SessionEvent::Live(live)) {
            break;
        }
        previous = current;
    }
}

/// Starts the pool, arms the timer and reporter, then waits for the stop
/// signal and walks the session through `Stopping` back to `Idle`.
async fn run<T: Transport>(
    shared: Arc<Shared<T>>,
    control: Arc<RunControl>,
    plan: RunPlan,
    started: oneshot::Sender<()>,
) {
    let settings = &shared.settings;
    let stats = Arc::new(StatAggregator::new(settings.sample_window));
    let pool = WorkerPool::start(
        plan.workers,
        Pacing::new(&plan, settings),
        stats.clone(),
        shared.targets.clone(),
        shared.transport.clone(),
        control.cancel.clone(),
    )
    .await;

    shared.state.send_replace(SessionState::Running);
    try_emit(
        &shared.events,
        SessionEvent::Started {
            plan,
            active_workers: pool.active(),
        },
    );
    let _ = started.send(());

    if let Some(bound) = plan.duration {
        tokio::spawn(expire_after(control.clone(), bound));
    }
    tokio::spawn(report_live(
        stats.clone(),
        settings.report_interval,
        control.cancel.clone(),
        shared.events.clone(),
    ));

    control.cancel.cancelled().await;
    shared.state.send_replace(SessionState::Stopping);

    let shutdown = pool.stop(settings.stop_grace).await;
    let report = FinalReport::new(&stats.snapshot(), control.reason(), shutdown.abandoned);
    tracing::info!(
        requests = report.requests,
        errors = report.errors,
        joined = shutdown.joined,
        elapsed = ?report.elapsed,
        reason = ?report.reason,
        "run finished"
    );

    *shared.control.lock() = None;
    shared.state.send_replace(SessionState::Idle);
    // Waits for room so the final report is never dropped.
    let _ = shared.events.send(SessionEvent::Finished(report)).await;
}

/// Returns false once the receiver is gone.
fn try_emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::debug!("event consumer is behind; dropping event");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
