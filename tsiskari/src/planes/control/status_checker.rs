use crate::domain::{CheckOutcome, GateStatus};
use crate::planes::control::deadline::{Raced, race_deadline};
use crate::ports::StatusProbe;
use shared::config::SyncConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckerConfig {
    /// Wait before the first check so it does not compete with first paint.
    pub initial_delay: Duration,
    pub interval: Duration,
    pub timeout: Duration,
}

impl CheckerConfig {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            initial_delay: config.check_initial_delay,
            interval: config.check_interval,
            timeout: config.check_timeout,
        }
    }
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckerState {
    Idle,
    Checking,
    Confirmed(GateStatus),
    TimedOut,
    Failed(String),
}

impl From<CheckOutcome> for CheckerState {
    fn from(outcome: CheckOutcome) -> Self {
        match outcome {
            CheckOutcome::Confirmed(status) => CheckerState::Confirmed(status),
            CheckOutcome::TimedOut => CheckerState::TimedOut,
            CheckOutcome::Failed(reason) => CheckerState::Failed(reason),
        }
    }
}

/// What consumers observe. `gated` only changes when a check completes, so
/// a check in progress keeps the previous decision on screen.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CheckerStatus {
    pub state: CheckerState,
    pub gated: bool,
}

impl Default for CheckerStatus {
    fn default() -> Self {
        Self {
            state: CheckerState::Idle,
            gated: false,
        }
    }
}

struct Inner {
    probe: Arc<dyn StatusProbe>,
    config: CheckerConfig,
    status: watch::Sender<CheckerStatus>,
    /// Generation of the check in flight, 0 when none is.
    in_flight: AtomicU64,
    /// Bumped on every stop; a check only publishes into the generation it
    /// started in.
    generation: AtomicU64,
    live: AtomicBool,
}

/// Releases the in-flight slot even when the check future is dropped, unless
/// a check from a later generation has taken it over.
struct CheckingGuard<'a> {
    slot: &'a AtomicU64,
    generation: u64,
}

impl Drop for CheckingGuard<'_> {
    fn drop(&mut self) {
        let _ = self
            .slot
            .compare_exchange(self.generation, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.live.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    async fn check(&self, generation: u64) -> Option<CheckOutcome> {
        let probe = self.probe.name();
        let claimed = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |running| {
                (running != generation).then_some(generation)
            });
        if claimed.is_err() {
            debug!(probe, "check already in flight, collapsing trigger");
            return None;
        }
        let _guard = CheckingGuard {
            slot: &self.in_flight,
            generation,
        };

        if self.is_current(generation) {
            self.status.send_modify(|s| s.state = CheckerState::Checking);
        }

        let outcome = match race_deadline(self.config.timeout, self.probe.probe()).await {
            Raced::Settled(Ok(status)) => {
                debug!(probe, ?status, "status confirmed");
                CheckOutcome::Confirmed(status)
            }
            Raced::Settled(Err(e)) => {
                warn!(probe, error = %e, "status check failed, failing open");
                CheckOutcome::Failed(e.to_string())
            }
            Raced::Expired(after) => {
                warn!(probe, ?after, "status check timed out, failing open");
                CheckOutcome::TimedOut
            }
        };

        if !self.is_current(generation) {
            debug!(probe, generation, "checker stopped, discarding late result");
            return Some(outcome);
        }

        self.status.send_replace(CheckerStatus {
            gated: outcome.is_gated(),
            state: outcome.clone().into(),
        });
        Some(outcome)
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken, generation: u64) {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = sleep(self.config.initial_delay) => {}
        }

        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.check(generation) => {}
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
        }
        debug!(probe = self.probe.name(), "checker loop exited");
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic moderation check raced against a timeout.
///
/// `Idle -> Checking -> Confirmed | TimedOut | Failed`. Only a confirmed
/// block gates; timeouts and failures fail open and are never remembered
/// as a confirmed clear, so the next tick starts from scratch.
pub struct StatusChecker {
    inner: Arc<Inner>,
    /// Parent of the loop and of every triggered check; replaced on stop.
    session: Mutex<CancellationToken>,
    worker: Mutex<Option<Worker>>,
}

/// What a trigger needs to run a check in the current session.
struct Session {
    cancel: CancellationToken,
    generation: u64,
}

impl StatusChecker {
    pub fn new(probe: Arc<dyn StatusProbe>, config: CheckerConfig) -> Self {
        let (status, _) = watch::channel(CheckerStatus::default());
        Self {
            inner: Arc::new(Inner {
                probe,
                config,
                status,
                in_flight: AtomicU64::new(0),
                generation: AtomicU64::new(1),
                live: AtomicBool::new(true),
            }),
            session: Mutex::new(CancellationToken::new()),
            worker: Mutex::new(None),
        }
    }

    /// The current session, or `None` once stopped.
    fn session(&self) -> Option<Session> {
        let cancel = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.inner.live.load(Ordering::Acquire) {
            return None;
        }
        Some(Session {
            cancel: cancel.clone(),
            generation: self.inner.generation.load(Ordering::Acquire),
        })
    }

    /// Watch every status change.
    pub fn subscribe(&self) -> watch::Receiver<CheckerStatus> {
        self.inner.status.subscribe()
    }

    /// Latest published status.
    pub fn status(&self) -> CheckerStatus {
        self.inner.status.borrow().clone()
    }

    /// Whether the last completed check confirmed a block.
    pub fn is_gated(&self) -> bool {
        self.inner.status.borrow().gated
    }

    /// Run one check now. `None` when a check was already in flight and
    /// this trigger collapsed into it, when the checker is stopped, or when
    /// it is stopped before the check settles.
    pub async fn check_now(&self) -> Option<CheckOutcome> {
        let session = self.session()?;
        tokio::select! {
            _ = session.cancel.cancelled() => None,
            outcome = self.inner.check(session.generation) => outcome,
        }
    }

    /// Begin the deferred-then-periodic loop. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() {
            return;
        }

        let (cancel, generation) = {
            let session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
            self.inner.live.store(true, Ordering::Release);
            (session.child_token(), self.inner.generation.load(Ordering::Acquire))
        };

        info!(probe = self.inner.probe.name(), generation, "starting status checker");
        let handle = tokio::spawn(Arc::clone(&self.inner).run(cancel.clone(), generation));
        *worker = Some(Worker { cancel, handle });
    }

    /// Trigger an out-of-band check, e.g. on a realtime change. Collapses
    /// into any check already running.
    pub fn poke(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = session.cancel.cancelled() => debug!("triggered check cancelled"),
                _ = inner.check(session.generation) => {}
            }
        });
    }

    /// Ends the session: the loop and every triggered check are cancelled
    /// and nothing started before this call can publish. Idempotent.
    pub fn stop(&self) {
        self.end_session();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(worker) = worker {
            info!(probe = self.inner.probe.name(), "stopping status checker");
            worker.cancel.cancel();
            worker.handle.abort();
        }
        self.inner.status.send_replace(CheckerStatus::default());
    }

    fn end_session(&self) {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.live.store(false, Ordering::Release);
        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        std::mem::replace(&mut *session, CancellationToken::new()).cancel();
    }

    /// Whether the periodic loop is running.
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Drop for StatusChecker {
    fn drop(&mut self) {
        self.end_session();
        if let Some(worker) = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner).take() {
            worker.cancel.cancel();
            worker.handle.abort();
        }
    }
}

impl std::fmt::Debug for StatusChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusChecker")
            .field("probe", &self.inner.probe.name())
            .field("config", &self.inner.config)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}
