use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Handed to a deferred action so it can check, after its own awaits,
/// whether its owner is still around before touching shared state.
#[derive(Clone, Debug)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One action scheduled to run once after a delay.
///
/// Cancelling (explicitly or by dropping the handle) before the delay
/// elapses guarantees the action never starts.
#[derive(Debug)]
pub struct DeferredTask {
    cancel: CancellationToken,
    live: Liveness,
    handle: JoinHandle<()>,
}

impl DeferredTask {
    pub fn schedule<F, Fut>(delay: Duration, action: F) -> Self
    where
        F: FnOnce(Liveness) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let live = Liveness(Arc::new(AtomicBool::new(true)));

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            let live = live.clone();
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                // the timer and cancel() can race; the flag decides
                if !live.is_live() {
                    debug!("deferred task cancelled after its timer fired");
                    return;
                }
                action(live).await;
            }
        });

        Self {
            cancel,
            live,
            handle,
        }
    }

    pub fn cancel(&self) {
        self.live.0.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        !self.live.is_live()
    }

    /// Fired and completed, or cancelled and wound down.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for DeferredTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// The deferred work of one consumer, cancelled together.
#[derive(Debug, Default)]
pub struct DeferredInitializer {
    tasks: Vec<DeferredTask>,
}

impl DeferredInitializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` after `delay`. Tasks that already finished are
    /// forgotten here.
    pub fn defer<F, Fut>(&mut self, delay: Duration, action: F) -> &mut Self
    where
        F: FnOnce(Liveness) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(DeferredTask::schedule(delay, action));
        self
    }

    /// Tasks neither finished nor cancelled.
    pub fn pending(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.is_finished() && !t.is_cancelled())
            .count()
    }

    pub fn cancel_all(&mut self) {
        for task in self.tasks.drain(..) {
            task.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::time::sleep;

    fn spy() -> (Arc<AtomicUsize>, impl FnOnce(Liveness) -> std::future::Ready<()> + Send + 'static) {
        let calls = Arc::new(AtomicUsize::new(0));
        let action = {
            let calls = Arc::clone(&calls);
            move |_: Liveness| {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::ready(())
            }
        };
        (calls, action)
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_once_after_delay() {
        let (calls, action) = spy();
        let task = DeferredTask::schedule(Duration::from_millis(2000), action);

        sleep(Duration::from_millis(1999)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        sleep(Duration::from_millis(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_delay_prevents_action() {
        let (calls, action) = spy();
        let task = DeferredTask::schedule(Duration::from_millis(2000), action);

        sleep(Duration::from_millis(500)).await;
        task.cancel();
        sleep(Duration::from_secs(10)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(task.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels() {
        let (calls, action) = spy();
        drop(DeferredTask::schedule(Duration::from_millis(100), action));

        sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_action_sees_cancellation_after_its_own_await() {
        let applied = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&applied);
        let task = DeferredTask::schedule(Duration::from_millis(100), move |live| async move {
            sleep(Duration::from_millis(1000)).await; // slow lookup
            if live.is_live() {
                flag.store(true, Ordering::SeqCst);
            }
        });

        sleep(Duration::from_millis(500)).await;
        task.cancel();
        sleep(Duration::from_secs(2)).await;
        assert!(!applied.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initializer_staggers_and_cancels_together() {
        let (first, first_action) = spy();
        let (second, second_action) = spy();
        let mut init = DeferredInitializer::new();
        init.defer(Duration::from_millis(100), first_action)
            .defer(Duration::from_millis(2000), second_action);

        sleep(Duration::from_millis(150)).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(init.pending(), 1);

        init.cancel_all();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(second.load(Ordering::SeqCst), 0);
        assert_eq!(init.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_tasks_are_not_kept() {
        let mut init = DeferredInitializer::new();
        let mut counters = Vec::new();

        for _ in 0..10 {
            let (calls, action) = spy();
            init.defer(Duration::from_millis(10), action);
            counters.push(calls);
            sleep(Duration::from_millis(20)).await;
        }

        assert!(counters.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        assert_eq!(init.tasks.len(), 1);
        assert_eq!(init.pending(), 0);
    }
}
