use shared::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Outcome of racing a future against a deadline.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Raced<T> {
    Settled(T),
    /// The deadline won. The raced future has been dropped, so whatever it
    /// would have produced later is discarded.
    Expired(Duration),
}

impl<T> Raced<T> {
    pub fn is_expired(&self) -> bool {
        matches!(self, Raced::Expired(_))
    }
}

impl<T> Raced<Result<T>> {
    pub fn into_result(self) -> Result<T> {
        match self {
            Raced::Settled(result) => result,
            Raced::Expired(after) => Err(Error::Timeout(after)),
        }
    }
}

/// First-settled-wins race between `fut` and a timer.
pub async fn race_deadline<F: Future>(deadline: Duration, fut: F) -> Raced<F::Output> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(output) => Raced::Settled(output),
        Err(_) => Raced::Expired(deadline),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::{Instant, sleep};

    #[tokio::test(start_paused = true)]
    async fn test_settles_before_deadline() {
        let raced = race_deadline(Duration::from_secs(5), async {
            sleep(Duration::from_secs(1)).await;
            Ok::<_, Error>(3)
        })
        .await;
        assert_eq!(raced.into_result(), Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loser_side_effect_never_happens() {
        let applied = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&applied);
        let start = Instant::now();

        let raced = race_deadline(Duration::from_secs(5), async move {
            sleep(Duration::from_secs(6)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        assert!(raced.is_expired());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(6));

        sleep(Duration::from_secs(5)).await;
        assert!(!applied.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_maps_to_timeout_error() {
        let raced = race_deadline(Duration::from_millis(10), std::future::pending::<Result<()>>()).await;
        assert_eq!(raced.into_result(), Err(Error::Timeout(Duration::from_millis(10))));
    }
}
