//! Cancellable delays.
//!
//! Every timer a session or orchestrator waits on goes through
//! [`cancellable_sleep`], so cancelling the owner's token unblocks all of
//! them at once and shutdown never waits out a remaining delay.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// A delay was interrupted by its owner shutting down.
///
/// Kept distinct from real failures so teardown paths can ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delay cancelled")
    }
}

impl std::error::Error for Cancelled {}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// An already-cancelled token fails immediately, even for a zero duration.
pub async fn cancellable_sleep(token: &CancellationToken, duration: Duration) -> Result<(), Cancelled> {
    if token.is_cancelled() {
        return Err(Cancelled);
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes() {
        let token = CancellationToken::new();
        assert_eq!(cancellable_sleep(&token, Duration::from_millis(10)).await, Ok(()));
    }

    #[tokio::test]
    async fn test_cancel_unblocks_long_sleep() {
        let token = CancellationToken::new();
        let child = token.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { cancellable_sleep(&child, Duration::from_secs(60)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        assert_eq!(handle.await.unwrap(), Err(Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_fails_fast() {
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(cancellable_sleep(&token, Duration::ZERO).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn test_child_token_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();
        parent.cancel();
        assert_eq!(cancellable_sleep(&child, Duration::from_secs(60)).await, Err(Cancelled));
    }
}
