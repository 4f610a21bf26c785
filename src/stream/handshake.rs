//! Handshake admission
//!
//! When a channel opens, the peer's handshake payload is decoded and handed
//! to an admission predicate. The predicate may be asynchronous and may take
//! as long as it likes; its verdict decides whether the stream opens or is
//! rejected. The outcome is recorded once in an [`OpenLatch`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{Error, Result};

/// Error type an admission predicate may fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Future returned by an admission predicate
pub type HandshakeFuture =
    Pin<Box<dyn Future<Output = std::result::Result<bool, BoxError>> + Send>>;

/// Shared admission predicate over decoded handshakes of type `T`
pub type OnHandshake<T> = Arc<dyn Fn(T) -> HandshakeFuture + Send + Sync>;

/// Wrap an async closure as an admission predicate
pub fn admit_with<T, F, Fut>(predicate: F) -> OnHandshake<T>
where
    T: 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<bool, BoxError>> + Send + 'static,
{
    Arc::new(move |handshake: T| -> HandshakeFuture { Box::pin(predicate(handshake)) })
}

/// Wrap a synchronous check as an admission predicate
pub fn admit_if<T, F>(check: F) -> OnHandshake<T>
where
    T: 'static,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    admit_with(move |handshake: T| std::future::ready(Ok(check(&handshake))))
}

/// Single-assignment cell for the open outcome
///
/// The first call to [`resolve`](OpenLatch::resolve) wins; every waiter,
/// early or late, observes that same outcome.
#[derive(Debug)]
pub struct OpenLatch {
    tx: watch::Sender<Option<Result<()>>>,
}

impl OpenLatch {
    /// Create an unresolved latch
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Record the outcome if none was recorded yet
    ///
    /// Returns `true` if this call set the outcome.
    pub fn resolve(&self, outcome: Result<()>) -> bool {
        self.tx.send_if_modified(move |slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        })
    }

    /// Check if an outcome was recorded
    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait for the outcome
    pub async fn wait(&self) -> Result<()> {
        let mut rx = self.tx.subscribe();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or(Err(Error::Destroyed))
    }
}

impl Default for OpenLatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_first_outcome_wins() {
        let latch = OpenLatch::new();
        assert!(!latch.is_resolved());

        assert!(latch.resolve(Err(Error::Rejected("declined".into()))));
        assert!(!latch.resolve(Ok(())));
        assert!(!latch.resolve(Err(Error::Destroyed)));
        assert!(latch.is_resolved());
    }

    #[tokio::test]
    async fn test_waiters_see_same_outcome() {
        let latch = Arc::new(OpenLatch::new());

        let early = {
            let latch = Arc::clone(&latch);
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;

        latch.resolve(Ok(()));
        latch.resolve(Err(Error::Destroyed));

        assert_eq!(early.await.unwrap(), Ok(()));
        assert_eq!(latch.wait().await, Ok(()));
    }

    #[test]
    fn test_wait_pends_until_resolved() {
        let latch = OpenLatch::new();
        let mut wait = tokio_test::task::spawn(latch.wait());

        tokio_test::assert_pending!(wait.poll());
        latch.resolve(Err(Error::Destroyed));
        assert!(wait.is_woken());
        assert_eq!(
            tokio_test::assert_ready!(wait.poll()),
            Err(Error::Destroyed)
        );
    }

    #[tokio::test]
    async fn test_predicates() {
        let only_friends = admit_if(|hs: &Bytes| &hs[..] == b"friend");
        assert!(only_friends(Bytes::from_static(b"friend")).await.unwrap());
        assert!(!only_friends(Bytes::from_static(b"stranger")).await.unwrap());

        let failing =
            admit_with(|_: Bytes| async { Err::<bool, BoxError>("lookup failed".into()) });
        assert!(failing(Bytes::new()).await.is_err());
    }
}
