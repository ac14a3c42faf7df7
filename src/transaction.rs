//! Transaction strategies applied around pipeline execution.
//!
//! A strategy opens a [`TransactionHandle`] per attempt, derives the
//! [`TransportTransaction`] token handed to the engine, and performs the
//! logical completion step. The native commit is a separate step on the
//! handle itself. A handle that is dropped without being committed is
//! rolled back, so every exit path releases it.

use crate::context::TransportTransaction;
use crate::errors::{BoxError, BusError};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A transaction owned by the function host.
pub trait NativeTransaction: Send + Sync {
    /// Commit the transaction.
    fn commit(&self) -> Result<(), BoxError>;

    /// Discard the transaction.
    fn rollback(&self);
}

// ---------------------------------------------------------------------------
// Transaction handle
// ---------------------------------------------------------------------------

/// A strategy-specific transaction scoped to exactly one attempt.
pub struct TransactionHandle {
    id: Uuid,
    native: Arc<dyn NativeTransaction>,
    committed: bool,
}

impl TransactionHandle {
    pub fn new(native: Arc<dyn NativeTransaction>) -> Self {
        Self {
            id: Uuid::new_v4(),
            native,
            committed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn native(&self) -> &Arc<dyn NativeTransaction> {
        &self.native
    }

    /// Commit the native transaction, consuming the handle.
    ///
    /// A rejected commit rolls the native transaction back.
    pub fn commit(mut self) -> crate::Result<()> {
        self.native
            .commit()
            .map_err(|e| BusError::Transaction(e.to_string()))?;
        self.committed = true;
        Ok(())
    }
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(transaction_id = %self.id, "discarding uncommitted transaction");
            self.native.rollback();
        }
    }
}

impl fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("committed", &self.committed)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait TransactionStrategy: Send + Sync {
    /// Open a transaction for one attempt, or `None` if the strategy has none.
    fn create_transaction(&self) -> Option<TransactionHandle>;

    /// Derive the token handed to the engine.
    fn create_transport_transaction(
        &self,
        transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction;

    /// Logical completion, run before the native commit.
    async fn complete(
        &self,
        transaction: Option<&TransactionHandle>,
        cancel: &CancellationToken,
    ) -> crate::Result<()>;
}

// ---------------------------------------------------------------------------
// No-op strategy
// ---------------------------------------------------------------------------

/// Used when the host provides no native transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTransactionStrategy;

#[async_trait::async_trait]
impl TransactionStrategy for NoTransactionStrategy {
    fn create_transaction(&self) -> Option<TransactionHandle> {
        None
    }

    fn create_transport_transaction(
        &self,
        _transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction {
        TransportTransaction::empty()
    }

    async fn complete(
        &self,
        _transaction: Option<&TransactionHandle>,
        _cancel: &CancellationToken,
    ) -> crate::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Host transaction strategy
// ---------------------------------------------------------------------------

/// A step run during logical completion, before the native commit
/// (e.g. persisting outbox records).
#[async_trait::async_trait]
pub trait CompletionStep: Send + Sync {
    async fn complete(&self, transaction: &TransactionHandle) -> crate::Result<()>;
}

type NativeFactory = Arc<dyn Fn() -> Arc<dyn NativeTransaction> + Send + Sync>;

/// Wraps a host-provided native transaction per attempt.
#[derive(Clone)]
pub struct HostTransactionStrategy {
    factory: NativeFactory,
    completion: Option<Arc<dyn CompletionStep>>,
}

impl HostTransactionStrategy {
    /// Create a strategy that opens a new native transaction for every attempt.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn NativeTransaction> + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            completion: None,
        }
    }

    /// Run `step` during logical completion.
    pub fn with_completion(mut self, step: impl CompletionStep + 'static) -> Self {
        self.completion = Some(Arc::new(step));
        self
    }
}

impl fmt::Debug for HostTransactionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostTransactionStrategy")
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

#[async_trait::async_trait]
impl TransactionStrategy for HostTransactionStrategy {
    fn create_transaction(&self) -> Option<TransactionHandle> {
        Some(TransactionHandle::new((self.factory)()))
    }

    fn create_transport_transaction(
        &self,
        transaction: Option<&TransactionHandle>,
    ) -> TransportTransaction {
        match transaction {
            Some(tx) => TransportTransaction::enlisted(tx.native().clone()),
            None => TransportTransaction::empty(),
        }
    }

    async fn complete(
        &self,
        transaction: Option<&TransactionHandle>,
        cancel: &CancellationToken,
    ) -> crate::Result<()> {
        if cancel.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        match (transaction, &self.completion) {
            (Some(tx), Some(step)) => step.complete(tx).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTx {
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    impl NativeTransaction for CountingTx {
        fn commit(&self) -> Result<(), BoxError> {
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FailingTx {
        rollbacks: AtomicUsize,
    }

    impl NativeTransaction for FailingTx {
        fn commit(&self) -> Result<(), BoxError> {
            Err("lock timeout".into())
        }

        fn rollback(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_dropped_handle_rolls_back() {
        let tx = Arc::new(CountingTx::default());
        drop(TransactionHandle::new(tx.clone()));
        assert_eq!(tx.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(tx.commits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_committed_handle_does_not_roll_back() {
        let tx = Arc::new(CountingTx::default());
        TransactionHandle::new(tx.clone()).commit().unwrap();
        assert_eq!(tx.commits.load(Ordering::SeqCst), 1);
        assert_eq!(tx.rollbacks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_commit_failure_maps_to_transaction_error() {
        let tx = Arc::new(FailingTx::default());
        let err = TransactionHandle::new(tx.clone()).commit().unwrap_err();
        assert!(matches!(err, BusError::Transaction(ref m) if m.contains("lock timeout")));
        assert_eq!(tx.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_transaction_strategy() {
        let strategy = NoTransactionStrategy;
        assert!(strategy.create_transaction().is_none());

        let a = strategy.create_transport_transaction(None);
        let b = strategy.create_transport_transaction(None);
        assert_ne!(a.id(), b.id());
        assert!(a.native().is_none());

        strategy
            .complete(None, &CancellationToken::new())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_host_strategy_enlists_native_transaction() {
        let strategy = HostTransactionStrategy::new(|| {
            Arc::new(CountingTx::default()) as Arc<dyn NativeTransaction>
        });
        let tx = strategy.create_transaction().unwrap();
        let token = strategy.create_transport_transaction(Some(&tx));
        assert!(token.native().is_some());

        let other = strategy.create_transaction().unwrap();
        assert_ne!(tx.id(), other.id());
    }

    #[tokio::test]
    async fn test_host_strategy_runs_completion_step() {
        struct Step(Arc<AtomicUsize>);

        #[async_trait::async_trait]
        impl CompletionStep for Step {
            async fn complete(&self, _tx: &TransactionHandle) -> crate::Result<()> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let calls = Arc::new(AtomicUsize::new(0));
        let strategy = HostTransactionStrategy::new(|| {
            Arc::new(CountingTx::default()) as Arc<dyn NativeTransaction>
        })
        .with_completion(Step(calls.clone()));

        let tx = strategy.create_transaction();
        strategy
            .complete(tx.as_ref(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_host_strategy_complete_observes_cancellation() {
        let strategy = HostTransactionStrategy::new(|| {
            Arc::new(CountingTx::default()) as Arc<dyn NativeTransaction>
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tx = strategy.create_transaction();
        let err = strategy.complete(tx.as_ref(), &cancel).await.unwrap_err();
        assert!(err.is_cancelled());
    }
}
