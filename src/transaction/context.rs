use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::types::{Priority, Timestamp, TxnId};

use super::info::{AccessCounter, TransactionInfo};
use super::participant::ParticipantId;
use super::status::TransactionalStatus;

tokio::task_local! {
    static AMBIENT: RefCell<Option<TransactionContext>>;
}

/// Shared handle to the [`TransactionInfo`] of one call chain.
///
/// Clones share the same info. Concurrent sub-calls should use [`fork`] and
/// [`join`] instead so their access counts are merged deterministically.
///
/// [`fork`]: TransactionContext::fork
/// [`join`]: TransactionContext::join
#[derive(Debug, Clone)]
pub struct TransactionContext {
    info: Arc<Mutex<TransactionInfo>>,
}

impl TransactionContext {
    pub fn new(info: TransactionInfo) -> Self {
        Self {
            info: Arc::new(Mutex::new(info)),
        }
    }

    pub fn id(&self) -> TxnId {
        self.info.lock().id()
    }

    pub fn priority(&self) -> Priority {
        self.info.lock().priority()
    }

    pub fn timestamp(&self) -> Timestamp {
        self.info.lock().timestamp()
    }

    pub fn is_read_only(&self) -> bool {
        self.info.lock().is_read_only()
    }

    pub fn access(&self, participant: &ParticipantId) -> AccessCounter {
        self.info.lock().access(participant)
    }

    /// Point-in-time copy of the info.
    pub fn snapshot(&self) -> TransactionInfo {
        self.info.lock().clone()
    }

    pub fn with_info<R>(&self, f: impl FnOnce(&mut TransactionInfo) -> R) -> R {
        f(&mut self.info.lock())
    }

    pub fn record_failure(&self, status: TransactionalStatus, cause: Option<String>) {
        self.info.lock().record_failure(status, cause);
    }

    pub fn fork(&self) -> TransactionContext {
        let child = self.info.lock().fork();
        TransactionContext::new(child)
    }

    pub fn join(&self, child: &TransactionContext) {
        let child = child.snapshot();
        self.info.lock().join(&child);
    }

    /// Context attached to the running task, if any.
    pub fn current() -> Option<TransactionContext> {
        AMBIENT
            .try_with(|ambient| ambient.borrow().clone())
            .ok()
            .flatten()
    }

    /// Run `fut` with `ctx` as its ambient transaction.
    ///
    /// The previous ambient context is untouched once `fut` completes, on
    /// every exit path.
    pub async fn scope<F>(ctx: Option<TransactionContext>, fut: F) -> F::Output
    where
        F: Future,
    {
        AMBIENT.scope(RefCell::new(ctx), fut).await
    }

    /// Replace the ambient context inside the current scope.
    ///
    /// Returns `false` when the task is not running inside [`scope`].
    ///
    /// [`scope`]: TransactionContext::scope
    pub fn attach(ctx: Option<TransactionContext>) -> bool {
        AMBIENT
            .try_with(|ambient| {
                *ambient.borrow_mut() = ctx;
            })
            .is_ok()
    }

    /// Detach the ambient context, returning what was attached.
    pub fn clear() -> Option<TransactionContext> {
        AMBIENT
            .try_with(|ambient| ambient.borrow_mut().take())
            .ok()
            .flatten()
    }
}
