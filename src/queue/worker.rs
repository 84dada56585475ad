use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::clock::LogicalClock;
use crate::config::TransactionConfig;
use crate::protocol::{
    CommitOutcome, ParticipantEndpoint, PreparedMessage, Transport, TransportError,
};
use crate::storage::{
    ResourceState, StorageBatch, StorageError, TransactionalStorage, WriteVector,
};
use crate::transaction::{
    AccessMode, ParticipantId, TransactionError, TransactionOutcome, TransactionalStatus,
};
use crate::types::{Timestamp, TxnId};

use super::lock::{ReadWriteLock, Upgrade, WaitKey};
use super::record::{OutcomeCache, RecordPhase, TransactionRecord};
use super::{
    CommitHook, EnterLock, LockGrant, Operation, QueueCommand, QueueEnvironment, Reply,
    ResourceSnapshot,
};

/// Admission waiting in the lock.
pub(crate) struct LockRequest<S> {
    pub(crate) request: EnterLock,
    pub(crate) operation: Operation<S>,
    pub(crate) reply: Reply<Result<LockGrant, TransactionError>>,
}

/// Transaction this resource is deciding as manager.
pub(crate) struct ManagedTransaction {
    pub(crate) timestamp: Timestamp,
    pub(crate) expected: HashSet<ParticipantId>,
    pub(crate) prepared: HashSet<ParticipantId>,
    pub(crate) writers: Vec<ParticipantId>,
    pub(crate) reply: Option<Reply<CommitOutcome>>,
    pub(crate) deadline: Instant,
}

/// Committed transaction whose confirms are not all acknowledged yet.
pub(crate) struct PendingConfirm {
    pub(crate) timestamp: Timestamp,
    pub(crate) remaining: HashSet<ParticipantId>,
    pub(crate) last_sent: Instant,
}

/// Single owner of one resource's state.
pub struct TransactionQueue<S> {
    pub(crate) participant: ParticipantId,
    pub(crate) config: TransactionConfig,
    pub(crate) clock: Arc<LogicalClock>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) storage: Arc<dyn TransactionalStorage<S>>,
    pub(crate) hook: Option<Arc<dyn CommitHook<S>>>,

    pub(crate) committed: S,
    pub(crate) committed_ts: Timestamp,
    pub(crate) write_vector: WriteVector,
    pub(crate) high_water: Timestamp,
    pub(crate) next_sequence: u64,

    pub(crate) records: HashMap<TxnId, TransactionRecord<S>>,
    pub(crate) lock: ReadWriteLock<LockRequest<S>>,
    pub(crate) outcomes: OutcomeCache,
    pub(crate) managed: HashMap<TxnId, ManagedTransaction>,
    pub(crate) early_prepared: HashMap<TxnId, Vec<(PreparedMessage, Instant)>>,
    pub(crate) confirms: HashMap<TxnId, PendingConfirm>,

    inbox: mpsc::Receiver<QueueCommand<S>>,
    pub(crate) outbox: mpsc::WeakSender<QueueCommand<S>>,
}

impl<S: ResourceState> TransactionQueue<S> {
    pub(crate) fn new(
        participant: ParticipantId,
        env: QueueEnvironment,
        storage: Arc<dyn TransactionalStorage<S>>,
        hook: Option<Arc<dyn CommitHook<S>>>,
        inbox: mpsc::Receiver<QueueCommand<S>>,
        outbox: mpsc::WeakSender<QueueCommand<S>>,
    ) -> Self {
        let outcomes = OutcomeCache::new(env.config.outcome_cache_size);
        Self {
            participant,
            config: env.config,
            clock: env.clock,
            transport: env.transport,
            storage,
            hook,
            committed: S::default(),
            committed_ts: 0,
            write_vector: WriteVector::new(),
            high_water: 0,
            next_sequence: 0,
            records: HashMap::new(),
            lock: ReadWriteLock::new(),
            outcomes,
            managed: HashMap::new(),
            early_prepared: HashMap::new(),
            confirms: HashMap::new(),
            inbox,
            outbox,
        }
    }

    pub(crate) fn name(&self) -> &str {
        self.participant.name()
    }

    pub(crate) async fn run(mut self) {
        let mut tick = interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.inbox.recv() => {
                    let Some(command) = command else { break };
                    if let QueueCommand::Shutdown { reply } = command {
                        info!(
                            resource = %self.name(),
                            in_flight = self.records.len(),
                            "transaction queue stopping"
                        );
                        let _ = reply.send(());
                        break;
                    }
                    self.handle(command).await;
                }
                _ = tick.tick() => self.on_tick().await,
            }
            self.admit().await;
        }
    }

    async fn handle(&mut self, command: QueueCommand<S>) {
        match command {
            QueueCommand::EnterLock {
                request,
                operation,
                reply,
            } => {
                self.enter_lock(LockRequest {
                    request,
                    operation,
                    reply,
                })
                .await
            }
            QueueCommand::PrepareAndCommit { request, reply } => {
                self.prepare_and_commit(request, reply).await
            }
            QueueCommand::Prepared(message) => self.on_prepared(message).await,
            QueueCommand::Ping { request, reply } => {
                let outcome = self.on_ping(request);
                let _ = reply.send(outcome);
            }
            QueueCommand::CommitReadOnly { request, reply } => {
                let status = self.commit_read_only(request).await;
                let _ = reply.send(status);
            }
            QueueCommand::Prepare(request) => self.prepare(request).await,
            QueueCommand::Abort(request) => self.abort(request).await,
            QueueCommand::Cancel(request) => self.cancel(request).await,
            QueueCommand::Confirm { request, reply } => {
                let status = self.confirm(request.txn, request.timestamp).await;
                let _ = reply.send(status);
            }
            QueueCommand::PingResult { txn, outcome } => self.on_ping_result(txn, outcome).await,
            QueueCommand::ConfirmAcked { txn, participant } => {
                self.on_confirm_acked(txn, participant).await
            }
            QueueCommand::Restore { reply } => {
                let result = self.restore().await;
                let _ = reply.send(result);
            }
            QueueCommand::Snapshot { reply } => {
                let _ = reply.send(ResourceSnapshot {
                    state: self.committed.clone(),
                    timestamp: self.committed_ts,
                    write_vector: self.write_vector.clone(),
                    in_flight: self.records.len() + self.lock.waiting_count(),
                });
            }
            QueueCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    async fn enter_lock(&mut self, pending: LockRequest<S>) {
        let request = pending.request;
        let txn = request.txn;
        let mode = pending.operation.mode();

        if let Some(record) = self.records.get(&txn) {
            if record.phase != RecordPhase::Pending || record.access != request.observed {
                debug!(
                    resource = %self.name(),
                    %txn,
                    expected = %record.access,
                    observed = %request.observed,
                    phase = ?record.phase,
                    "stale re-entry"
                );
                let _ = pending.reply.send(Err(TransactionError::aborted(
                    txn,
                    TransactionalStatus::CascadingAbort,
                    Some(format!("stale view of {}", self.name())),
                )));
                if record.phase == RecordPhase::Pending {
                    self.abort_local(txn, TransactionalStatus::CascadingAbort).await;
                }
                return;
            }

            if mode == AccessMode::Write && record.mode == AccessMode::Read {
                // An older upgrader takes the slot from a younger one.
                if let Some(upgrader) = self.lock.pending_upgrade()
                    && self.lock.holder_key(txn).is_some_and(|mine| mine < upgrader)
                    && self.is_pending(upgrader.txn)
                {
                    info!(
                        resource = %self.name(),
                        txn = %upgrader.txn,
                        older = %txn,
                        "upgrade wounded"
                    );
                    self.abort_local(upgrader.txn, TransactionalStatus::LockUpgradeConflict)
                        .await;
                }
                match self.lock.request_upgrade(txn, pending, Instant::now()) {
                    Upgrade::Granted(pending) => {
                        if let Some(record) = self.records.get_mut(&txn) {
                            record.mode = AccessMode::Write;
                        }
                        self.execute(pending).await;
                    }
                    Upgrade::Queued => {
                        debug!(resource = %self.name(), %txn, "upgrade waiting for readers");
                    }
                    Upgrade::Conflict(pending) => {
                        let _ = pending.reply.send(Err(TransactionError::aborted(
                            txn,
                            TransactionalStatus::LockUpgradeConflict,
                            None,
                        )));
                        self.abort_local(txn, TransactionalStatus::LockUpgradeConflict)
                            .await;
                    }
                }
                return;
            }

            self.execute(pending).await;
            return;
        }

        if let Some(outcome) = self.outcomes.get(txn) {
            let status = match outcome {
                TransactionOutcome::Aborted { status } => status,
                _ => TransactionalStatus::CascadingAbort,
            };
            let _ = pending
                .reply
                .send(Err(TransactionError::aborted(txn, status, None)));
            return;
        }

        if self.lock.is_waiting(txn) || !request.observed.is_empty() {
            // Either a concurrent call of the same transaction is already queued
            // here, or the caller saw a record this queue no longer has.
            let _ = pending.reply.send(Err(TransactionError::aborted(
                txn,
                TransactionalStatus::CascadingAbort,
                Some(format!("unexpected access to {}", self.name())),
            )));
            return;
        }

        self.clock.observe(request.timestamp);
        let key = WaitKey {
            timestamp: request.timestamp,
            priority: request.priority,
            txn,
        };
        self.lock.enqueue(key, mode, pending, Instant::now());
    }

    /// Hand the lock to whoever can run now.
    pub(crate) async fn admit(&mut self) {
        loop {
            self.wound_younger_holders().await;
            let granted = self.lock.grant();
            if granted.is_empty() {
                return;
            }
            for grant in granted {
                if grant.upgrade {
                    if let Some(record) = self.records.get_mut(&grant.txn) {
                        record.mode = AccessMode::Write;
                    }
                } else {
                    let request = grant.payload.request;
                    let timestamp = if request.timestamp > self.high_water {
                        request.timestamp
                    } else {
                        self.clock.merge_utc_now(self.high_water)
                    };
                    self.high_water = timestamp;
                    self.next_sequence += 1;
                    let record = TransactionRecord::new(
                        grant.txn,
                        self.next_sequence,
                        request.priority,
                        timestamp,
                        grant.mode,
                        Instant::now(),
                    );
                    debug!(
                        resource = %self.name(),
                        txn = %grant.txn,
                        sequence = record.sequence,
                        timestamp,
                        mode = ?grant.mode,
                        "lock granted"
                    );
                    self.records.insert(grant.txn, record);
                }
                self.execute(grant.payload).await;
            }
        }
    }

    /// Abort younger holders that have not prepared yet when they stand in
    /// the way of an older transaction. Prepared holders are always waited for.
    async fn wound_younger_holders(&mut self) {
        let Some(contention) = self.lock.contention() else {
            return;
        };
        let status = if contention.upgrade {
            TransactionalStatus::LockUpgradeConflict
        } else {
            TransactionalStatus::LockTimeout
        };
        for txn in contention.younger {
            if !self.is_pending(txn) {
                continue;
            }
            info!(
                resource = %self.name(),
                %txn,
                older = %contention.contender.txn,
                "wounded by an older transaction"
            );
            self.abort_local(txn, status).await;
        }
    }

    fn is_pending(&self, txn: TxnId) -> bool {
        self.records
            .get(&txn)
            .is_some_and(|r| r.phase == RecordPhase::Pending)
    }

    /// Run an admitted operation against the transaction's view.
    async fn execute(&mut self, pending: LockRequest<S>) {
        let txn = pending.request.txn;
        let Some(record) = self.records.get_mut(&txn) else {
            let _ = pending.reply.send(Err(TransactionError::aborted(
                txn,
                TransactionalStatus::CascadingAbort,
                None,
            )));
            return;
        };

        let mode = pending.operation.mode();
        let outcome = match pending.operation {
            Operation::Read(op) => {
                let view = record.state.as_ref().unwrap_or(&self.committed);
                catch_unwind(AssertUnwindSafe(|| op(view)))
            }
            Operation::Write(op) => {
                let view = record
                    .state
                    .get_or_insert_with(|| self.committed.clone());
                catch_unwind(AssertUnwindSafe(|| op(view)))
            }
        };

        match outcome {
            Ok(()) => {
                record.access.record(mode);
                let _ = pending.reply.send(Ok(LockGrant {
                    timestamp: record.timestamp,
                    access: record.access,
                }));
            }
            Err(_) => {
                warn!(resource = %self.name(), %txn, "transactional operation panicked");
                let _ = pending
                    .reply
                    .send(Err(TransactionError::OperationPanicked(self.name().to_string())));
                self.abort_local(txn, TransactionalStatus::CascadingAbort)
                    .await;
            }
        }
    }

    /// Drop every trace of `txn` here and remember it aborted.
    pub(crate) async fn abort_local(&mut self, txn: TxnId, status: TransactionalStatus) {
        if let Some(mut record) = self.records.remove(&txn) {
            let was_prepared = record.phase == RecordPhase::Prepared;
            record.phase = RecordPhase::Aborting;
            self.lock.release(txn);
            if was_prepared
                && let Err(err) = self
                    .storage
                    .store(StorageBatch::new().discard_prepared(txn))
                    .await
            {
                warn!(
                    resource = %self.name(),
                    %txn,
                    error = %err,
                    "failed to discard prepared record"
                );
            }
            record.phase = RecordPhase::Aborted;
            debug!(
                resource = %self.name(),
                %txn,
                sequence = record.sequence,
                %status,
                "record aborted"
            );
        }

        if let Some(waiter) = self.lock.remove_waiter(txn) {
            let _ = waiter
                .reply
                .send(Err(TransactionError::aborted(txn, status, None)));
        }

        if let Some(managed) = self.managed.remove(&txn) {
            self.finish_abort(txn, managed, status);
        }

        if let Some(early) = self.early_prepared.remove(&txn) {
            for (message, _) in early {
                if message.status.is_ok() {
                    self.send_cancel(&message.participant, txn, message.timestamp, status);
                }
            }
        }

        self.outcomes
            .insert(txn, TransactionOutcome::Aborted { status });
    }

    /// Make a committed write visible and free the lock.
    pub(crate) fn apply_commit(&mut self, txn: TxnId, timestamp: Timestamp, state: Option<S>) {
        if let Some(state) = state
            && self.write_vector.set(txn)
        {
            self.committed = state;
        }
        self.committed_ts = self.committed_ts.max(timestamp);
        self.high_water = self.high_water.max(timestamp);
        self.clock.observe(timestamp);
        self.lock.release(txn);
        if let Some(mut record) = self.records.remove(&txn) {
            record.phase = RecordPhase::Committed;
            debug!(
                resource = %self.name(),
                %txn,
                sequence = record.sequence,
                timestamp,
                "record committed"
            );
        }
        self.outcomes
            .insert(txn, TransactionOutcome::Committed { timestamp });
    }

    /// Deliver a message to `target` in the background.
    ///
    /// Failures are only logged: every message the protocol sends is either
    /// retried on a later tick or recovered through `Ping`.
    pub(crate) fn dispatch<F, Fut>(&self, target: &ParticipantId, message: &'static str, call: F)
    where
        F: FnOnce(Arc<dyn ParticipantEndpoint>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
    {
        let transport = self.transport.clone();
        let actor = target.reference().clone();
        let target = target.name().to_string();
        let resource = self.name().to_string();
        tokio::spawn(async move {
            let result = match transport.endpoint(&actor).await {
                Ok(endpoint) => call(endpoint).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                debug!(%resource, %target, %actor, message, error = %err, "delivery failed");
            }
        });
    }

    async fn on_tick(&mut self) {
        let now = Instant::now();

        for expired in self.lock.expire(now, self.config.lock_wait_timeout()) {
            debug!(resource = %self.name(), txn = %expired.txn, "lock wait timed out");
            let _ = expired.payload.reply.send(Err(TransactionError::aborted(
                expired.txn,
                TransactionalStatus::LockTimeout,
                None,
            )));
            if expired.upgrade {
                self.abort_local(expired.txn, TransactionalStatus::LockTimeout)
                    .await;
            } else {
                self.outcomes.insert(
                    expired.txn,
                    TransactionOutcome::Aborted {
                        status: TransactionalStatus::LockTimeout,
                    },
                );
            }
        }

        let hold = self.config.lock_hold_timeout();
        let overdue: Vec<TxnId> = self
            .records
            .values()
            .filter(|r| r.phase == RecordPhase::Pending && now.duration_since(r.granted_at) >= hold)
            .map(|r| r.txn)
            .collect();
        for txn in overdue {
            info!(resource = %self.name(), %txn, "lock held too long, aborting");
            self.abort_local(txn, TransactionalStatus::LockTimeout).await;
        }

        self.ping_overdue(now);
        self.expire_managed(now).await;
        self.resend_confirms(now);

        let prepare_timeout = self.config.prepare_timeout();
        self.early_prepared.retain(|_, messages| {
            messages.retain(|(_, at)| now.duration_since(*at) < prepare_timeout);
            !messages.is_empty()
        });
    }

    async fn restore(&mut self) -> Result<(), StorageError> {
        let stored = self.storage.load().await?;
        let now = Instant::now();

        self.committed = stored.state;
        self.committed_ts = stored.committed_timestamp;
        self.write_vector = stored.write_vector;
        self.high_water = self.high_water.max(stored.committed_timestamp);
        self.clock.observe(stored.committed_timestamp);

        for prepared in stored.prepared {
            if self.records.contains_key(&prepared.txn) {
                continue;
            }
            self.next_sequence += 1;
            let mut record = TransactionRecord::new(
                prepared.txn,
                self.next_sequence,
                0,
                prepared.timestamp,
                AccessMode::Write,
                now,
            );
            record.phase = RecordPhase::Prepared;
            record.state = Some(prepared.state);
            record.manager = Some(prepared.manager);
            // Due for a ping on the first tick.
            record.last_contact = now.checked_sub(self.config.ping_interval()).unwrap_or(now);
            self.high_water = self.high_water.max(prepared.timestamp);
            self.clock.observe(prepared.timestamp);
            let key = WaitKey {
                timestamp: prepared.timestamp,
                priority: 0,
                txn: prepared.txn,
            };
            self.lock.install_holder(key, AccessMode::Write);
            self.records.insert(prepared.txn, record);
        }

        for commit in stored.commit_records {
            self.outcomes.insert(
                commit.txn,
                TransactionOutcome::Committed {
                    timestamp: commit.timestamp,
                },
            );
            self.confirms.insert(
                commit.txn,
                PendingConfirm {
                    timestamp: commit.timestamp,
                    remaining: commit.participants.into_iter().collect(),
                    last_sent: now.checked_sub(self.config.ping_interval()).unwrap_or(now),
                },
            );
        }

        info!(
            resource = %self.name(),
            committed_ts = self.committed_ts,
            prepared = self.records.len(),
            confirms = self.confirms.len(),
            "resource restored"
        );
        self.ping_overdue(now);
        self.resend_confirms(now);
        Ok(())
    }
}
