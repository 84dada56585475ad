//! Participant side of two-phase commit: prepare, decisions, ping recovery.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::protocol::{
    AbortRequest, CancelRequest, CommitReadOnlyRequest, PingRequest, PrepareRequest,
    PreparedMessage,
};
use crate::storage::{PreparedRecord, ResourceState, StorageBatch};
use crate::transaction::{ParticipantId, TransactionOutcome, TransactionalStatus};
use crate::types::{Timestamp, TxnId};

use super::QueueCommand;
use super::record::RecordPhase;
use super::worker::TransactionQueue;

impl<S: ResourceState> TransactionQueue<S> {
    pub(crate) async fn prepare(&mut self, request: PrepareRequest) {
        let txn = request.txn;
        let manager = request.manager;

        let Some(record) = self.records.get_mut(&txn) else {
            let status = match self.outcomes.get(txn) {
                Some(TransactionOutcome::Aborted { status }) => status,
                Some(TransactionOutcome::Committed { .. }) => TransactionalStatus::Ok,
                _ => TransactionalStatus::CascadingAbort,
            };
            debug!(resource = %self.name(), %txn, %status, "prepare for unknown record");
            self.send_prepared(&manager, txn, request.timestamp, status);
            return;
        };

        match record.phase {
            RecordPhase::Pending => {}
            RecordPhase::Prepared => {
                let timestamp = record.timestamp;
                self.send_prepared(&manager, txn, timestamp, TransactionalStatus::Ok);
                return;
            }
            _ => return,
        }

        if record.access != request.access {
            debug!(
                resource = %self.participant.name(),
                %txn,
                expected = %record.access,
                reported = %request.access,
                "access counter mismatch at prepare"
            );
            self.abort_local(txn, TransactionalStatus::ValidationFailure)
                .await;
            self.send_prepared(
                &manager,
                txn,
                request.timestamp,
                TransactionalStatus::ValidationFailure,
            );
            return;
        }

        let timestamp = record.timestamp.max(request.timestamp);
        record.timestamp = timestamp;
        record.manager = Some(manager.clone());
        self.high_water = self.high_water.max(timestamp);
        self.clock.observe(timestamp);

        if !record.has_written() {
            // Readers have nothing to persist and stop blocking writers here.
            self.records.remove(&txn);
            self.lock.release(txn);
            self.send_prepared(&manager, txn, timestamp, TransactionalStatus::Ok);
            return;
        }

        if self.hook.is_some() {
            // Commit hooks only run where the outcome is decided.
            warn!(
                resource = %self.name(),
                %txn,
                manager = %manager,
                "commit hook not elected as manager"
            );
            let status = TransactionalStatus::CommitFailure;
            self.abort_local(txn, status).await;
            self.send_prepared(&manager, txn, timestamp, status);
            return;
        }

        record.phase = RecordPhase::Preparing;
        let status = self.persist_prepared(txn, timestamp, &manager).await;
        if status.is_abort() {
            self.abort_local(txn, status).await;
        } else if let Some(record) = self.records.get_mut(&txn) {
            record.phase = RecordPhase::Prepared;
            record.last_contact = Instant::now();
            debug!(resource = %self.name(), %txn, timestamp, "prepared");
        }
        self.send_prepared(&manager, txn, timestamp, status);
    }

    async fn persist_prepared(
        &mut self,
        txn: TxnId,
        timestamp: Timestamp,
        manager: &ParticipantId,
    ) -> TransactionalStatus {
        let Some(record) = self.records.get(&txn) else {
            return TransactionalStatus::CascadingAbort;
        };
        let Some(state) = record.state.as_ref() else {
            return TransactionalStatus::CascadingAbort;
        };

        let batch = StorageBatch::new().prepare(PreparedRecord {
            txn,
            timestamp,
            state: state.clone(),
            manager: manager.clone(),
        });
        match self.storage.store(batch).await {
            Ok(()) => TransactionalStatus::Ok,
            Err(err) => {
                warn!(
                    resource = %self.name(),
                    %txn,
                    error = %err,
                    "failed to persist prepared record"
                );
                TransactionalStatus::StorageFailure
            }
        }
    }

    pub(crate) async fn commit_read_only(
        &mut self,
        request: CommitReadOnlyRequest,
    ) -> TransactionalStatus {
        let txn = request.txn;
        let Some(record) = self.records.get(&txn) else {
            return match self.outcomes.get(txn) {
                Some(TransactionOutcome::Aborted { status }) => status,
                Some(TransactionOutcome::Committed { .. }) => TransactionalStatus::Ok,
                _ => TransactionalStatus::CascadingAbort,
            };
        };

        if record.phase != RecordPhase::Pending
            || record.access != request.access
            || record.has_written()
        {
            self.abort_local(txn, TransactionalStatus::ValidationFailure)
                .await;
            return TransactionalStatus::ValidationFailure;
        }

        let timestamp = record.timestamp.max(request.timestamp);
        self.high_water = self.high_water.max(timestamp);
        self.clock.observe(timestamp);
        self.records.remove(&txn);
        self.lock.release(txn);
        self.outcomes
            .insert(txn, TransactionOutcome::Committed { timestamp });
        TransactionalStatus::Ok
    }

    /// Agent abort. Prepared records are left for the manager to decide.
    pub(crate) async fn abort(&mut self, request: AbortRequest) {
        let phase = self.records.get(&request.txn).map(|r| r.phase);
        match phase {
            None | Some(RecordPhase::Pending) => {
                self.abort_local(request.txn, request.status).await
            }
            Some(phase) => {
                debug!(
                    resource = %self.name(),
                    txn = %request.txn,
                    ?phase,
                    "ignoring abort past prepare"
                )
            }
        }
    }

    /// Manager's abort decision.
    pub(crate) async fn cancel(&mut self, request: CancelRequest) {
        debug!(resource = %self.name(), txn = %request.txn, status = %request.status, "cancel");
        self.abort_local(request.txn, request.status).await;
    }

    /// Manager's commit decision; `Ok` once the commit is durable here.
    pub(crate) async fn confirm(
        &mut self,
        txn: TxnId,
        timestamp: Timestamp,
    ) -> TransactionalStatus {
        let Some(record) = self.records.get(&txn) else {
            if let Some(TransactionOutcome::Aborted { status }) = self.outcomes.get(txn) {
                warn!(
                    resource = %self.name(),
                    %txn,
                    %status,
                    "confirm for a transaction aborted here"
                );
            }
            return TransactionalStatus::Ok;
        };

        if record.phase != RecordPhase::Prepared {
            warn!(resource = %self.name(), %txn, phase = ?record.phase, "confirm before prepare");
            return TransactionalStatus::CascadingAbort;
        }

        let state = record.state.clone();
        if let Some(state) = &state {
            let batch = StorageBatch::new().commit(txn, timestamp, state.clone());
            if let Err(err) = self.storage.store(batch).await {
                warn!(
                    resource = %self.name(),
                    %txn,
                    error = %err,
                    "failed to persist commit, will retry"
                );
                return TransactionalStatus::StorageFailure;
            }
        }

        self.apply_commit(txn, timestamp, state);
        info!(resource = %self.name(), %txn, timestamp, "commit confirmed");
        TransactionalStatus::Ok
    }

    pub(crate) async fn on_ping_result(&mut self, txn: TxnId, outcome: TransactionOutcome) {
        let prepared = self
            .records
            .get(&txn)
            .is_some_and(|r| r.phase == RecordPhase::Prepared);
        if !prepared {
            return;
        }

        match outcome {
            TransactionOutcome::Committed { timestamp } => {
                self.confirm(txn, timestamp).await;
            }
            TransactionOutcome::Aborted { status } => {
                info!(resource = %self.name(), %txn, %status, "manager reports abort");
                self.abort_local(txn, status).await;
            }
            TransactionOutcome::Pending => {
                if let Some(record) = self.records.get_mut(&txn) {
                    record.last_contact = Instant::now();
                }
            }
        }
    }

    /// Ask the manager about every prepared record that has heard nothing
    /// for a ping interval.
    pub(crate) fn ping_overdue(&mut self, now: Instant) {
        let interval = self.config.ping_interval();
        let mut due = Vec::new();
        for record in self.records.values_mut() {
            if record.phase != RecordPhase::Prepared
                || now.duration_since(record.last_contact) < interval
            {
                continue;
            }
            record.last_contact = now;
            if let Some(manager) = &record.manager {
                due.push((manager.clone(), record.txn, record.timestamp));
            }
        }

        for (manager, txn, timestamp) in due {
            debug!(resource = %self.name(), %txn, manager = %manager, "pinging manager");
            let request = PingRequest {
                resource: manager.name().to_string(),
                txn,
                timestamp,
                participant: self.participant.clone(),
            };
            let outbox = self.outbox.clone();
            self.dispatch(&manager, "ping", move |endpoint| async move {
                let outcome = endpoint.ping(request).await?;
                if let Some(queue) = outbox.upgrade() {
                    let _ = queue.send(QueueCommand::PingResult { txn, outcome }).await;
                }
                Ok(())
            });
        }
    }

    pub(crate) fn send_prepared(
        &self,
        manager: &ParticipantId,
        txn: TxnId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) {
        let message = PreparedMessage {
            resource: manager.name().to_string(),
            txn,
            timestamp,
            participant: self.participant.clone(),
            status,
        };
        self.dispatch(manager, "prepared", move |endpoint| async move {
            endpoint.prepared(message).await
        });
    }
}
