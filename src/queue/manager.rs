//! Manager side of two-phase commit.
//!
//! The elected manager is itself a participant: it validates its own record,
//! collects `Prepared` from everyone else, persists the decision together with
//! its own commit, and then drives confirms until each writer acknowledges.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::protocol::{
    CancelRequest, CommitOutcome, ConfirmRequest, PingRequest, PrepareAndCommitRequest,
    PreparedMessage,
};
use crate::storage::{CommitRecord, ResourceState, StorageBatch};
use crate::transaction::{ParticipantId, TransactionOutcome, TransactionalStatus};
use crate::types::{Timestamp, TxnId};

use super::record::RecordPhase;
use super::worker::{ManagedTransaction, PendingConfirm, TransactionQueue};
use super::{QueueCommand, Reply};

impl<S: ResourceState> TransactionQueue<S> {
    pub(crate) async fn prepare_and_commit(
        &mut self,
        request: PrepareAndCommitRequest,
        reply: Reply<CommitOutcome>,
    ) {
        let txn = request.txn;

        if let Some(managed) = self.managed.get_mut(&txn) {
            // Retried request; answer the latest caller.
            managed.reply = Some(reply);
            return;
        }

        let Some(record) = self.records.get_mut(&txn) else {
            let outcome = match self.outcomes.get(txn) {
                Some(TransactionOutcome::Committed { timestamp }) => CommitOutcome {
                    status: TransactionalStatus::Ok,
                    timestamp,
                },
                Some(TransactionOutcome::Aborted { status }) => CommitOutcome {
                    status,
                    timestamp: request.timestamp,
                },
                _ => {
                    self.outcomes.insert(
                        txn,
                        TransactionOutcome::Aborted {
                            status: TransactionalStatus::CascadingAbort,
                        },
                    );
                    CommitOutcome {
                        status: TransactionalStatus::CascadingAbort,
                        timestamp: request.timestamp,
                    }
                }
            };
            debug!(
                resource = %self.name(),
                %txn,
                status = %outcome.status,
                "commit request without a record"
            );
            let _ = reply.send(outcome);
            return;
        };

        let valid = record.phase == RecordPhase::Pending && record.access == request.access;
        let timestamp = record.timestamp.max(request.timestamp);
        record.timestamp = timestamp;
        record.phase = RecordPhase::Preparing;
        record.manager = Some(self.participant.clone());

        let me = &self.participant;
        let expected: HashSet<ParticipantId> = request
            .participants
            .iter()
            .filter(|p| *p != me)
            .cloned()
            .collect();
        let writers: Vec<ParticipantId> = request
            .writers
            .iter()
            .filter(|p| *p != me)
            .cloned()
            .collect();
        debug!(
            resource = %self.name(),
            %txn,
            timestamp,
            participants = request.participant_count(),
            writers = writers.len(),
            "managing commit"
        );

        self.managed.insert(
            txn,
            ManagedTransaction {
                timestamp,
                expected,
                prepared: HashSet::new(),
                writers,
                reply: Some(reply),
                deadline: Instant::now() + self.config.prepare_timeout(),
            },
        );

        if !valid {
            self.abort_local(txn, TransactionalStatus::ValidationFailure)
                .await;
            return;
        }

        if let Some(early) = self.early_prepared.remove(&txn) {
            for (message, _) in early {
                self.on_prepared(message).await;
            }
        }
        self.try_decide(txn).await;
    }

    pub(crate) async fn on_prepared(&mut self, message: PreparedMessage) {
        let txn = message.txn;

        if let Some(managed) = self.managed.get_mut(&txn) {
            if message.status.is_abort() {
                info!(
                    resource = %self.participant.name(),
                    %txn,
                    participant = %message.participant,
                    status = %message.status,
                    "participant failed to prepare"
                );
                self.abort_local(txn, message.status).await;
                return;
            }
            if !managed.expected.contains(&message.participant) {
                debug!(
                    resource = %self.participant.name(),
                    %txn,
                    participant = %message.participant,
                    "prepared from a non-participant"
                );
                return;
            }
            managed.timestamp = managed.timestamp.max(message.timestamp);
            managed.prepared.insert(message.participant);
            self.try_decide(txn).await;
            return;
        }

        match self.outcomes.get(txn) {
            Some(TransactionOutcome::Committed { timestamp }) => {
                self.send_confirm(&message.participant, txn, timestamp);
            }
            Some(TransactionOutcome::Aborted { status }) => {
                self.send_cancel(&message.participant, txn, message.timestamp, status);
            }
            _ if self.records.contains_key(&txn) => {
                // Arrived before the agent's commit request.
                let failed = message.status.is_abort().then_some(message.status);
                self.early_prepared
                    .entry(txn)
                    .or_default()
                    .push((message, Instant::now()));
                if let Some(status) = failed {
                    self.abort_local(txn, status).await;
                }
            }
            _ => {
                debug!(
                    resource = %self.name(),
                    %txn,
                    participant = %message.participant,
                    "prepared for unknown transaction"
                );
                let status = TransactionalStatus::PrepareTimeout;
                self.outcomes
                    .insert(txn, TransactionOutcome::Aborted { status });
                self.send_cancel(&message.participant, txn, message.timestamp, status);
            }
        }
    }

    /// Commit once every expected participant has prepared.
    async fn try_decide(&mut self, txn: TxnId) {
        let ready = self
            .managed
            .get(&txn)
            .is_some_and(|m| m.prepared.len() >= m.expected.len());
        if !ready {
            return;
        }
        let Some(mut managed) = self.managed.remove(&txn) else {
            return;
        };

        let Some(record) = self.records.get_mut(&txn) else {
            self.finish_abort(txn, managed, TransactionalStatus::CascadingAbort);
            return;
        };

        let timestamp = managed.timestamp.max(record.timestamp);
        record.timestamp = timestamp;
        managed.timestamp = timestamp;

        if let Some(hook) = self.hook.clone()
            && let Some(state) = record.state.as_mut()
        {
            let status = hook.on_decide(txn, state).await;
            if status.is_abort() {
                self.abort_local(txn, status).await;
                self.finish_abort(txn, managed, status);
                return;
            }
        }

        let state = record.state.clone();
        let mut batch = StorageBatch::new();
        if let Some(state) = &state {
            batch = batch.commit(txn, timestamp, state.clone());
        }
        if !managed.writers.is_empty() {
            batch = batch.commit_record(CommitRecord {
                txn,
                timestamp,
                participants: managed.writers.clone(),
            });
        }

        if let Err(err) = self.storage.store(batch).await {
            warn!(resource = %self.name(), %txn, error = %err, "failed to persist commit decision");
            self.abort_local(txn, TransactionalStatus::StorageFailure)
                .await;
            self.finish_abort(txn, managed, TransactionalStatus::StorageFailure);
            return;
        }

        self.apply_commit(txn, timestamp, state);
        info!(
            resource = %self.name(),
            %txn,
            timestamp,
            participants = managed.expected.len() + 1,
            "transaction committed"
        );
        if let Some(reply) = managed.reply.take() {
            let _ = reply.send(CommitOutcome {
                status: TransactionalStatus::Ok,
                timestamp,
            });
        }

        if managed.writers.is_empty() {
            return;
        }
        for writer in &managed.writers {
            self.send_confirm(writer, txn, timestamp);
        }
        self.confirms.insert(
            txn,
            PendingConfirm {
                timestamp,
                remaining: managed.writers.into_iter().collect(),
                last_sent: Instant::now(),
            },
        );
    }

    /// Tell everyone else and the agent that `txn` aborted.
    pub(crate) fn finish_abort(
        &self,
        txn: TxnId,
        mut managed: ManagedTransaction,
        status: TransactionalStatus,
    ) {
        info!(resource = %self.name(), %txn, %status, "transaction aborted");
        for participant in &managed.expected {
            self.send_cancel(participant, txn, managed.timestamp, status);
        }
        if let Some(reply) = managed.reply.take() {
            let _ = reply.send(CommitOutcome {
                status,
                timestamp: managed.timestamp,
            });
        }
    }

    pub(crate) fn on_ping(&mut self, request: PingRequest) -> TransactionOutcome {
        let txn = request.txn;
        if let Some(outcome) = self.outcomes.get(txn) {
            return outcome;
        }
        if let Some(confirm) = self.confirms.get(&txn) {
            return TransactionOutcome::Committed {
                timestamp: confirm.timestamp,
            };
        }
        if self.managed.contains_key(&txn) || self.records.contains_key(&txn) {
            return TransactionOutcome::Pending;
        }

        // Nothing here ever decided to commit it, and nothing can any more.
        debug!(
            resource = %self.name(),
            %txn,
            participant = %request.participant,
            "ping for unknown transaction"
        );
        let outcome = TransactionOutcome::Aborted {
            status: TransactionalStatus::PrepareTimeout,
        };
        self.outcomes.insert(txn, outcome);
        outcome
    }

    pub(crate) async fn expire_managed(&mut self, now: Instant) {
        let expired: Vec<TxnId> = self
            .managed
            .iter()
            .filter(|(_, m)| now >= m.deadline)
            .map(|(txn, _)| *txn)
            .collect();
        for txn in expired {
            info!(resource = %self.name(), %txn, "prepare timed out");
            self.abort_local(txn, TransactionalStatus::PrepareTimeout)
                .await;
        }
    }

    pub(crate) fn resend_confirms(&mut self, now: Instant) {
        let interval = self.config.ping_interval();
        let mut due = Vec::new();
        for (txn, confirm) in self.confirms.iter_mut() {
            if now.duration_since(confirm.last_sent) < interval {
                continue;
            }
            confirm.last_sent = now;
            for participant in &confirm.remaining {
                due.push((participant.clone(), *txn, confirm.timestamp));
            }
        }
        for (participant, txn, timestamp) in due {
            self.send_confirm(&participant, txn, timestamp);
        }
    }

    pub(crate) async fn on_confirm_acked(&mut self, txn: TxnId, participant: ParticipantId) {
        let Some(confirm) = self.confirms.get_mut(&txn) else {
            return;
        };
        confirm.remaining.remove(&participant);
        if !confirm.remaining.is_empty() {
            return;
        }
        self.confirms.remove(&txn);
        debug!(resource = %self.name(), %txn, "all confirms acknowledged");
        if let Err(err) = self
            .storage
            .store(StorageBatch::new().forget_commit_record(txn))
            .await
        {
            warn!(resource = %self.name(), %txn, error = %err, "failed to forget commit record");
        }
    }

    pub(crate) fn send_confirm(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        timestamp: Timestamp,
    ) {
        let request = ConfirmRequest {
            resource: participant.name().to_string(),
            txn,
            timestamp,
        };
        let outbox = self.outbox.clone();
        let acked_by = participant.clone();
        self.dispatch(participant, "confirm", move |endpoint| async move {
            let status = endpoint.confirm(request).await?;
            if status.is_ok()
                && let Some(queue) = outbox.upgrade()
            {
                let _ = queue
                    .send(QueueCommand::ConfirmAcked {
                        txn,
                        participant: acked_by,
                    })
                    .await;
            }
            Ok(())
        });
    }

    pub(crate) fn send_cancel(
        &self,
        participant: &ParticipantId,
        txn: TxnId,
        timestamp: Timestamp,
        status: TransactionalStatus,
    ) {
        let request = CancelRequest {
            resource: participant.name().to_string(),
            txn,
            timestamp,
            status,
        };
        self.dispatch(participant, "cancel", move |endpoint| async move {
            endpoint.cancel(request).await
        });
    }
}
