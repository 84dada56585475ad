//! Client-side driver of transactions: start, resolve and abort.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::clock::LogicalClock;
use crate::config::TransactionConfig;
use crate::protocol::{
    AbortRequest, CommitOutcome, CommitReadOnlyRequest, PrepareAndCommitRequest, PrepareRequest,
    PreparedMessage, Transport, TransportError,
};
use crate::transaction::{
    CommitReceipt, ParticipantId, TransactionContext, TransactionError, TransactionInfo,
    TransactionalStatus, select_manager,
};
use crate::types::{ReplicaId, Timestamp, TxnId};

/// Starts transactions on behalf of one host and drives them to an outcome.
pub struct TransactionAgent {
    replica: ReplicaId,
    clock: Arc<LogicalClock>,
    transport: Arc<dyn Transport>,
    config: TransactionConfig,
    sequence: AtomicU64,
}

impl TransactionAgent {
    pub fn new(
        replica: ReplicaId,
        clock: Arc<LogicalClock>,
        transport: Arc<dyn Transport>,
        config: TransactionConfig,
    ) -> Self {
        // Seeded from the clock so a restarted host never reuses an id.
        let sequence = AtomicU64::new(clock.now());
        Self {
            replica,
            clock,
            transport,
            config,
            sequence,
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn start_transaction(&self, read_only: bool, timeout: Option<Duration>) -> TransactionInfo {
        let id = TxnId::for_replica(self.replica, self.sequence.fetch_add(1, Ordering::SeqCst));
        let timestamp = self.clock.now();
        let timeout = timeout.unwrap_or_else(|| self.config.default_timeout());
        debug!(txn = %id, timestamp, read_only, "transaction started");
        TransactionInfo::new(id, timestamp, timestamp, read_only, timeout)
    }

    pub fn begin(&self, read_only: bool, timeout: Option<Duration>) -> TransactionContext {
        TransactionContext::new(self.start_transaction(read_only, timeout))
    }

    /// Drive `info` to commit or abort.
    pub async fn resolve(&self, info: &TransactionInfo) -> Result<CommitReceipt, TransactionError> {
        let txn = info.id();

        if let Some(failure) = info.failure() {
            let status = failure.status;
            self.abort(info, status).await;
            return Err(TransactionError::aborted(txn, status, failure.cause.clone()));
        }
        if info.pending_calls() > 0 {
            let status = TransactionalStatus::CascadingAbort;
            self.abort(info, status).await;
            return Err(TransactionError::aborted(
                txn,
                status,
                format!("{} sub-calls never joined", info.pending_calls()),
            ));
        }
        if info.is_expired() {
            let status = TransactionalStatus::TransactionTimeout;
            self.abort(info, status).await;
            return Err(TransactionError::aborted(txn, status, None));
        }

        let participants = info.participant_ids();
        if participants.is_empty() {
            return Ok(CommitReceipt {
                commit_ts: info.timestamp(),
            });
        }

        let writers = info.writers();
        if writers.is_empty() {
            return self.commit_read_only(info, participants).await;
        }

        let Some(manager) = select_manager(&participants, &writers).cloned() else {
            self.abort(info, TransactionalStatus::CascadingAbort).await;
            return Err(TransactionError::NoManager(txn));
        };

        let timestamp = self.clock.merge_utc_now(info.timestamp());
        debug!(
            %txn,
            manager = %manager,
            participants = participants.len(),
            writers = writers.len(),
            timestamp,
            "resolving transaction"
        );

        for participant in participants.iter().filter(|p| **p != manager) {
            self.send_prepare(info, participant.clone(), manager.clone(), timestamp);
        }

        let request = PrepareAndCommitRequest {
            resource: manager.name().to_string(),
            txn,
            access: info.access(&manager),
            timestamp,
            participants: participants.clone(),
            writers,
        };
        // The manager gives up on its own after one prepare timeout.
        let deadline = self.config.prepare_timeout().saturating_mul(2);
        let result = timeout(deadline, self.call_manager(&manager, request)).await;

        match result {
            Ok(Ok(CommitOutcome { status, timestamp })) if status.is_ok() => {
                self.clock.observe(timestamp);
                info!(%txn, commit_ts = timestamp, "transaction committed");
                Ok(CommitReceipt {
                    commit_ts: timestamp,
                })
            }
            Ok(Ok(CommitOutcome { status, .. })) => {
                info!(%txn, %status, "transaction aborted by manager");
                Err(TransactionError::aborted(txn, status, None))
            }
            Ok(Err(err)) if !err.was_delivered() => {
                warn!(%txn, manager = %manager, error = %err, "manager unreachable");
                let status = TransactionalStatus::ParticipantUnreachable;
                self.abort(info, status).await;
                Err(TransactionError::aborted(txn, status, err.to_string()))
            }
            Ok(Err(err)) => {
                warn!(%txn, manager = %manager, error = %err, "commit outcome unknown");
                Err(TransactionError::InDoubt {
                    txn,
                    reason: err.to_string(),
                })
            }
            Err(_) => {
                warn!(%txn, manager = %manager, "timed out waiting for manager");
                Err(TransactionError::InDoubt {
                    txn,
                    reason: format!("no answer from {} within {:?}", manager, deadline),
                })
            }
        }
    }

    /// Tell every participant to drop `info` before it prepares.
    pub async fn abort(&self, info: &TransactionInfo, status: TransactionalStatus) {
        let txn = info.id();
        let mut calls = JoinSet::new();
        for participant in info.participant_ids() {
            let transport = self.transport.clone();
            calls.spawn(async move {
                let request = AbortRequest {
                    resource: participant.name().to_string(),
                    txn,
                    status,
                };
                let endpoint = transport.endpoint(participant.reference()).await?;
                endpoint.abort(request).await
            });
        }
        while let Some(joined) = calls.join_next().await {
            if let Ok(Err(err)) = joined {
                debug!(%txn, error = %err, "abort not delivered");
            }
        }
        debug!(%txn, %status, "transaction aborted");
    }

    async fn commit_read_only(
        &self,
        info: &TransactionInfo,
        participants: Vec<ParticipantId>,
    ) -> Result<CommitReceipt, TransactionError> {
        let txn = info.id();
        let timestamp = info.timestamp();
        let mut calls = JoinSet::new();
        for participant in participants {
            let transport = self.transport.clone();
            let request = CommitReadOnlyRequest {
                resource: participant.name().to_string(),
                txn,
                access: info.access(&participant),
                timestamp,
            };
            calls.spawn(async move {
                let endpoint = transport.endpoint(participant.reference()).await?;
                endpoint.commit_read_only(request).await
            });
        }

        let mut status = TransactionalStatus::Ok;
        while let Some(joined) = calls.join_next().await {
            let reported = match joined {
                Ok(Ok(reported)) => reported,
                Ok(Err(err)) => {
                    debug!(%txn, error = %err, "read-only commit not delivered");
                    TransactionalStatus::ParticipantUnreachable
                }
                Err(_) => TransactionalStatus::CascadingAbort,
            };
            status = status.merge(reported);
        }

        if status.is_abort() {
            // Nothing was written, so aborting the rest is always safe.
            self.abort(info, status).await;
            return Err(TransactionError::aborted(txn, status, None));
        }
        debug!(%txn, timestamp, "read-only transaction committed");
        Ok(CommitReceipt {
            commit_ts: timestamp,
        })
    }

    async fn call_manager(
        &self,
        manager: &ParticipantId,
        request: PrepareAndCommitRequest,
    ) -> Result<CommitOutcome, TransportError> {
        let endpoint = self.transport.endpoint(manager.reference()).await?;
        endpoint.prepare_and_commit(request).await
    }

    /// Ask `participant` to prepare. If it cannot be reached the manager is
    /// told directly so it does not wait for a prepare that will never come.
    fn send_prepare(
        &self,
        info: &TransactionInfo,
        participant: ParticipantId,
        manager: ParticipantId,
        timestamp: Timestamp,
    ) {
        let txn = info.id();
        let request = PrepareRequest {
            resource: participant.name().to_string(),
            txn,
            access: info.access(&participant),
            timestamp,
            manager: manager.clone(),
        };
        let transport = self.transport.clone();
        tokio::spawn(async move {
            let delivered = match transport.endpoint(participant.reference()).await {
                Ok(endpoint) => endpoint.prepare(request).await,
                Err(err) => Err(err),
            };
            let Err(err) = delivered else { return };
            if err.was_delivered() {
                debug!(
                    %txn,
                    participant = %participant,
                    error = %err,
                    "prepare may have been lost"
                );
                return;
            }

            warn!(
                %txn,
                participant = %participant,
                error = %err,
                "participant unreachable at prepare"
            );
            let message = PreparedMessage {
                resource: manager.name().to_string(),
                txn,
                timestamp,
                participant,
                status: TransactionalStatus::ParticipantUnreachable,
            };
            let notified = match transport.endpoint(manager.reference()).await {
                Ok(endpoint) => endpoint.prepared(message).await,
                Err(err) => Err(err),
            };
            if let Err(err) = notified {
                debug!(%txn, error = %err, "could not report unreachable participant");
            }
        });
    }
}
