//! Before/after handling of transactional calls.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::TransactionAgent;
use crate::transaction::{TransactionContext, TransactionError};

/// How a call relates to the ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransactionOption {
    /// Run outside of any transaction, hiding the ambient one.
    Suppress,
    /// Join the ambient transaction or start one.
    #[default]
    CreateOrJoin,
    /// Always start a fresh transaction.
    Create,
    /// Require an ambient transaction.
    Join,
    /// Join the ambient transaction if there is one.
    Supported,
    /// Fail if called inside a transaction.
    NotAllowed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub option: TransactionOption,
    pub read_only: bool,
    pub timeout: Option<Duration>,
}

impl TransactionOptions {
    pub fn new(option: TransactionOption) -> Self {
        Self {
            option,
            ..Self::default()
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Where the context of a call came from.
enum Attached {
    None,
    Joined(TransactionContext),
    Created(TransactionContext),
}

#[derive(Clone)]
pub struct TransactionInterceptor {
    agent: Arc<TransactionAgent>,
}

impl TransactionInterceptor {
    pub fn new(agent: Arc<TransactionAgent>) -> Self {
        Self { agent }
    }

    pub fn agent(&self) -> &Arc<TransactionAgent> {
        &self.agent
    }

    /// Context a call with `options` should run under, or the reason it may
    /// not run at all.
    pub fn get_or_start(
        &self,
        options: &TransactionOptions,
    ) -> Result<Option<TransactionContext>, TransactionError> {
        Ok(match self.attach(options)? {
            Attached::None => None,
            Attached::Joined(ctx) | Attached::Created(ctx) => Some(ctx),
        })
    }

    fn attach(&self, options: &TransactionOptions) -> Result<Attached, TransactionError> {
        let ambient = TransactionContext::current();
        let fresh = || self.agent.begin(options.read_only, options.timeout);
        let attached = match (options.option, ambient) {
            (TransactionOption::Suppress, _) => Attached::None,
            (TransactionOption::Create, _) => Attached::Created(fresh()),
            (TransactionOption::CreateOrJoin, Some(ctx)) => Attached::Joined(ctx),
            (TransactionOption::CreateOrJoin, None) => Attached::Created(fresh()),
            (TransactionOption::Join, Some(ctx)) => Attached::Joined(ctx),
            (TransactionOption::Join, None) => return Err(TransactionError::TransactionRequired),
            (TransactionOption::Supported, Some(ctx)) => Attached::Joined(ctx),
            (TransactionOption::Supported, None) => Attached::None,
            (TransactionOption::NotAllowed, Some(_)) => {
                return Err(TransactionError::TransactionNotAllowed);
            }
            (TransactionOption::NotAllowed, None) => Attached::None,
        };
        Ok(attached)
    }

    /// Run `call` under `options`.
    ///
    /// A joined call runs on a fork of the ambient context that is folded back
    /// when it returns. A created transaction is resolved when the call
    /// succeeds and aborted when it fails. The ambient context seen by the
    /// caller is unchanged afterwards on every path.
    pub async fn invoke<F, Fut, T>(
        &self,
        options: TransactionOptions,
        call: F,
    ) -> Result<T, TransactionError>
    where
        F: FnOnce(Option<TransactionContext>) -> Fut,
        Fut: Future<Output = Result<T, TransactionError>>,
    {
        match self.attach(&options)? {
            Attached::None => TransactionContext::scope(None, call(None)).await,
            Attached::Joined(parent) => {
                let child = parent.fork();
                let result =
                    TransactionContext::scope(Some(child.clone()), call(Some(child.clone())))
                        .await;
                if let Err(err) = &result {
                    child.record_failure(err.status(), Some(err.to_string()));
                }
                parent.join(&child);
                result
            }
            Attached::Created(ctx) => {
                let txn = ctx.id();
                let result =
                    TransactionContext::scope(Some(ctx.clone()), call(Some(ctx.clone()))).await;
                let info = ctx.snapshot();
                match result {
                    Ok(value) => {
                        self.agent.resolve(&info).await?;
                        Ok(value)
                    }
                    Err(err) => {
                        let status = info
                            .failure()
                            .map(|failure| failure.status)
                            .unwrap_or_else(|| err.status());
                        debug!(%txn, %status, error = %err, "transactional call failed");
                        self.agent.abort(&info, status).await;
                        Err(match err {
                            TransactionError::Aborted { .. } => err,
                            other => TransactionError::aborted(txn, status, other.to_string()),
                        })
                    }
                }
            }
        }
    }
}
