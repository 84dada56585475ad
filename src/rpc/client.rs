use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tonic::transport::Channel;
use tonic::{Code, Status};

use crate::protocol::{
    AbortRequest, CancelRequest, CommitOutcome, CommitReadOnlyRequest, ConfirmRequest,
    ParticipantEndpoint, PingRequest, PrepareAndCommitRequest, PrepareRequest, PreparedMessage,
    TransportError,
};
use crate::transaction::{ActorRef, TransactionOutcome, TransactionalStatus};

use super::service::ExtensionRequest;
use super::service::transaction_extension_client::TransactionExtensionClient;

/// Endpoint of a host in another process, reached over gRPC.
///
/// A connection is opened per call; failing to connect means the message was
/// never delivered.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    target: ActorRef,
    endpoint: String,
}

impl RemoteParticipant {
    pub fn new(target: ActorRef, endpoint: impl Into<String>) -> Self {
        Self {
            target,
            endpoint: endpoint.into(),
        }
    }

    async fn client(&self) -> Result<TransactionExtensionClient<Channel>, TransportError> {
        TransactionExtensionClient::connect(self.endpoint.clone())
            .await
            .map_err(|err| TransportError::Unreachable {
                actor: self.target.clone(),
                reason: format!("connect to {}: {err}", self.endpoint),
            })
    }

    fn encode<T: Serialize>(message: &T) -> Result<ExtensionRequest, TransportError> {
        let data = serde_json::to_vec(message)
            .map_err(|err| TransportError::Codec(format!("encode request: {err}")))?;
        Ok(ExtensionRequest { data })
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, TransportError> {
        serde_json::from_slice(data)
            .map_err(|err| TransportError::Codec(format!("decode response: {err}")))
    }

    fn status_error(&self, resource: &str, status: Status) -> TransportError {
        match status.code() {
            Code::NotFound => TransportError::UnknownResource {
                actor: self.target.clone(),
                resource: resource.to_string(),
            },
            _ => TransportError::Rpc {
                target: self.target.clone(),
                message: status.to_string(),
            },
        }
    }
}

macro_rules! forward {
    ($self:ident, $method:ident, $message:expr) => {{
        let message = $message;
        let request = Self::encode(&message)?;
        let mut client = $self.client().await?;
        let response = client
            .$method(request)
            .await
            .map_err(|status| $self.status_error(&message.resource, status))?;
        Self::decode(&response.into_inner().data)
    }};
}

#[async_trait]
impl ParticipantEndpoint for RemoteParticipant {
    async fn prepare_and_commit(
        &self,
        request: PrepareAndCommitRequest,
    ) -> Result<CommitOutcome, TransportError> {
        forward!(self, prepare_and_commit, request)
    }

    async fn prepared(&self, message: PreparedMessage) -> Result<(), TransportError> {
        forward!(self, prepared, message)
    }

    async fn ping(&self, request: PingRequest) -> Result<TransactionOutcome, TransportError> {
        forward!(self, ping, request)
    }

    async fn commit_read_only(
        &self,
        request: CommitReadOnlyRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        forward!(self, commit_read_only, request)
    }

    async fn prepare(&self, request: PrepareRequest) -> Result<(), TransportError> {
        forward!(self, prepare, request)
    }

    async fn abort(&self, request: AbortRequest) -> Result<(), TransportError> {
        forward!(self, abort, request)
    }

    async fn cancel(&self, request: CancelRequest) -> Result<(), TransportError> {
        forward!(self, cancel, request)
    }

    async fn confirm(
        &self,
        request: ConfirmRequest,
    ) -> Result<TransactionalStatus, TransportError> {
        forward!(self, confirm, request)
    }
}
