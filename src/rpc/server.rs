use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::protocol::{ParticipantEndpoint, TransportError};

use super::service::transaction_extension_server::{
    TransactionExtension, TransactionExtensionServer,
};
use super::service::{ExtensionRequest, ExtensionResponse};

/// gRPC surface forwarding every message to a host endpoint.
pub struct TransactionExtensionService {
    endpoint: Arc<dyn ParticipantEndpoint>,
}

impl TransactionExtensionService {
    pub fn new(endpoint: Arc<dyn ParticipantEndpoint>) -> Self {
        Self { endpoint }
    }

    pub fn into_server(self) -> TransactionExtensionServer<Self> {
        TransactionExtensionServer::new(self)
    }

    #[allow(clippy::result_large_err)]
    fn decode<T: DeserializeOwned>(
        request: Request<ExtensionRequest>,
        label: &str,
    ) -> Result<T, Status> {
        serde_json::from_slice(&request.into_inner().data).map_err(|err| {
            Status::invalid_argument(format!("failed to decode {label} payload: {err}"))
        })
    }

    #[allow(clippy::result_large_err)]
    fn encode<T: Serialize>(
        result: Result<T, TransportError>,
        label: &str,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let value = result.map_err(to_status)?;
        let data = serde_json::to_vec(&value)
            .map_err(|err| Status::internal(format!("failed to encode {label} response: {err}")))?;
        Ok(Response::new(ExtensionResponse { data }))
    }
}

/// Map a local delivery failure onto a status the client can map back.
fn to_status(err: TransportError) -> Status {
    match err {
        TransportError::UnknownResource { resource, .. } => Status::not_found(resource),
        TransportError::Unreachable { reason, .. } => Status::unavailable(reason),
        TransportError::Rpc { message, .. } => Status::aborted(message),
        TransportError::Codec(message) => Status::invalid_argument(message),
    }
}

#[tonic::async_trait]
impl TransactionExtension for TransactionExtensionService {
    async fn prepare_and_commit(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "prepare_and_commit")?;
        Self::encode(
            self.endpoint.prepare_and_commit(message).await,
            "prepare_and_commit",
        )
    }

    async fn prepared(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "prepared")?;
        Self::encode(self.endpoint.prepared(message).await, "prepared")
    }

    async fn ping(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "ping")?;
        Self::encode(self.endpoint.ping(message).await, "ping")
    }

    async fn commit_read_only(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "commit_read_only")?;
        Self::encode(
            self.endpoint.commit_read_only(message).await,
            "commit_read_only",
        )
    }

    async fn prepare(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "prepare")?;
        Self::encode(self.endpoint.prepare(message).await, "prepare")
    }

    async fn abort(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "abort")?;
        Self::encode(self.endpoint.abort(message).await, "abort")
    }

    async fn cancel(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "cancel")?;
        Self::encode(self.endpoint.cancel(message).await, "cancel")
    }

    async fn confirm(
        &self,
        request: Request<ExtensionRequest>,
    ) -> Result<Response<ExtensionResponse>, Status> {
        let message = Self::decode(request, "confirm")?;
        Self::encode(self.endpoint.confirm(message).await, "confirm")
    }
}

/// Serve `endpoint` on `addr` until `shutdown` resolves.
pub async fn serve(
    endpoint: Arc<dyn ParticipantEndpoint>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), tonic::transport::Error> {
    Server::builder()
        .add_service(TransactionExtensionService::new(endpoint).into_server())
        .serve_with_shutdown(addr, shutdown)
        .await
}
