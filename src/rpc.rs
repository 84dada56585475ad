//! gRPC binding of the participant wire contract.

pub mod client;
pub mod server;

pub mod service {
    tonic::include_proto!("tessera");
}
