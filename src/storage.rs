pub mod adapter;
pub mod disk;
pub mod engine;
pub mod memory;
pub mod write_vector;

pub use adapter::StorageAdapter;
pub use disk::OnDiskStorage;
pub use engine::{
    CommitRecord, CommittedWrite, PreparedRecord, ResourceState, StorageBatch, StorageError,
    StoredResource, TransactionalStorage,
};
pub use memory::InMemoryStorage;
pub use write_vector::WriteVector;
