pub mod file_store;

use async_trait::async_trait;

use crate::error::TransferResult;
use crate::model::{TransferId, TransferRecord};

/// Durable record storage surviving process restarts (spec §4.1).
///
/// Implementations must make `insert`/`update`/`delete` individually durable: a crash between
/// two calls must never leave a record only half written.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn insert(&self, record: TransferRecord) -> TransferResult<()>;

    async fn update(&self, record: TransferRecord) -> TransferResult<()>;

    /// Deletes a record and, if it is a `BlobTransfer`, every `BlockTransfer` naming it as
    /// parent (spec §4.1: "deleting a blob transfer cascades to its blocks").
    async fn delete(&self, id: &str) -> TransferResult<()>;

    async fn get(&self, id: &str) -> TransferResult<Option<TransferRecord>>;

    /// All top-level `BlobTransfer` records, used to hydrate a manager at startup.
    async fn fetch_roots(&self) -> TransferResult<Vec<TransferRecord>>;

    /// All `BlockTransfer` records whose parent is `blob_id`, in persisted order.
    async fn fetch_children(&self, blob_id: &str) -> TransferResult<Vec<TransferRecord>>;

    /// Flushes any pending changes (spec §4.1: "`save()` which atomically flushes pending
    /// changes"). Implementations that make every mutation durable immediately (like
    /// [`file_store::FileSystemStore`]) may treat this as a no-op; it exists so a buffered
    /// backing store has a place to commit its dirty set without changing the trait.
    async fn save(&self) -> TransferResult<()> {
        Ok(())
    }
}
