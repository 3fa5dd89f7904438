pub mod download;
pub mod upload;

use crate::model::BlockTransfer;
use crate::queue::WorkUnit;
use std::sync::Arc;

/// The decomposed form of one `BlobTransfer`: the work units to schedule plus the
/// `BlockTransfer` records that mirror them in the store (spec §4.2: "a blob transfer is
/// decomposed into block transfers before any network activity begins").
pub struct Decomposition {
    pub units: Vec<Arc<dyn WorkUnit>>,
    pub blocks: Vec<BlockTransfer>,
}
