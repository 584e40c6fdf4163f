//! Events emitted to observers once data is committed

use crate::types::{BlockRecord, ChainNetwork, TransactionRecord};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexerEvent {
    /// A block and all its operations were written
    Block(BlockRecord),

    /// A transaction was written, confirmed or from the mempool
    Transaction(TransactionRecord),

    /// The initial sync pass for a chain completed
    SyncComplete(ChainNetwork),
}
