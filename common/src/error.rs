//! Error taxonomy shared by the ingestion modules

use thiserror::Error;

/// Errors raised while ingesting blocks and transactions
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Wire data could not be decoded; fatal for that item only
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The store could not be reached or failed a read/write; transient
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// No common ancestor was found within the bounded backward walk
    #[error("reorg ambiguous for {chain}: no ancestor of {hash} within {depth} blocks of the tip")]
    ReorgAmbiguous {
        chain: String,
        hash: String,
        depth: u64,
    },

    /// A spend guard failed because the coin was already spent by another transaction
    #[error(
        "double spend of {mint_txid}:{mint_index} by {spent_txid}, already spent by {existing_txid}"
    )]
    DoubleSpendConflict {
        mint_txid: String,
        mint_index: u32,
        spent_txid: String,
        existing_txid: String,
    },
}

impl IndexerError {
    pub fn malformed(message: impl Into<String>) -> Self {
        IndexerError::MalformedInput(message.into())
    }

    pub fn store(error: impl std::fmt::Display) -> Self {
        IndexerError::StoreUnavailable(error.to_string())
    }

    /// Whether restarting the sync loop may clear the condition
    pub fn is_transient(&self) -> bool {
        matches!(self, IndexerError::StoreUnavailable(_))
    }
}

pub type IndexerResult<T> = Result<T, IndexerError>;
