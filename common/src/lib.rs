// Tessera common library - main library exports

pub mod configuration;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod ops;
pub mod store;
pub mod types;

// Flattened re-exports
pub use self::error::{IndexerError, IndexerResult};
pub use self::types::*;
