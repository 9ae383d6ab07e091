//! Repository layer.

pub mod edr_store;
pub mod edr_tx;

pub use edr_store::SqlxEdrStore;
pub use edr_tx::EdrTxOps;
