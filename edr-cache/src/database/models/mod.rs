//! Database models.

pub mod edr_entry;

pub use edr_entry::*;
