//! Consumer-side cache of Endpoint Data References.
//!
//! Credentials handed out after a contract negotiation and transfer are
//! cached per transfer process, served to local callers and refreshed
//! against the provider's token endpoint with at most one refresh in flight
//! per entry, even across processes sharing the database.

pub mod api;
pub mod clock;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod lifecycle;
pub mod logging;
pub mod refresh;
pub mod service;
pub mod store;

pub use error::{Error, ErrorKind, Result};
