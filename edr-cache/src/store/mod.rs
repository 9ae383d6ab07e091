//! Credential store contract and its engines.
//!
//! The store is the only shared mutable resource. Every mutation goes
//! through [`EdrStore::save`], a state compare-and-swap, or the
//! [`EdrUnitOfWork`] returned by [`EdrStore::begin`].

pub mod memory;

use async_trait::async_trait;

use crate::Result;
use crate::domain::{EdrEntry, EdrFilter, EdrState, EndpointDataReference};

pub use crate::database::repositories::edr_store::SqlxEdrStore;
pub use memory::InMemoryEdrStore;

/// Default page size for queries.
pub const DEFAULT_QUERY_LIMIT: u32 = 50;

/// A transactional scope over the store.
///
/// Writes become visible only after [`commit`](EdrUnitOfWork::commit).
/// Dropping the value without committing discards them.
#[async_trait]
pub trait EdrUnitOfWork: Send {
    async fn find_by_id(
        &mut self,
        transfer_process_id: &str,
    ) -> Result<Option<(EdrEntry, EndpointDataReference)>>;

    /// All entries matching `filter`, in creation order.
    async fn query(&mut self, filter: &EdrFilter) -> Result<Vec<EdrEntry>>;

    /// Upsert `entry` and expire every other live entry for the same
    /// `(asset_id, agreement_id)`. Returns the ids that were superseded.
    async fn save(&mut self, entry: &EdrEntry, edr: &EndpointDataReference)
    -> Result<Vec<String>>;

    /// Compare-and-swap on the entry state.
    async fn transition(
        &mut self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
    ) -> Result<EdrEntry>;

    async fn commit(self: Box<Self>) -> Result<()>;
}

/// Durable keyed storage of `(EdrEntry, EndpointDataReference)` pairs.
///
/// Operations on one key are linearizable. Implementations must make
/// [`transition`](EdrStore::transition) and
/// [`complete_refresh`](EdrStore::complete_refresh) atomic against every
/// process sharing the backing store, since they gate the single-flight
/// refresh.
#[async_trait]
pub trait EdrStore: Send + Sync {
    /// Open a unit of work.
    async fn begin(&self) -> Result<Box<dyn EdrUnitOfWork>>;

    /// Atomic upsert with supersession. Returns the superseded ids.
    async fn save(&self, entry: &EdrEntry, edr: &EndpointDataReference) -> Result<Vec<String>> {
        let mut uow = self.begin().await?;
        let superseded = uow.save(entry, edr).await?;
        uow.commit().await?;
        Ok(superseded)
    }

    /// Entry and credential, or `NotFound`.
    async fn find_by_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<(EdrEntry, EndpointDataReference)>;

    /// One page of matching entries in creation order.
    async fn query(&self, filter: &EdrFilter, offset: u32, limit: u32) -> Result<Vec<EdrEntry>>;

    async fn count(&self, filter: &EdrFilter) -> Result<u64>;

    /// Remove the record, or `NotFound`.
    async fn delete(&self, transfer_process_id: &str) -> Result<()>;

    /// Move `expected -> target` if and only if the current state is
    /// `expected`. Fails with `Conflict` when the state differs and with
    /// `InvalidStateTransition` when the edge is illegal.
    async fn transition(
        &self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
    ) -> Result<EdrEntry>;

    /// Claim the refresh of one expiry epoch: move `expected -> REFRESHING`
    /// only if the state is still `expected` and the expiry is still
    /// `observed_expiration`. A caller that read the entry before someone
    /// else refreshed it therefore loses with `Conflict`.
    async fn start_refresh(
        &self,
        transfer_process_id: &str,
        expected: EdrState,
        observed_expiration: i64,
    ) -> Result<EdrEntry>;

    /// Write the refreshed credential and move `REFRESHING -> NEGOTIATED`
    /// in one step. Fails with `Conflict` if the entry left `REFRESHING`.
    async fn complete_refresh(
        &self,
        transfer_process_id: &str,
        edr: &EndpointDataReference,
        expiration_timestamp: i64,
    ) -> Result<EdrEntry>;

    /// Live credentials for an asset, optionally restricted to one provider.
    async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<(EdrEntry, EndpointDataReference)>>;

    /// Demote `REFRESHING` entries untouched since before `older_than_ms`
    /// to `ERROR`. Returns the affected ids.
    async fn recover_stale_refreshes(&self, older_than_ms: i64, detail: &str)
    -> Result<Vec<String>>;

    /// Delete `EXPIRED` entries untouched since before `older_than_ms`.
    async fn purge_expired(&self, older_than_ms: i64) -> Result<u64>;
}

/// Conflict raised when a compare-and-swap observes a different state.
pub(crate) fn state_conflict(
    transfer_process_id: &str,
    expected: EdrState,
    actual: EdrState,
) -> crate::Error {
    if expected == actual {
        crate::Error::conflict(format!(
            "EDR {transfer_process_id} was refreshed concurrently"
        ))
    } else {
        crate::Error::conflict(format!(
            "EDR {transfer_process_id} is {actual}, expected {expected}"
        ))
    }
}
