//! SQLite-backed EDR store.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::edr_tx::EdrTxOps;
use crate::clock::{Clock, SystemClock};
use crate::database::models::EdrEntryDbModel;
use crate::database::retry::retry_on_sqlite_busy;
use crate::database::{DbPool, ImmediateTransaction, WritePool, begin_immediate};
use crate::domain::{EdrEntry, EdrFilter, EdrState, EndpointDataReference};
use crate::store::{EdrStore, EdrUnitOfWork};
use crate::{Error, Result};

/// SQLite implementation of [`EdrStore`].
///
/// Reads go through `pool`, writes through the single-connection
/// `write_pool`. State changes are guarded `UPDATE`s, so the single-flight
/// gate holds for every process sharing the database file.
pub struct SqlxEdrStore {
    pool: DbPool,
    write_pool: WritePool,
    clock: Arc<dyn Clock>,
}

impl SqlxEdrStore {
    pub fn new(pool: DbPool, write_pool: WritePool) -> Self {
        Self::with_clock(pool, write_pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: DbPool, write_pool: WritePool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool,
            write_pool,
            clock,
        }
    }

    fn decode_all(rows: Vec<EdrEntryDbModel>) -> Result<Vec<EdrEntry>> {
        rows.iter().map(EdrEntryDbModel::to_entry).collect()
    }
}

#[async_trait]
impl EdrStore for SqlxEdrStore {
    async fn begin(&self) -> Result<Box<dyn EdrUnitOfWork>> {
        let tx = retry_on_sqlite_busy("edr_begin", || async {
            Ok(begin_immediate(&self.write_pool).await?)
        })
        .await?;
        Ok(Box::new(SqlxUnitOfWork {
            tx,
            clock: self.clock.clone(),
        }))
    }

    async fn find_by_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<(EdrEntry, EndpointDataReference)> {
        let mut conn = self.pool.acquire().await?;
        EdrTxOps::find_by_id(&mut conn, transfer_process_id)
            .await?
            .ok_or_else(|| Error::not_found("EDR", transfer_process_id))?
            .into_domain()
    }

    async fn query(&self, filter: &EdrFilter, offset: u32, limit: u32) -> Result<Vec<EdrEntry>> {
        let mut conn = self.pool.acquire().await?;
        let rows = EdrTxOps::select(&mut conn, filter, Some((offset, limit))).await?;
        Self::decode_all(rows)
    }

    async fn count(&self, filter: &EdrFilter) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let total = EdrTxOps::count(&mut conn, filter).await?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self))]
    async fn delete(&self, transfer_process_id: &str) -> Result<()> {
        let deleted = retry_on_sqlite_busy("edr_delete", || async {
            let mut conn = self.write_pool.acquire().await?;
            EdrTxOps::delete(&mut conn, transfer_process_id).await
        })
        .await?;

        if deleted == 0 {
            return Err(Error::not_found("EDR", transfer_process_id));
        }
        debug!("EDR entry deleted");
        Ok(())
    }

    async fn transition(
        &self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
    ) -> Result<EdrEntry> {
        let detail = detail.as_deref();
        let row = retry_on_sqlite_busy("edr_transition", || async {
            let mut conn = self.write_pool.acquire().await?;
            EdrTxOps::compare_and_set(
                &mut conn,
                transfer_process_id,
                expected,
                target,
                detail,
                self.clock.now_ms(),
            )
            .await
        })
        .await?;
        row.to_entry()
    }

    async fn start_refresh(
        &self,
        transfer_process_id: &str,
        expected: EdrState,
        observed_expiration: i64,
    ) -> Result<EdrEntry> {
        let row = retry_on_sqlite_busy("edr_start_refresh", || async {
            let mut conn = self.write_pool.acquire().await?;
            EdrTxOps::start_refresh(
                &mut conn,
                transfer_process_id,
                expected,
                observed_expiration,
                self.clock.now_ms(),
            )
            .await
        })
        .await?;
        row.to_entry()
    }

    async fn complete_refresh(
        &self,
        transfer_process_id: &str,
        edr: &EndpointDataReference,
        expiration_timestamp: i64,
    ) -> Result<EdrEntry> {
        let edr_json = serde_json::to_string(edr)?;
        let row = retry_on_sqlite_busy("edr_complete_refresh", || async {
            let mut conn = self.write_pool.acquire().await?;
            EdrTxOps::complete_refresh(
                &mut conn,
                transfer_process_id,
                &edr_json,
                expiration_timestamp,
                self.clock.now_ms(),
            )
            .await
        })
        .await?;
        row.to_entry()
    }

    async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<(EdrEntry, EndpointDataReference)>> {
        let mut conn = self.pool.acquire().await?;
        EdrTxOps::live_for_asset(&mut conn, asset_id, provider_id)
            .await?
            .into_iter()
            .map(EdrEntryDbModel::into_domain)
            .collect()
    }

    async fn recover_stale_refreshes(
        &self,
        older_than_ms: i64,
        detail: &str,
    ) -> Result<Vec<String>> {
        retry_on_sqlite_busy("edr_recover_stale_refreshes", || async {
            let mut conn = self.write_pool.acquire().await?;
            EdrTxOps::recover_stale_refreshes(&mut conn, older_than_ms, detail, self.clock.now_ms())
                .await
        })
        .await
    }

    async fn purge_expired(&self, older_than_ms: i64) -> Result<u64> {
        retry_on_sqlite_busy("edr_purge_expired", || async {
            let mut conn = self.write_pool.acquire().await?;
            EdrTxOps::purge_expired(&mut conn, older_than_ms).await
        })
        .await
    }
}

/// Unit of work over one `BEGIN IMMEDIATE` transaction.
struct SqlxUnitOfWork {
    tx: ImmediateTransaction,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl EdrUnitOfWork for SqlxUnitOfWork {
    async fn find_by_id(
        &mut self,
        transfer_process_id: &str,
    ) -> Result<Option<(EdrEntry, EndpointDataReference)>> {
        EdrTxOps::find_by_id(&mut self.tx, transfer_process_id)
            .await?
            .map(EdrEntryDbModel::into_domain)
            .transpose()
    }

    async fn query(&mut self, filter: &EdrFilter) -> Result<Vec<EdrEntry>> {
        let rows = EdrTxOps::select(&mut self.tx, filter, None).await?;
        SqlxEdrStore::decode_all(rows)
    }

    async fn save(
        &mut self,
        entry: &EdrEntry,
        edr: &EndpointDataReference,
    ) -> Result<Vec<String>> {
        let model = EdrEntryDbModel::from_domain(entry, edr)?;
        let superseded = EdrTxOps::supersede(&mut self.tx, &model, self.clock.now_ms()).await?;
        EdrTxOps::upsert(&mut self.tx, &model).await?;
        Ok(superseded)
    }

    async fn transition(
        &mut self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
    ) -> Result<EdrEntry> {
        EdrTxOps::compare_and_set(
            &mut self.tx,
            transfer_process_id,
            expected,
            target,
            detail.as_deref(),
            self.clock.now_ms(),
        )
        .await?
        .to_entry()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}
