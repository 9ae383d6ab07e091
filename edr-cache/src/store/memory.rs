//! In-memory store engine.
//!
//! Single process only. A unit of work holds the store lock for its whole
//! lifetime and stages its writes on a copy of the table.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{EdrStore, EdrUnitOfWork, state_conflict};
use crate::clock::{Clock, SystemClock};
use crate::domain::{EdrEntry, EdrFilter, EdrState, EndpointDataReference};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct Record {
    /// Insertion sequence, breaks ties on `created_at`.
    seq: u64,
    entry: EdrEntry,
    edr: EndpointDataReference,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: HashMap<String, Record>,
    next_seq: u64,
}

impl Table {
    fn ordered(&self, filter: &EdrFilter) -> Vec<&Record> {
        let mut hits: Vec<&Record> = self
            .rows
            .values()
            .filter(|r| filter.matches(&r.entry))
            .collect();
        hits.sort_by_key(|r| (r.entry.created_at, r.seq));
        hits
    }

    fn save(&mut self, entry: &EdrEntry, edr: &EndpointDataReference, now: i64) -> Vec<String> {
        let mut superseded: Vec<(i64, u64, String)> = Vec::new();
        for record in self.rows.values_mut() {
            let e = &mut record.entry;
            if e.transfer_process_id != entry.transfer_process_id
                && e.same_pair(entry)
                && e.state.is_live()
            {
                e.state = EdrState::Expired;
                e.error_detail = None;
                e.last_modified = now;
                superseded.push((e.created_at, record.seq, e.transfer_process_id.clone()));
            }
        }
        superseded.sort();

        let (seq, created_at) = match self.rows.get(&entry.transfer_process_id) {
            Some(existing) => (existing.seq, existing.entry.created_at),
            None => {
                self.next_seq += 1;
                (self.next_seq, entry.created_at)
            }
        };
        let mut stored = entry.clone();
        stored.created_at = created_at;
        self.rows.insert(
            entry.transfer_process_id.clone(),
            Record {
                seq,
                entry: stored,
                edr: edr.clone(),
            },
        );

        superseded.into_iter().map(|(_, _, id)| id).collect()
    }

    fn transition(
        &mut self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
        now: i64,
    ) -> Result<EdrEntry> {
        expected.transition_to(target)?;
        let record = self
            .rows
            .get_mut(transfer_process_id)
            .ok_or_else(|| Error::not_found("EDR", transfer_process_id))?;
        if record.entry.state != expected {
            return Err(state_conflict(
                transfer_process_id,
                expected,
                record.entry.state,
            ));
        }
        record.entry.apply_transition(target, detail, now)?;
        Ok(record.entry.clone())
    }
}

/// Process-local [`EdrStore`].
pub struct InMemoryEdrStore {
    table: Arc<Mutex<Table>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryEdrStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEdrStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Arc::new(Mutex::new(Table::default())),
            clock,
        }
    }
}

#[async_trait]
impl EdrStore for InMemoryEdrStore {
    async fn begin(&self) -> Result<Box<dyn EdrUnitOfWork>> {
        let guard = self.table.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(InMemoryUnitOfWork {
            guard,
            staged,
            clock: self.clock.clone(),
        }))
    }

    async fn find_by_id(
        &self,
        transfer_process_id: &str,
    ) -> Result<(EdrEntry, EndpointDataReference)> {
        let table = self.table.lock().await;
        table
            .rows
            .get(transfer_process_id)
            .map(|r| (r.entry.clone(), r.edr.clone()))
            .ok_or_else(|| Error::not_found("EDR", transfer_process_id))
    }

    async fn query(&self, filter: &EdrFilter, offset: u32, limit: u32) -> Result<Vec<EdrEntry>> {
        let table = self.table.lock().await;
        Ok(table
            .ordered(filter)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|r| r.entry.clone())
            .collect())
    }

    async fn count(&self, filter: &EdrFilter) -> Result<u64> {
        let table = self.table.lock().await;
        Ok(table.ordered(filter).len() as u64)
    }

    async fn delete(&self, transfer_process_id: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        table
            .rows
            .remove(transfer_process_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("EDR", transfer_process_id))
    }

    async fn transition(
        &self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
    ) -> Result<EdrEntry> {
        let now = self.clock.now_ms();
        let mut table = self.table.lock().await;
        table.transition(transfer_process_id, expected, target, detail, now)
    }

    async fn start_refresh(
        &self,
        transfer_process_id: &str,
        expected: EdrState,
        observed_expiration: i64,
    ) -> Result<EdrEntry> {
        let now = self.clock.now_ms();
        let mut table = self.table.lock().await;
        expected.transition_to(EdrState::Refreshing)?;
        let current = table
            .rows
            .get(transfer_process_id)
            .ok_or_else(|| Error::not_found("EDR", transfer_process_id))?;
        if current.entry.expiration_timestamp != observed_expiration {
            return Err(state_conflict(
                transfer_process_id,
                expected,
                current.entry.state,
            ));
        }
        table.transition(
            transfer_process_id,
            expected,
            EdrState::Refreshing,
            None,
            now,
        )
    }

    async fn complete_refresh(
        &self,
        transfer_process_id: &str,
        edr: &EndpointDataReference,
        expiration_timestamp: i64,
    ) -> Result<EdrEntry> {
        let now = self.clock.now_ms();
        let mut table = self.table.lock().await;
        let updated = table.transition(
            transfer_process_id,
            EdrState::Refreshing,
            EdrState::Negotiated,
            None,
            now,
        )?;
        let record = table
            .rows
            .get_mut(transfer_process_id)
            .ok_or_else(|| Error::not_found("EDR", transfer_process_id))?;
        record.entry.expiration_timestamp = expiration_timestamp;
        record.edr = edr.clone();
        Ok(EdrEntry {
            expiration_timestamp,
            ..updated
        })
    }

    async fn references_for_asset(
        &self,
        asset_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<(EdrEntry, EndpointDataReference)>> {
        let table = self.table.lock().await;
        let mut filter = EdrFilter {
            asset_id: Some(asset_id.to_string()),
            ..Default::default()
        };
        if let Some(provider_id) = provider_id {
            filter = filter.with_provider(provider_id);
        }
        Ok(table
            .ordered(&filter)
            .into_iter()
            .filter(|r| r.entry.state.is_live())
            .map(|r| (r.entry.clone(), r.edr.clone()))
            .collect())
    }

    async fn recover_stale_refreshes(
        &self,
        older_than_ms: i64,
        detail: &str,
    ) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        let mut table = self.table.lock().await;
        let stale: Vec<String> = table
            .ordered(&EdrFilter::default().with_state(EdrState::Refreshing))
            .into_iter()
            .filter(|r| r.entry.last_modified < older_than_ms)
            .map(|r| r.entry.transfer_process_id.clone())
            .collect();
        for id in &stale {
            table.transition(
                id,
                EdrState::Refreshing,
                EdrState::Error,
                Some(detail.to_string()),
                now,
            )?;
        }
        Ok(stale)
    }

    async fn purge_expired(&self, older_than_ms: i64) -> Result<u64> {
        let mut table = self.table.lock().await;
        let before = table.rows.len();
        table.rows.retain(|_, r| {
            !(r.entry.state == EdrState::Expired && r.entry.last_modified < older_than_ms)
        });
        Ok((before - table.rows.len()) as u64)
    }
}

struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<Table>,
    staged: Table,
    clock: Arc<dyn Clock>,
}

#[async_trait]
impl EdrUnitOfWork for InMemoryUnitOfWork {
    async fn find_by_id(
        &mut self,
        transfer_process_id: &str,
    ) -> Result<Option<(EdrEntry, EndpointDataReference)>> {
        Ok(self
            .staged
            .rows
            .get(transfer_process_id)
            .map(|r| (r.entry.clone(), r.edr.clone())))
    }

    async fn query(&mut self, filter: &EdrFilter) -> Result<Vec<EdrEntry>> {
        Ok(self
            .staged
            .ordered(filter)
            .into_iter()
            .map(|r| r.entry.clone())
            .collect())
    }

    async fn save(
        &mut self,
        entry: &EdrEntry,
        edr: &EndpointDataReference,
    ) -> Result<Vec<String>> {
        let now = self.clock.now_ms();
        Ok(self.staged.save(entry, edr, now))
    }

    async fn transition(
        &mut self,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<String>,
    ) -> Result<EdrEntry> {
        let now = self.clock.now_ms();
        self.staged
            .transition(transfer_process_id, expected, target, detail, now)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryUnitOfWork {
            mut guard, staged, ..
        } = *self;
        *guard = staged;
        Ok(())
    }
}
