//! Transactional operations for EDR entries.
//!
//! Use these when EDR writes are part of a larger transaction (supersession
//! plus insert, or the termination cascade). The single-statement
//! operations are also safe to run on a bare write connection.

use sqlx::{Row, SqliteConnection};

use crate::database::models::EdrEntryDbModel;
use crate::domain::{EdrFilter, EdrState};
use crate::store::state_conflict;
use crate::{Error, Result};

const COLUMNS: &str = "transfer_process_id, agreement_id, asset_id, provider_id, \
    contract_negotiation_id, state, error_detail, expiration_timestamp, created_at, \
    last_modified, edr_json";

const LIVE_STATES: &str = "('NEGOTIATED', 'REFRESHING', 'ERROR')";

/// Build a `WHERE` clause for `filter`. Binds are returned in placeholder order.
pub(crate) fn filter_clause(filter: &EdrFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut binds = Vec::new();

    let columns = [
        ("asset_id", &filter.asset_id),
        ("agreement_id", &filter.agreement_id),
        ("provider_id", &filter.provider_id),
        ("contract_negotiation_id", &filter.contract_negotiation_id),
    ];
    for (column, value) in columns {
        if let Some(value) = value {
            conditions.push(format!("{column} = ?"));
            binds.push(value.clone());
        }
    }
    if let Some(state) = filter.state {
        conditions.push("state = ?".to_string());
        binds.push(state.as_str().to_string());
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (clause, binds)
}

/// Transactional operations for EDR entries.
///
/// These methods operate within an existing transaction and do NOT commit.
/// The caller is responsible for committing or rolling back the transaction.
pub struct EdrTxOps;

impl EdrTxOps {
    pub async fn find_by_id(
        tx: &mut SqliteConnection,
        transfer_process_id: &str,
    ) -> Result<Option<EdrEntryDbModel>> {
        let row = sqlx::query_as::<_, EdrEntryDbModel>(&format!(
            "SELECT {COLUMNS} FROM edr_entries WHERE transfer_process_id = ?"
        ))
        .bind(transfer_process_id)
        .fetch_optional(tx)
        .await?;

        Ok(row)
    }

    /// Matching rows in creation order, optionally paged.
    pub async fn select(
        tx: &mut SqliteConnection,
        filter: &EdrFilter,
        page: Option<(u32, u32)>,
    ) -> Result<Vec<EdrEntryDbModel>> {
        let (clause, binds) = filter_clause(filter);
        let mut sql = format!(
            "SELECT {COLUMNS} FROM edr_entries {clause} ORDER BY created_at ASC, rowid ASC"
        );
        if page.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query_as::<_, EdrEntryDbModel>(&sql);
        for value in &binds {
            query = query.bind(value);
        }
        if let Some((offset, limit)) = page {
            query = query.bind(i64::from(limit)).bind(i64::from(offset));
        }

        Ok(query.fetch_all(tx).await?)
    }

    pub async fn count(tx: &mut SqliteConnection, filter: &EdrFilter) -> Result<i64> {
        let (clause, binds) = filter_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM edr_entries {clause}");

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in &binds {
            query = query.bind(value);
        }

        Ok(query.fetch_one(tx).await?)
    }

    /// Live rows for an asset, optionally restricted to a provider.
    pub async fn live_for_asset(
        tx: &mut SqliteConnection,
        asset_id: &str,
        provider_id: Option<&str>,
    ) -> Result<Vec<EdrEntryDbModel>> {
        let rows = sqlx::query_as::<_, EdrEntryDbModel>(&format!(
            "SELECT {COLUMNS} FROM edr_entries \
             WHERE asset_id = ? AND (? IS NULL OR provider_id = ?) AND state IN {LIVE_STATES} \
             ORDER BY created_at ASC, rowid ASC"
        ))
        .bind(asset_id)
        .bind(provider_id)
        .bind(provider_id)
        .fetch_all(tx)
        .await?;

        Ok(rows)
    }

    /// Expire every other live row sharing the `(asset_id, agreement_id)` pair.
    pub async fn supersede(
        tx: &mut SqliteConnection,
        model: &EdrEntryDbModel,
        now: i64,
    ) -> Result<Vec<String>> {
        let mut ids: Vec<String> = sqlx::query(&format!(
            "UPDATE edr_entries SET state = 'EXPIRED', error_detail = NULL, last_modified = ? \
             WHERE asset_id = ? AND agreement_id = ? AND transfer_process_id != ? \
             AND state IN {LIVE_STATES} \
             RETURNING transfer_process_id"
        ))
        .bind(now)
        .bind(&model.asset_id)
        .bind(&model.agreement_id)
        .bind(&model.transfer_process_id)
        .fetch_all(tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("transfer_process_id"))
        .collect();

        ids.sort();
        Ok(ids)
    }

    /// Insert or replace a row, keeping the original `created_at`.
    pub async fn upsert(tx: &mut SqliteConnection, model: &EdrEntryDbModel) -> Result<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO edr_entries ({COLUMNS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(transfer_process_id) DO UPDATE SET
                agreement_id = excluded.agreement_id,
                asset_id = excluded.asset_id,
                provider_id = excluded.provider_id,
                contract_negotiation_id = excluded.contract_negotiation_id,
                state = excluded.state,
                error_detail = excluded.error_detail,
                expiration_timestamp = excluded.expiration_timestamp,
                last_modified = excluded.last_modified,
                edr_json = excluded.edr_json
            "#
        ))
        .bind(&model.transfer_process_id)
        .bind(&model.agreement_id)
        .bind(&model.asset_id)
        .bind(&model.provider_id)
        .bind(&model.contract_negotiation_id)
        .bind(&model.state)
        .bind(&model.error_detail)
        .bind(model.expiration_timestamp)
        .bind(model.created_at)
        .bind(model.last_modified)
        .bind(&model.edr_json)
        .execute(tx)
        .await?;

        Ok(())
    }

    /// Compare-and-swap on `state` as a single `UPDATE ... WHERE state = ?`.
    pub async fn compare_and_set(
        tx: &mut SqliteConnection,
        transfer_process_id: &str,
        expected: EdrState,
        target: EdrState,
        detail: Option<&str>,
        now: i64,
    ) -> Result<EdrEntryDbModel> {
        expected.transition_to(target)?;
        let detail = if target == EdrState::Error { detail } else { None };

        let updated = sqlx::query_as::<_, EdrEntryDbModel>(&format!(
            "UPDATE edr_entries SET state = ?, error_detail = ?, last_modified = ? \
             WHERE transfer_process_id = ? AND state = ? \
             RETURNING {COLUMNS}"
        ))
        .bind(target.as_str())
        .bind(detail)
        .bind(now)
        .bind(transfer_process_id)
        .bind(expected.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => Ok(row),
            None => Err(Self::miss(tx, transfer_process_id, expected).await),
        }
    }

    /// Claim a refresh, guarded on both `state` and the observed expiry.
    pub async fn start_refresh(
        tx: &mut SqliteConnection,
        transfer_process_id: &str,
        expected: EdrState,
        observed_expiration: i64,
        now: i64,
    ) -> Result<EdrEntryDbModel> {
        expected.transition_to(EdrState::Refreshing)?;

        let updated = sqlx::query_as::<_, EdrEntryDbModel>(&format!(
            "UPDATE edr_entries SET state = 'REFRESHING', error_detail = NULL, last_modified = ? \
             WHERE transfer_process_id = ? AND state = ? AND expiration_timestamp = ? \
             RETURNING {COLUMNS}"
        ))
        .bind(now)
        .bind(transfer_process_id)
        .bind(expected.as_str())
        .bind(observed_expiration)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => Ok(row),
            None => Err(Self::miss(tx, transfer_process_id, expected).await),
        }
    }

    /// Store a refreshed credential, guarded on `state = 'REFRESHING'`.
    pub async fn complete_refresh(
        tx: &mut SqliteConnection,
        transfer_process_id: &str,
        edr_json: &str,
        expiration_timestamp: i64,
        now: i64,
    ) -> Result<EdrEntryDbModel> {
        let updated = sqlx::query_as::<_, EdrEntryDbModel>(&format!(
            "UPDATE edr_entries SET state = 'NEGOTIATED', error_detail = NULL, \
             expiration_timestamp = ?, edr_json = ?, last_modified = ? \
             WHERE transfer_process_id = ? AND state = 'REFRESHING' \
             RETURNING {COLUMNS}"
        ))
        .bind(expiration_timestamp)
        .bind(edr_json)
        .bind(now)
        .bind(transfer_process_id)
        .fetch_optional(&mut *tx)
        .await?;

        match updated {
            Some(row) => Ok(row),
            None => Err(Self::miss(tx, transfer_process_id, EdrState::Refreshing).await),
        }
    }

    /// Explain why a guarded update matched no row.
    async fn miss(tx: &mut SqliteConnection, transfer_process_id: &str, expected: EdrState) -> Error {
        let current: Option<String> =
            match sqlx::query_scalar::<_, String>("SELECT state FROM edr_entries WHERE transfer_process_id = ?")
                .bind(transfer_process_id)
                .fetch_optional(tx)
                .await
            {
                Ok(state) => state,
                Err(e) => return e.into(),
            };

        match current.as_deref().map(EdrState::parse) {
            None => Error::not_found("EDR", transfer_process_id),
            Some(Some(actual)) => state_conflict(transfer_process_id, expected, actual),
            Some(None) => Error::Database(format!(
                "edr_entries.state has unknown value for {transfer_process_id}"
            )),
        }
    }

    pub async fn delete(tx: &mut SqliteConnection, transfer_process_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM edr_entries WHERE transfer_process_id = ?")
            .bind(transfer_process_id)
            .execute(tx)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn recover_stale_refreshes(
        tx: &mut SqliteConnection,
        older_than_ms: i64,
        detail: &str,
        now: i64,
    ) -> Result<Vec<String>> {
        let mut ids: Vec<String> = sqlx::query(
            "UPDATE edr_entries SET state = 'ERROR', error_detail = ?, last_modified = ? \
             WHERE state = 'REFRESHING' AND last_modified < ? \
             RETURNING transfer_process_id",
        )
        .bind(detail)
        .bind(now)
        .bind(older_than_ms)
        .fetch_all(tx)
        .await?
        .into_iter()
        .map(|row| row.get::<String, _>("transfer_process_id"))
        .collect();

        ids.sort();
        Ok(ids)
    }

    pub async fn purge_expired(tx: &mut SqliteConnection, older_than_ms: i64) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM edr_entries WHERE state = 'EXPIRED' AND last_modified < ?")
                .bind(older_than_ms)
                .execute(tx)
                .await?;

        Ok(result.rows_affected())
    }
}
