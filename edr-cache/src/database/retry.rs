//! Busy-retry for SQLite writes.
//!
//! Several connector processes may share one database file, so a write can
//! hit `SQLITE_BUSY` even with a single-connection write pool.

use rand::random;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::{Error, Result};

const BUSY_MAX_RETRIES: u32 = 12;
const BUSY_BASE_DELAY_MS: u64 = 10;
const BUSY_MAX_DELAY_MS: u64 = 2000;

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), or their textual forms.
fn is_busy(err: &Error) -> bool {
    let Error::DatabaseSqlx(sqlx_err) = err else {
        return false;
    };

    let message = match sqlx_err {
        sqlx::Error::Database(db_err) => {
            if matches!(
                db_err.code().map(Cow::into_owned).as_deref(),
                Some("5") | Some("6")
            ) {
                return true;
            }
            db_err.message().to_ascii_lowercase()
        }
        other => other.to_string().to_ascii_lowercase(),
    };

    message.contains("database is locked") || message.contains("database is busy")
}

/// Backoff for the given zero-based attempt: exponential, capped, with jitter.
fn backoff(attempt: u32) -> Duration {
    let exp = BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(20));
    let capped = exp.min(BUSY_MAX_DELAY_MS);
    let jitter = random::<u64>() % (capped / 4 + 1);
    Duration::from_millis((capped + jitter).min(BUSY_MAX_DELAY_MS))
}

/// Run `op` until it succeeds or fails with something other than a busy error.
pub async fn retry_on_sqlite_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if is_busy(&err) && attempt < BUSY_MAX_RETRIES => {
                let delay = backoff(attempt);
                attempt += 1;
                debug!(
                    op = op_name,
                    attempt,
                    max = BUSY_MAX_RETRIES,
                    delay_ms = delay.as_millis() as u64,
                    "SQLite busy, retrying"
                );
                sleep(delay).await;
            }
            result => return result,
        }
    }
}
