//! Subscription records and the per-row lease that serializes delivery
//! attempts across processes.
//!
//! SQLite has no `SELECT ... FOR UPDATE`. Instead a row is claimed by writing
//! `lock_holder`/`locked_until` inside an `IMMEDIATE` transaction, which
//! takes the database write lock for the few microseconds of the claim. The
//! lease, not the transaction, is held for the slow render/send part, so
//! other subscriptions are never blocked.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::{fmt_date, fmt_time, fmt_ts, parse_date, parse_time, parse_ts, Pool};
use crate::scheduler::{NewSubscription, Subscription};

const COLUMNS: &str = "id, report_id, recipient, recurrence, time_of_day, start_date, \
     last_scheduled_run, last_run_succeeded, report_parameters, email_subject, email_body_extra";

/// Result of trying to claim a subscription's lease.
#[derive(Debug)]
pub enum LockAttempt {
    /// The caller now holds the lease; the record reflects the latest commit.
    Acquired(Subscription),
    /// Another live holder has it.
    Held,
    /// No such subscription.
    Missing,
}

fn from_row(row: &Row<'_>) -> rusqlite::Result<RawSubscription> {
    Ok(RawSubscription {
        id: row.get(0)?,
        report_id: row.get(1)?,
        recipient: row.get(2)?,
        recurrence: row.get(3)?,
        time_of_day: row.get(4)?,
        start_date: row.get(5)?,
        last_scheduled_run: row.get(6)?,
        last_run_succeeded: row.get::<_, i64>(7)? != 0,
        report_parameters: row.get(8)?,
        email_subject: row.get(9)?,
        email_body_extra: row.get(10)?,
    })
}

struct RawSubscription {
    id: i64,
    report_id: i64,
    recipient: String,
    recurrence: String,
    time_of_day: String,
    start_date: String,
    last_scheduled_run: Option<String>,
    last_run_succeeded: bool,
    report_parameters: Option<String>,
    email_subject: String,
    email_body_extra: String,
}

impl TryFrom<RawSubscription> for Subscription {
    type Error = anyhow::Error;

    fn try_from(raw: RawSubscription) -> Result<Self> {
        Ok(Subscription {
            id: raw.id,
            report_id: raw.report_id,
            recipient: raw.recipient.parse()?,
            recurrence: raw.recurrence.parse()?,
            time_of_day: parse_time(&raw.time_of_day)?,
            start_date: parse_date(&raw.start_date)?,
            last_scheduled_run: raw.last_scheduled_run.as_deref().map(parse_ts).transpose()?,
            last_run_succeeded: raw.last_run_succeeded,
            report_parameters: raw.report_parameters.filter(|p| !p.trim().is_empty()),
            email_subject: raw.email_subject,
            email_body_extra: raw.email_body_extra,
        })
    }
}

fn select_one(conn: &Connection, id: i64) -> Result<Option<Subscription>> {
    conn.query_row(
        &format!("SELECT {} FROM subscriptions WHERE id = ?1", COLUMNS),
        params![id],
        from_row,
    )
    .optional()?
    .map(Subscription::try_from)
    .transpose()
    .with_context(|| format!("Subscription {} has invalid stored data", id))
}

/// Validate and insert a subscription. Returns its id.
pub fn insert(pool: &Pool, sub: &NewSubscription) -> Result<i64> {
    sub.validate()?;

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO subscriptions (report_id, recipient, recurrence, time_of_day, start_date,
                                    report_parameters, email_subject, email_body_extra)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            sub.report_id,
            sub.recipient.as_ref(),
            sub.recurrence.to_string(),
            fmt_time(sub.time_of_day),
            fmt_date(sub.start_date),
            sub.report_parameters,
            sub.email_subject,
            sub.email_body_extra,
        ],
    )
    .context("Failed to insert subscription")?;
    Ok(conn.last_insert_rowid())
}

pub fn get(pool: &Pool, id: i64) -> Result<Option<Subscription>> {
    let conn = pool.get()?;
    select_one(&conn, id)
}

pub fn list(pool: &Pool) -> Result<Vec<Subscription>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM subscriptions ORDER BY last_scheduled_run DESC, id",
        COLUMNS
    ))?;
    let rows = stmt.query_map([], from_row)?;

    let mut list = Vec::new();
    for r in rows {
        list.push(Subscription::try_from(r?)?);
    }
    Ok(list)
}

/// Ids of every subscription, in the order the batch driver visits them.
pub fn ids(pool: &Pool) -> Result<Vec<i64>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare("SELECT id FROM subscriptions ORDER BY id")?;
    let ids = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(ids)
}

pub fn remove(pool: &Pool, id: i64) -> Result<()> {
    let conn = pool.get()?;
    let changed = conn.execute("DELETE FROM subscriptions WHERE id = ?1", params![id])?;
    if changed == 0 {
        anyhow::bail!("Subscription {} not found", id);
    }
    Ok(())
}

/// Claim the lease on `id` for `holder` unless someone else holds a live one.
/// The record is read inside the same transaction as the claim.
pub fn try_lock(pool: &Pool, id: i64, holder: &str, lease: Duration) -> Result<LockAttempt> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let now = Utc::now().timestamp();
    let current: Option<(Option<String>, Option<i64>)> = tx
        .query_row(
            "SELECT lock_holder, locked_until FROM subscriptions WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let Some((lock_holder, locked_until)) = current else {
        return Ok(LockAttempt::Missing);
    };
    let live = lock_holder.is_some_and(|h| h != holder) && locked_until.is_some_and(|t| t > now);
    if live {
        return Ok(LockAttempt::Held);
    }

    let until = now + lease.as_secs() as i64;
    tx.execute(
        "UPDATE subscriptions SET lock_holder = ?2, locked_until = ?3 WHERE id = ?1",
        params![id, holder, until],
    )?;
    let sub = select_one(&tx, id)?.ok_or_else(|| anyhow::anyhow!("Subscription {} vanished", id))?;
    tx.commit()?;

    Ok(LockAttempt::Acquired(sub))
}

/// Push `locked_until` out by `lease` from now. Returns `false` when `holder`
/// no longer owns the row.
pub fn renew(pool: &Pool, id: i64, holder: &str, lease: Duration) -> Result<bool> {
    let conn = pool.get()?;
    let until = Utc::now().timestamp() + lease.as_secs() as i64;
    let changed = conn.execute(
        "UPDATE subscriptions SET locked_until = ?3 WHERE id = ?1 AND lock_holder = ?2",
        params![id, holder, until],
    )?;
    Ok(changed > 0)
}

/// Durably record that a delivery is starting, before it is attempted.
/// Returns `false` when `holder` no longer owns the row.
pub fn mark_scheduled(pool: &Pool, id: i64, holder: &str, at: chrono::NaiveDateTime) -> Result<bool> {
    let conn = pool.get()?;
    let changed = conn.execute(
        "UPDATE subscriptions SET last_scheduled_run = ?3, updated_at = datetime('now')
         WHERE id = ?1 AND lock_holder = ?2",
        params![id, holder, fmt_ts(at)],
    )?;
    Ok(changed > 0)
}

/// Record the attempt's outcome and release the lease.
///
/// The outcome is written whoever holds the row now, so the stored flag
/// always matches the attempt that actually ran. The lease is cleared only
/// if `holder` still owns it. Returns whether it did.
pub fn finish(pool: &Pool, id: i64, holder: &str, succeeded: bool) -> Result<bool> {
    let mut conn = pool.get()?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute(
        "UPDATE subscriptions SET last_run_succeeded = ?2, updated_at = datetime('now')
         WHERE id = ?1",
        params![id, succeeded as i64],
    )?;
    let released = tx.execute(
        "UPDATE subscriptions SET lock_holder = NULL, locked_until = NULL
         WHERE id = ?1 AND lock_holder = ?2",
        params![id, holder],
    )?;
    tx.commit()?;
    Ok(released > 0)
}

/// Release the lease without touching the record.
pub fn release(pool: &Pool, id: i64, holder: &str) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "UPDATE subscriptions SET lock_holder = NULL, locked_until = NULL
         WHERE id = ?1 AND lock_holder = ?2",
        params![id, holder],
    )?;
    Ok(())
}
