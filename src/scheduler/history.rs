//! Delivery history: one row per due or forced attempt.

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use chrono::NaiveDateTime;
use rusqlite::params;

use crate::domain::ValidationError;
use crate::storage::{fmt_ts, parse_ts, Pool};

/// A record of one delivery attempt.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub subscription_id: i64,
    pub status: RunStatus,
    pub forced: bool,
    pub result_summary: Option<String>,
    pub started_at: NaiveDateTime,
    pub finished_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum RunStatus {
    Sent,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Sent => "Sent",
            RunStatus::Failed => "Failed",
        })
    }
}

impl FromStr for RunStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Sent" => Ok(RunStatus::Sent),
            "Failed" => Ok(RunStatus::Failed),
            _ => Err(ValidationError::UnknownVariant {
                kind: "run status",
                value: s.to_string(),
            }),
        }
    }
}

pub fn record(pool: &Pool, entry: &HistoryEntry) -> Result<()> {
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO delivery_history
             (subscription_id, status, forced, result_summary, started_at, finished_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            entry.subscription_id,
            entry.status.to_string(),
            entry.forced as i64,
            entry.result_summary,
            fmt_ts(entry.started_at),
            entry.finished_at.map(fmt_ts),
        ],
    )?;
    Ok(())
}

/// Most recent entries first, optionally for a single subscription.
pub fn recent(pool: &Pool, subscription_id: Option<i64>, limit: usize) -> Result<Vec<HistoryEntry>> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT subscription_id, status, forced, result_summary, started_at, finished_at
         FROM delivery_history
         WHERE ?1 IS NULL OR subscription_id = ?1
         ORDER BY id DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![subscription_id, limit as i64], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)? != 0,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, Option<String>>(5)?,
        ))
    })?;

    let mut entries = Vec::new();
    for r in rows {
        let (subscription_id, status, forced, result_summary, started_at, finished_at) = r?;
        entries.push(HistoryEntry {
            subscription_id,
            status: status.parse()?,
            forced,
            result_summary,
            started_at: parse_ts(&started_at)?,
            finished_at: finished_at.as_deref().map(parse_ts).transpose()?,
        });
    }
    Ok(entries)
}
