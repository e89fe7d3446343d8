//! Database schema and migrations.

use anyhow::Result;
use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS data_connections (
            id INTEGER PRIMARY KEY,
            drivername TEXT NOT NULL,
            dialect TEXT,
            username TEXT,
            password TEXT,
            host TEXT,
            port INTEGER,
            database_name TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS reports (
            id INTEGER PRIMARY KEY,
            title TEXT NOT NULL,
            byline TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS parameters (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL DEFAULT '',
            data_type TEXT NOT NULL,
            default_expr TEXT,
            required INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS report_parameters (
            report_id INTEGER NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
            parameter_id INTEGER NOT NULL REFERENCES parameters(id) ON DELETE CASCADE,
            order_on_form INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (report_id, parameter_id)
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY,
            report_id INTEGER NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
            recipient TEXT NOT NULL,
            recurrence TEXT NOT NULL,
            time_of_day TEXT NOT NULL,
            start_date TEXT NOT NULL,
            report_parameters TEXT,
            email_subject TEXT NOT NULL DEFAULT '',
            email_body_extra TEXT NOT NULL DEFAULT '',
            last_scheduled_run TEXT,
            last_run_succeeded INTEGER NOT NULL DEFAULT 0,
            lock_holder TEXT,
            locked_until INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS delivery_history (
            id INTEGER PRIMARY KEY,
            subscription_id INTEGER NOT NULL REFERENCES subscriptions(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            forced INTEGER NOT NULL DEFAULT 0,
            result_summary TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_report_parameters_report ON report_parameters(report_id);
        CREATE INDEX IF NOT EXISTS idx_subscriptions_report ON subscriptions(report_id);
        CREATE INDEX IF NOT EXISTS idx_delivery_history_sub ON delivery_history(subscription_id);",
    )?;

    Ok(())
}
