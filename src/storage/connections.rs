//! Data connections. The password column is always written through the
//! field codec, so the database only ever holds the tagged encoding.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use zeroize::Zeroizing;

use super::Pool;
use crate::crypto::field::PREFIX;
use crate::crypto::{EncryptedField, FieldValue, StoredValue};
use crate::report::DataConnection;

const COLUMNS: &str = "id, drivername, dialect, username, password, host, port, database_name";

fn encode_password(codec: &EncryptedField, conn: &DataConnection) -> Result<Option<String>> {
    conn.password
        .as_ref()
        .filter(|p| !p.is_empty())
        .map(|p| {
            codec
                .to_storage(&FieldValue::Plain(p.clone()))
                .map(|stored| stored.into_inner())
                .context("Failed to encrypt password")
        })
        .transpose()
}

/// Insert a connection, encrypting its password. Returns the new id.
pub fn insert(pool: &Pool, codec: &EncryptedField, conn: &DataConnection) -> Result<i64> {
    conn.validate()?;
    let password = encode_password(codec, conn)?;

    let db = pool.get()?;
    db.execute(
        "INSERT INTO data_connections (drivername, dialect, username, password, host, port, database_name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            conn.drivername,
            conn.dialect,
            conn.username,
            password,
            conn.host,
            conn.port,
            conn.database,
        ],
    )
    .context("Failed to insert data connection")?;
    Ok(db.last_insert_rowid())
}

/// What [`update`] does with the stored password.
#[derive(Debug, Clone)]
pub enum PasswordChange {
    /// Leave the stored value exactly as it is on disk.
    Keep,
    /// Encrypt and store a new password. An empty one clears it.
    Set(Zeroizing<String>),
    Clear,
}

/// Re-save a loaded connection's fields. A kept password goes back through
/// the codec as the value already on disk, so it is never encrypted twice.
pub fn update(
    pool: &Pool,
    codec: &EncryptedField,
    conn: &DataConnection,
    password: PasswordChange,
) -> Result<()> {
    conn.validate()?;

    let mut db = pool.get()?;
    let tx = db.transaction()?;
    let current: Option<Option<String>> = tx
        .query_row(
            "SELECT password FROM data_connections WHERE id = ?1",
            params![conn.id],
            |row| row.get(0),
        )
        .optional()?;
    let Some(current) = current else {
        anyhow::bail!("Data connection {} not found", conn.id);
    };

    let value = match password {
        PasswordChange::Keep => current.map(|raw| FieldValue::Stored(StoredValue::from_db(raw))),
        PasswordChange::Set(p) if !p.is_empty() => Some(FieldValue::Plain(p)),
        PasswordChange::Set(_) | PasswordChange::Clear => None,
    };
    let stored = value
        .map(|v| codec.to_storage(&v).map(StoredValue::into_inner))
        .transpose()
        .context("Failed to encrypt password")?;

    tx.execute(
        "UPDATE data_connections
         SET drivername = ?2, dialect = ?3, username = ?4, password = ?5, host = ?6,
             port = ?7, database_name = ?8, updated_at = datetime('now')
         WHERE id = ?1",
        params![
            conn.id,
            conn.drivername,
            conn.dialect,
            conn.username,
            stored,
            conn.host,
            conn.port,
            conn.database,
        ],
    )
    .context("Failed to update data connection")?;
    tx.commit()?;
    Ok(())
}

struct RawConnection {
    id: i64,
    drivername: String,
    dialect: Option<String>,
    username: Option<String>,
    password: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    database: String,
}

impl RawConnection {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            drivername: row.get(1)?,
            dialect: row.get(2)?,
            username: row.get(3)?,
            password: row.get(4)?,
            host: row.get(5)?,
            port: row.get(6)?,
            database: row.get(7)?,
        })
    }

    fn decode(self, codec: &EncryptedField) -> Result<DataConnection> {
        let password = match self.password.as_deref() {
            Some(stored) => Some(
                codec
                    .from_storage(stored)
                    .with_context(|| format!("Failed to decrypt password of connection {}", self.id))?,
            ),
            None => None,
        };

        Ok(DataConnection {
            id: self.id,
            drivername: self.drivername,
            dialect: self.dialect,
            username: self.username,
            password,
            host: self.host,
            port: self.port,
            database: self.database,
        })
    }
}

/// Load and decrypt one connection.
pub fn get(pool: &Pool, codec: &EncryptedField, id: i64) -> Result<Option<DataConnection>> {
    let db = pool.get()?;
    let raw = db
        .query_row(
            &format!("SELECT {} FROM data_connections WHERE id = ?1", COLUMNS),
            params![id],
            RawConnection::from_row,
        )
        .optional()?;
    raw.map(|r| r.decode(codec)).transpose()
}

/// Load and decrypt every connection.
pub fn list(pool: &Pool, codec: &EncryptedField) -> Result<Vec<DataConnection>> {
    let db = pool.get()?;
    let mut stmt = db.prepare(&format!("SELECT {} FROM data_connections ORDER BY id", COLUMNS))?;
    let rows = stmt.query_map([], RawConnection::from_row)?;

    let mut list = Vec::new();
    for r in rows {
        list.push(r?.decode(codec)?);
    }
    Ok(list)
}

/// Encrypt any password still stored in plaintext (e.g. rows written
/// before encryption was enabled). Returns the number of rows rewritten.
pub fn encrypt_plaintext_passwords(pool: &Pool, codec: &EncryptedField) -> Result<usize> {
    let mut db = pool.get()?;
    let tx = db.transaction()?;

    let pending: Vec<(i64, Zeroizing<String>)> = {
        let mut stmt = tx.prepare(
            "SELECT id, password FROM data_connections WHERE password IS NOT NULL AND password != ''",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, Zeroizing::new(row.get::<_, String>(1)?)))
        })?;
        let mut out = Vec::new();
        for r in rows {
            let (id, pw) = r?;
            if !pw.starts_with(PREFIX) {
                out.push((id, pw));
            }
        }
        out
    };

    for (id, pw) in &pending {
        let stored = codec
            .to_storage(&FieldValue::Plain(pw.clone()))
            .with_context(|| format!("Failed to encrypt password of connection {}", id))?;
        tx.execute(
            "UPDATE data_connections SET password = ?2, updated_at = datetime('now') WHERE id = ?1",
            params![id, stored.as_ref()],
        )?;
    }

    tx.commit()?;
    Ok(pending.len())
}
