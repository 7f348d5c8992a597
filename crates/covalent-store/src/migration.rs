//! Database schema migrations for SQLite.
//!
//! Versioned migrations: each version is applied once, inside the same
//! transaction that records it in `schema_migrations`.

use rusqlite::Connection;

use covalent_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Safe to call repeatedly.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database is at version {current}, newer than supported {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis() as i64],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!("unknown migration version: {version}"))),
    }
}

/// Migration v1: values, sessions, transactions and in-between signatures.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue, header as JSON
        CREATE TABLE co_values (
            id TEXT PRIMARY KEY,              -- co_<hex>
            header TEXT NOT NULL,
            stored_at INTEGER NOT NULL
        );

        -- Session heads
        CREATE TABLE sessions (
            co_value TEXT NOT NULL REFERENCES co_values(id),
            session_id TEXT NOT NULL,
            tx_count INTEGER NOT NULL,
            last_signature TEXT NOT NULL,     -- covers transactions 0..tx_count
            PRIMARY KEY (co_value, session_id)
        );

        -- Transactions, CBOR encoded
        CREATE TABLE transactions (
            co_value TEXT NOT NULL,
            session_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            tx BLOB NOT NULL,
            PRIMARY KEY (co_value, session_id, idx)
        );

        -- In-between signatures covering transactions 0..=idx
        CREATE TABLE signature_after (
            co_value TEXT NOT NULL,
            session_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            signature TEXT NOT NULL,
            PRIMARY KEY (co_value, session_id, idx)
        );

        CREATE INDEX idx_sessions_co_value ON sessions(co_value);
        "#,
    )?;

    Ok(())
}
