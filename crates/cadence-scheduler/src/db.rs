use rusqlite::Connection;

use crate::error::Result;

/// Initialise the KV schema in `conn`.
///
/// Creates the `registry_entries` hash table and the `locks` table
/// (idempotent). Several processes may share one database file; each opens
/// its own connection.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS registry_entries (
            collection  TEXT    NOT NULL,
            field       TEXT    NOT NULL,
            value       BLOB    NOT NULL,
            PRIMARY KEY (collection, field)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS locks (
            key            TEXT    NOT NULL PRIMARY KEY,
            token          TEXT    NOT NULL,
            expires_at_ms  INTEGER NOT NULL   -- unix millis, wall clock
        ) STRICT;
        ",
    )?;
    Ok(())
}
