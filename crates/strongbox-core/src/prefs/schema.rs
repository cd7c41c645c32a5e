use rusqlite::Connection;

use crate::error::Result;

/// Run all migrations on the database.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA journal_mode=WAL;

        CREATE TABLE IF NOT EXISTS backup_options (
            option          TEXT PRIMARY KEY,
            enabled         INTEGER NOT NULL DEFAULT 0,
            last_success    TEXT,
            last_failure    TEXT,
            failure_cause   TEXT,
            updated_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS backup_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            option      TEXT NOT NULL,
            level       TEXT NOT NULL,
            message     TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_backup_logs_option ON backup_logs(option);
        ",
    )?;
    Ok(())
}
