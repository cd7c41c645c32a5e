use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::error::{FailureCause, RecommendedAction, Result};
use crate::types::{BackupOption, BackupState};

/// Persisted status of one backup option.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionPrefs {
    pub option: BackupOption,
    pub enabled: bool,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub failure_cause: Option<FailureCause>,
}

impl OptionPrefs {
    fn empty(option: BackupOption) -> Self {
        Self {
            option,
            enabled: false,
            last_success: None,
            last_failure: None,
            failure_cause: None,
        }
    }

    /// State to publish when a coordinator starts up.
    pub fn initial_state(&self) -> BackupState {
        if !self.enabled {
            return BackupState::Disabled;
        }
        let failed_last = match (self.last_failure, self.last_success) {
            (Some(failure), Some(success)) => failure > success,
            (Some(_), None) => true,
            _ => false,
        };
        if failed_last {
            let cause = self.failure_cause.clone().unwrap_or_else(|| {
                FailureCause::new("Last backup failed", RecommendedAction::Retry)
            });
            return BackupState::Failed(cause);
        }
        match self.last_success {
            Some(at) => BackupState::UpToDate(at),
            None => BackupState::Scheduled,
        }
    }
}

/// SQLite-backed backup preferences, shared between option workers.
pub struct PrefsStore {
    conn: Mutex<Connection>,
}

impl PrefsStore {
    /// Open (or create) the preferences database and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        super::schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        super::schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn load(&self, option: BackupOption) -> Result<OptionPrefs> {
        let conn = self.conn();
        let row = conn
            .query_row(
                "SELECT enabled, last_success, last_failure, failure_cause FROM backup_options WHERE option=?1",
                params![option.to_string()],
                |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((enabled, success, failure, cause)) = row else {
            return Ok(OptionPrefs::empty(option));
        };
        Ok(OptionPrefs {
            option,
            enabled,
            last_success: success.as_deref().and_then(parse_timestamp),
            last_failure: failure.as_deref().and_then(parse_timestamp),
            failure_cause: cause.and_then(|json| serde_json::from_str(&json).ok()),
        })
    }

    pub fn set_enabled(&self, option: BackupOption, enabled: bool) -> Result<()> {
        self.conn().execute(
            "INSERT INTO backup_options (option, enabled) VALUES (?1, ?2)
             ON CONFLICT(option) DO UPDATE SET enabled=excluded.enabled, updated_at=datetime('now')",
            params![option.to_string(), enabled],
        )?;
        Ok(())
    }

    pub fn record_success(&self, option: BackupOption, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO backup_options (option, enabled, last_success) VALUES (?1, 1, ?2)
             ON CONFLICT(option) DO UPDATE SET last_success=excluded.last_success, updated_at=datetime('now')",
            params![option.to_string(), at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn record_failure(
        &self,
        option: BackupOption,
        at: DateTime<Utc>,
        cause: &FailureCause,
    ) -> Result<()> {
        let cause_json = serde_json::to_string(cause).unwrap_or_else(|_| cause.message.clone());
        self.conn().execute(
            "INSERT INTO backup_options (option, enabled, last_failure, failure_cause) VALUES (?1, 1, ?2, ?3)
             ON CONFLICT(option) DO UPDATE SET last_failure=excluded.last_failure,
                 failure_cause=excluded.failure_cause, updated_at=datetime('now')",
            params![option.to_string(), at.to_rfc3339(), cause_json],
        )?;
        Ok(())
    }

    // ── Logs ───────────────────────────────────────────────────

    pub fn log(&self, option: BackupOption, level: &str, message: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO backup_logs (option, level, message) VALUES (?1, ?2, ?3)",
            params![option.to_string(), level, message],
        )?;
        Ok(())
    }

    /// Most recent log lines for `option`, newest first.
    pub fn recent_logs(&self, option: BackupOption, limit: u32) -> Result<Vec<(String, String)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT level, message FROM backup_logs WHERE option=?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![option.to_string(), limit], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        Ok(rows.filter_map(|r| r.ok()).collect())
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
