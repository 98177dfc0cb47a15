use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::BacksmithError;

/// Derived from `from_backup_id`; never stored.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub from_backup_id: Option<String>,
    pub schedule_id: Option<i64>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub process_id: Option<i64>,
    pub size: Option<i64>,
}

const BACKUP_COLUMNS: &str =
    "id, from_backup_id, schedule_id, start_time, end_time, process_id, size";

impl Backup {
    pub fn backup_type(&self) -> BackupType {
        match self.from_backup_id {
            None => BackupType::Full,
            Some(_) => BackupType::Incremental,
        }
    }

    /// Insert the row unless a backup with the same id already exists.
    /// Returns `true` if a row was written.
    pub fn create(conn: &Connection, backup: &Backup) -> Result<bool, BacksmithError> {
        let rows = conn.execute(
            "INSERT OR IGNORE INTO backups
                (id, from_backup_id, schedule_id, start_time, end_time, process_id, size)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                backup.id,
                backup.from_backup_id,
                backup.schedule_id,
                backup.start_time,
                backup.end_time,
                backup.process_id,
                backup.size,
            ],
        )?;

        Ok(rows == 1)
    }

    pub fn get_by_id(conn: &Connection, id: &str) -> Result<Option<Backup>, BacksmithError> {
        conn.query_row(
            &format!("SELECT {} FROM backups WHERE id = ?", BACKUP_COLUMNS),
            [id],
            Self::from_row,
        )
        .optional()
        .map_err(BacksmithError::DatabaseError)
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Backup>, BacksmithError> {
        Self::query_list(
            conn,
            &format!(
                "SELECT {} FROM backups ORDER BY start_time ASC, id ASC",
                BACKUP_COLUMNS
            ),
            params![],
        )
    }

    /// Most recent backup of a schedule, the parent for its next incremental.
    pub fn latest_for_schedule(
        conn: &Connection,
        schedule_id: i64,
    ) -> Result<Option<Backup>, BacksmithError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM backups WHERE schedule_id = ?
                 ORDER BY start_time DESC, id DESC LIMIT 1",
                BACKUP_COLUMNS
            ),
            [schedule_id],
            Self::from_row,
        )
        .optional()
        .map_err(BacksmithError::DatabaseError)
    }

    /// Delete the given rows. Children must be listed before their parents
    /// or be absent; the foreign key on `from_backup_id` is enforced.
    /// Must be called inside a transaction when deleting more than one row.
    pub fn delete_many(conn: &Connection, ids: &[String]) -> Result<usize, BacksmithError> {
        let mut deleted = 0;
        for id in ids {
            deleted += conn.execute("DELETE FROM backups WHERE id = ?", [id])?;
        }
        Ok(deleted)
    }

    fn query_list(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Backup>, BacksmithError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::from_row)?;
        let results: Result<Vec<_>, _> = rows.collect();
        results.map_err(BacksmithError::DatabaseError)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Backup> {
        Ok(Backup {
            id: row.get(0)?,
            from_backup_id: row.get(1)?,
            schedule_id: row.get(2)?,
            start_time: row.get(3)?,
            end_time: row.get(4)?,
            process_id: row.get(5)?,
            size: row.get(6)?,
        })
    }
}
