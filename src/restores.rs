use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::BacksmithError;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RestoreTarget {
    /// Prepared data is copied back into the live data directory.
    Database,
    /// Prepared data stays in the staging directory.
    Folder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restore {
    pub id: i64,
    pub backup_id: String,
    pub backup_timestamp: Option<i64>,
    pub target: RestoreTarget,
    pub target_path: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub process_id: i64,
}

const RESTORE_COLUMNS: &str =
    "id, backup_id, backup_timestamp, target, target_path, start_time, end_time, process_id";

impl Restore {
    /// Insert a restore row for `restore.process_id` unless one exists.
    /// The `id` field of the argument is ignored. Returns `true` if written.
    pub fn create(conn: &Connection, restore: &Restore) -> Result<bool, BacksmithError> {
        let rows = conn.execute(
            "INSERT OR IGNORE INTO restores
                (backup_id, backup_timestamp, target, target_path, start_time, end_time, process_id)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                restore.backup_id,
                restore.backup_timestamp,
                restore.target.as_ref(),
                restore.target_path,
                restore.start_time,
                restore.end_time,
                restore.process_id,
            ],
        )?;

        Ok(rows == 1)
    }

    pub fn get_by_process_id(
        conn: &Connection,
        process_id: i64,
    ) -> Result<Option<Restore>, BacksmithError> {
        conn.query_row(
            &format!("SELECT {} FROM restores WHERE process_id = ?", RESTORE_COLUMNS),
            [process_id],
            Self::from_row,
        )
        .optional()
        .map_err(BacksmithError::DatabaseError)
    }

    #[cfg(test)]
    pub fn list_all(conn: &Connection) -> Result<Vec<Restore>, BacksmithError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM restores ORDER BY start_time DESC, id DESC",
            RESTORE_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::from_row)?;
        let results: Result<Vec<_>, _> = rows.collect();
        results.map_err(BacksmithError::DatabaseError)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Restore> {
        let target: String = row.get(3)?;
        Ok(Restore {
            id: row.get(0)?,
            backup_id: row.get(1)?,
            backup_timestamp: row.get(2)?,
            target: RestoreTarget::from_str(&target).map_err(|_| {
                rusqlite::Error::InvalidColumnType(3, "target".to_string(), rusqlite::types::Type::Text)
            })?,
            target_path: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
            process_id: row.get(7)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_database;
    use crate::processes::{NewProcess, Process, ProcessArgs, ProcessType};

    fn restore_process(conn: &Connection) -> Process {
        Process::create(
            conn,
            &NewProcess {
                command_id: "restore-1".into(),
                command: "cp -a".into(),
                pid: None,
                process_type: ProcessType::Restore,
                args: ProcessArgs::new(),
                start_time: 10,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_create_once_per_process() {
        let (_dir, db) = temp_database();
        let conn = db.get_connection().unwrap();
        let process = restore_process(&conn);

        let restore = Restore {
            id: 0,
            backup_id: "full-1".into(),
            backup_timestamp: Some(5),
            target: RestoreTarget::Folder,
            target_path: "/var/lib/backsmith/restore/x".into(),
            start_time: 10,
            end_time: Some(20),
            process_id: process.id,
        };

        assert!(Restore::create(&conn, &restore).unwrap());
        assert!(!Restore::create(&conn, &restore).unwrap());

        let all = Restore::list_all(&conn).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].target, RestoreTarget::Folder);

        let stored = Restore::get_by_process_id(&conn, process.id).unwrap().unwrap();
        assert_eq!(stored.backup_id, "full-1");
        assert_eq!(stored.backup_timestamp, Some(5));
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!(RestoreTarget::from_str("database").unwrap(), RestoreTarget::Database);
        assert!(RestoreTarget::from_str("tape").is_err());
    }
}
