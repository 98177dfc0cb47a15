use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use strum::{AsRefStr, Display, EnumString};

use crate::error::BacksmithError;

pub type ProcessArgs = Map<String, Value>;

/// Lifecycle state of a process row. A row is inserted as `Running` and
/// flips exactly once to `Success` or `Failed`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Success,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ProcessType {
    Backup,
    Restore,
    Cleanup,
    CronUpdate,
    DirectoryDelete,
}

/// Values needed to insert a process row.
#[derive(Debug, Clone)]
pub struct NewProcess {
    pub command_id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub process_type: ProcessType,
    pub args: ProcessArgs,
    pub start_time: i64,
}

/// Terminal outcome written by the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub status: ProcessStatus,
    pub output: String,
    pub error: String,
    pub return_code: i32,
    pub end_time: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub id: i64,
    pub command_id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub output: String,
    pub error: String,
    pub return_code: Option<i32>,
    pub start_time: i64,
    pub end_time: Option<i64>,
    #[serde(rename = "type")]
    pub process_type: ProcessType,
    pub args: ProcessArgs,
}

const PROCESS_COLUMNS: &str = "id, command_id, command, pid, status, output, error, return_code,
    start_time, end_time, type, args";

impl Process {
    pub fn create(conn: &Connection, new: &NewProcess) -> Result<Process, BacksmithError> {
        let args_json = serde_json::to_string(&new.args)?;

        let id: i64 = conn.query_row(
            "INSERT INTO processes (command_id, command, pid, status, start_time, type, args)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
            params![
                new.command_id,
                new.command,
                new.pid,
                ProcessStatus::Running.as_ref(),
                new.start_time,
                new.process_type.as_ref(),
                args_json,
            ],
            |row| row.get(0),
        )?;

        Ok(Process {
            id,
            command_id: new.command_id.clone(),
            command: new.command.clone(),
            pid: new.pid,
            status: ProcessStatus::Running,
            output: String::new(),
            error: String::new(),
            return_code: None,
            start_time: new.start_time,
            end_time: None,
            process_type: new.process_type,
            args: new.args.clone(),
        })
    }

    /// Insert a row that is already terminal. Used when the OS refused to
    /// spawn the command, and for in-process operations.
    pub fn create_terminal(
        conn: &Connection,
        new: &NewProcess,
        outcome: &ProcessOutcome,
    ) -> Result<Process, BacksmithError> {
        let running = Self::create(conn, new)?;
        Self::complete(conn, running.id, outcome)
    }

    pub fn set_pid(conn: &Connection, id: i64, pid: u32) -> Result<(), BacksmithError> {
        conn.execute("UPDATE processes SET pid = ? WHERE id = ?", params![pid, id])?;
        Ok(())
    }

    /// Apply the single running → terminal transition. Fails if the row is
    /// missing or already terminal.
    pub fn complete(
        conn: &Connection,
        id: i64,
        outcome: &ProcessOutcome,
    ) -> Result<Process, BacksmithError> {
        if !outcome.status.is_terminal() {
            return Err(BacksmithError::Error(format!(
                "Process {} cannot complete with status '{}'",
                id, outcome.status
            )));
        }

        let rows = conn.execute(
            "UPDATE processes
             SET status = ?, output = ?, error = ?, return_code = ?, end_time = ?
             WHERE id = ? AND status = ?",
            params![
                outcome.status.as_ref(),
                outcome.output,
                outcome.error,
                outcome.return_code,
                outcome.end_time,
                id,
                ProcessStatus::Running.as_ref(),
            ],
        )?;

        if rows != 1 {
            return Err(BacksmithError::Error(format!(
                "Process {} is not running; refusing a second transition",
                id
            )));
        }

        Self::get_by_id(conn, id)?
            .ok_or_else(|| BacksmithError::Error(format!("Process {} vanished", id)))
    }

    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Process>, BacksmithError> {
        conn.query_row(
            &format!("SELECT {} FROM processes WHERE id = ?", PROCESS_COLUMNS),
            [id],
            Self::from_row,
        )
        .optional()
        .map_err(BacksmithError::DatabaseError)
    }

    /// Latest row for a command id. For multi-step commands this is the step
    /// that ran last, which carries the overall outcome.
    pub fn get_by_command_id(
        conn: &Connection,
        command_id: &str,
    ) -> Result<Option<Process>, BacksmithError> {
        conn.query_row(
            &format!(
                "SELECT {} FROM processes WHERE command_id = ? ORDER BY id DESC LIMIT 1",
                PROCESS_COLUMNS
            ),
            [command_id],
            Self::from_row,
        )
        .optional()
        .map_err(BacksmithError::DatabaseError)
    }

    pub fn list_by_command_id(
        conn: &Connection,
        command_id: &str,
    ) -> Result<Vec<Process>, BacksmithError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM processes WHERE command_id = ? ORDER BY id ASC",
            PROCESS_COLUMNS
        ))?;

        let rows = stmt.query_map([command_id], Self::from_row)?;
        let results: Result<Vec<_>, _> = rows.collect();
        results.map_err(BacksmithError::DatabaseError)
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        self.args.get(key).and_then(Value::as_i64)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Process> {
        let status: String = row.get(4)?;
        let process_type: String = row.get(10)?;
        let args: String = row.get(11)?;

        Ok(Process {
            id: row.get(0)?,
            command_id: row.get(1)?,
            command: row.get(2)?,
            pid: row.get(3)?,
            status: ProcessStatus::from_str(&status).map_err(|_| {
                rusqlite::Error::InvalidColumnType(4, "status".to_string(), rusqlite::types::Type::Text)
            })?,
            output: row.get(5)?,
            error: row.get(6)?,
            return_code: row.get(7)?,
            start_time: row.get(8)?,
            end_time: row.get(9)?,
            process_type: ProcessType::from_str(&process_type).map_err(|_| {
                rusqlite::Error::InvalidColumnType(10, "type".to_string(), rusqlite::types::Type::Text)
            })?,
            args: serde_json::from_str(&args).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(11, rusqlite::types::Type::Text, Box::new(e))
            })?,
        })
    }
}
