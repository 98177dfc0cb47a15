use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use std::str::FromStr;

use log::debug;

use crate::config::BackupConfig;
use crate::database::Database;
use crate::error::CommandError;
use crate::protocol::{DatabaseCommand, SystemCommand};
use crate::restores::RestoreTarget;
use crate::schedules::{CronSchedule, CronTiming, Schedule};
use crate::utils::Utils;

/// Files a stopped server may leave in its data directory without blocking
/// a copy-back.
const RESIDUAL_NAMES: [&str; 2] = ["auto.cnf", "ib_buffer_pool"];
const RESIDUAL_SUFFIXES: [&str; 5] = [".sock", ".sock.lock", ".pid", ".log", ".err"];

/// Liveness check against the database server.
pub trait ServerProbe: Send + Sync {
    fn is_alive(&self) -> bool;
}

/// `mysqladmin --defaults-file=... ping`. Any failure to run counts as down.
pub struct MysqladminProbe {
    program: String,
    defaults_file: String,
}

impl MysqladminProbe {
    pub fn new(config: &BackupConfig) -> Self {
        MysqladminProbe {
            program: config.probe_command.clone(),
            defaults_file: config.credentials_file.clone(),
        }
    }
}

impl ServerProbe for MysqladminProbe {
    fn is_alive(&self) -> bool {
        Command::new(&self.program)
            .arg(format!("--defaults-file={}", self.defaults_file))
            .arg("ping")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Accepts or rejects a command before anything is executed. Blocking: it
/// reads the filesystem and the store and runs the liveness probe.
pub struct Validator {
    backup: BackupConfig,
    db: Database,
    probe: Box<dyn ServerProbe>,
}

impl Validator {
    pub fn new(backup: BackupConfig, db: Database, probe: Box<dyn ServerProbe>) -> Self {
        Validator { backup, db, probe }
    }

    pub fn validate_database(&self, command: &DatabaseCommand) -> Result<(), CommandError> {
        match command {
            DatabaseCommand::FullBackup { id, schedule_id } => {
                self.validate_backup(id, None, *schedule_id)
            }
            DatabaseCommand::IncrementalBackup {
                id,
                from_backup_id,
                schedule_id,
            } => self.validate_backup(id, Some(from_backup_id), *schedule_id),
            DatabaseCommand::RestoreBackup { id_list, target } => self.validate_restore(id_list, target),
        }
    }

    pub fn validate_system(&self, command: &SystemCommand) -> Result<(), CommandError> {
        match command {
            SystemCommand::UpdateCronSchedules { schedules } => Self::cron_timings(schedules).map(|_| ()),
            SystemCommand::DeleteDirectory { path } => {
                if path.trim().is_empty() {
                    return Err(CommandError::Validation("path is required".into()));
                }
                Ok(())
            }
            SystemCommand::CleanupBackups { folders, .. } => {
                if folders.is_empty() {
                    return Err(CommandError::Validation("folders must not be empty".into()));
                }
                if folders.iter().any(|f| f.trim().is_empty()) {
                    return Err(CommandError::Validation("folders must not contain empty paths".into()));
                }
                Ok(())
            }
        }
    }

    /// Validate every schedule; the first violation rejects the whole batch.
    /// Returns the timings of the enabled schedules.
    pub fn cron_timings(schedules: &[CronSchedule]) -> Result<Vec<(i64, CronTiming)>, CommandError> {
        let mut timings = Vec::new();
        for (index, schedule) in schedules.iter().enumerate() {
            let timing = schedule
                .timing()
                .map_err(|msg| CommandError::Validation(format!("schedule {}: {}", index, msg)))?;
            if let (true, Some(id)) = (schedule.enabled, schedule.id) {
                timings.push((id, timing));
            }
        }
        Ok(timings)
    }

    pub fn parse_target(target: &str) -> Result<RestoreTarget, CommandError> {
        RestoreTarget::from_str(target).map_err(|_| {
            CommandError::Validation(format!(
                "target must be 'database' or 'folder', got '{}'",
                target
            ))
        })
    }

    fn validate_backup(
        &self,
        id: &str,
        base_id: Option<&str>,
        schedule_id: Option<i64>,
    ) -> Result<(), CommandError> {
        Self::check_id("id", id)?;
        if self.backup.backup_dir(id).exists() {
            return Err(CommandError::Conflict(format!("backup '{}' already exists", id)));
        }

        if let Some(base) = base_id {
            Self::check_id("from_backup_id", base)?;
            if !self.backup.backup_dir(base).is_dir() {
                return Err(CommandError::NotFound(format!("base backup '{}' not found", base)));
            }
        }

        if let Some(schedule_id) = schedule_id {
            self.check_schedule(schedule_id)?;
        }

        self.check_credentials()?;

        if !self.probe.is_alive() {
            return Err(CommandError::Precondition(
                "database server is not responding".into(),
            ));
        }
        Ok(())
    }

    fn validate_restore(&self, id_list: &[String], target: &str) -> Result<(), CommandError> {
        if id_list.is_empty() {
            return Err(CommandError::Validation("id_list must not be empty".into()));
        }
        for id in id_list {
            Self::check_id("id_list", id)?;
            if !self.backup.backup_dir(id).is_dir() {
                return Err(CommandError::NotFound(format!("backup '{}' not found", id)));
            }
        }

        if Self::parse_target(target)? == RestoreTarget::Database {
            if self.probe.is_alive() {
                return Err(CommandError::Precondition(
                    "database server must be stopped before restoring into it".into(),
                ));
            }
            self.check_data_dir()?;
        }
        Ok(())
    }

    fn check_id(field: &str, id: &str) -> Result<(), CommandError> {
        if !Utils::is_single_component(id) {
            return Err(CommandError::Validation(format!(
                "{} must be a plain directory name, got '{}'",
                field, id
            )));
        }
        Ok(())
    }

    fn check_schedule(&self, schedule_id: i64) -> Result<(), CommandError> {
        let found = self
            .db
            .get_connection()
            .and_then(|conn| Schedule::get_by_id(&conn, schedule_id))
            .map_err(|e| CommandError::Internal(format!("cannot look up schedule: {}", e)))?;
        match found {
            Some(_) => Ok(()),
            None => Err(CommandError::NotFound(format!(
                "schedule {} not found",
                schedule_id
            ))),
        }
    }

    fn check_credentials(&self) -> Result<(), CommandError> {
        let path = &self.backup.credentials_file;
        let content = fs::read_to_string(path).map_err(|e| {
            CommandError::Precondition(format!("credentials file {} unreadable: {}", path, e))
        })?;

        let section = format!("[{}]", self.backup.client_section);
        if !content.lines().any(|line| line.trim() == section) {
            return Err(CommandError::Precondition(format!(
                "credentials file {} has no {} section",
                path, section
            )));
        }
        Ok(())
    }

    fn check_data_dir(&self) -> Result<(), CommandError> {
        let dir = Path::new(&self.backup.data_dir);
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Data directory {} does not exist", dir.display());
                return Ok(());
            }
            Err(e) => {
                return Err(CommandError::Precondition(format!(
                    "cannot read data directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !Self::is_residual(&name) {
                return Err(CommandError::Precondition(format!(
                    "data directory {} is not empty: found '{}'",
                    dir.display(),
                    name
                )));
            }
        }
        Ok(())
    }

    fn is_residual(name: &str) -> bool {
        RESIDUAL_NAMES.contains(&name) || RESIDUAL_SUFFIXES.iter().any(|s| name.ends_with(s))
    }
}

#[cfg(test)]
pub mod test_support {
    use super::ServerProbe;

    pub struct FixedProbe(pub bool);

    impl ServerProbe for FixedProbe {
        fn is_alive(&self) -> bool {
            self.0
        }
    }
}
