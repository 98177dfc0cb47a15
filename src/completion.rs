use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::backups::Backup;
use crate::database::Database;
use crate::error::BacksmithError;
use crate::processes::{Process, ProcessStatus, ProcessType};
use crate::restores::{Restore, RestoreTarget};
use crate::utils::Utils;

/// Process argument keys shared with the dispatcher.
pub mod args {
    pub const BACKUP_ID: &str = "backup_id";
    pub const FROM_BACKUP_ID: &str = "from_backup_id";
    pub const SCHEDULE_ID: &str = "schedule_id";
    pub const ID_LIST: &str = "id_list";
    pub const TARGET: &str = "target";
    pub const TARGET_PATH: &str = "target_path";
    pub const STAGING_DIR: &str = "staging_dir";
    pub const PATHS: &str = "paths";
    pub const BACKUP_IDS: &str = "backup_ids";
}

/// Turns finished processes into domain rows. Safe to run twice on the same
/// process: inserts are keyed and ignored when already present.
#[derive(Clone)]
pub struct CompletionHandler {
    db: Database,
    backup_root: PathBuf,
}

impl CompletionHandler {
    pub fn new(db: Database, backup_root: &Path) -> Self {
        CompletionHandler {
            db,
            backup_root: backup_root.to_path_buf(),
        }
    }

    /// Drain `rx` in order. Each record is handled on the blocking pool
    /// since it sizes and removes directories and writes to the store.
    pub fn spawn(self, mut rx: UnboundedReceiver<Process>) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(process) = rx.recv().await {
                let handler = self.clone();
                let command_id = process.command_id.clone();
                if let Err(e) = tokio::task::spawn_blocking(move || handler.handle(&process)).await {
                    error!("Completion of command {} panicked: {}", command_id, e);
                }
            }
            info!("Completion channel closed");
        })
    }

    pub fn handle(&self, process: &Process) {
        let result = match process.process_type {
            ProcessType::Backup => self.on_backup(process),
            ProcessType::Restore => self.on_restore(process),
            ProcessType::Cleanup | ProcessType::DirectoryDelete | ProcessType::CronUpdate => {
                Self::log_outcome(process);
                Ok(())
            }
        };

        if let Err(e) = result {
            error!(
                "Completion of {} command {} failed: {}",
                process.process_type, process.command_id, e
            );
        }
    }

    fn on_backup(&self, process: &Process) -> Result<(), BacksmithError> {
        let backup_id = process
            .arg_str(args::BACKUP_ID)
            .ok_or_else(|| BacksmithError::Error("backup process without backup_id".into()))?;
        let backup_dir = self.backup_root.join(backup_id);

        if process.status != ProcessStatus::Success {
            warn!(
                "Backup '{}' failed ({:?}): {}",
                backup_id,
                process.return_code,
                process.error.trim()
            );
            return match fs::remove_dir_all(&backup_dir) {
                Ok(()) => {
                    info!("Removed partial backup directory {}", backup_dir.display());
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            };
        }

        let backup = Backup {
            id: backup_id.to_string(),
            from_backup_id: process.arg_str(args::FROM_BACKUP_ID).map(str::to_string),
            schedule_id: process.arg_i64(args::SCHEDULE_ID),
            start_time: process.start_time,
            end_time: process.end_time,
            process_id: Some(process.id),
            size: Some(Utils::dir_size(&backup_dir) as i64),
        };

        let conn = self.db.get_connection()?;
        if Backup::create(&conn, &backup)? {
            info!(
                "Recorded {} backup '{}' ({} bytes)",
                backup.backup_type(),
                backup.id,
                backup.size.unwrap_or(0)
            );
        } else {
            info!("Backup '{}' already recorded", backup.id);
        }
        Ok(())
    }

    fn on_restore(&self, process: &Process) -> Result<(), BacksmithError> {
        if process.status != ProcessStatus::Success {
            warn!(
                "Restore {} failed at '{}': {}",
                process.command_id,
                process.command,
                process.error.trim()
            );
            return Ok(());
        }

        let id_list: Vec<String> = process
            .args
            .get(args::ID_LIST)
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default();
        let (Some(root), Some(latest)) = (id_list.first(), id_list.last()) else {
            return Err(BacksmithError::Error("restore process without id_list".into()));
        };

        let target: RestoreTarget = process
            .arg_str(args::TARGET)
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| BacksmithError::Error("restore process without target".into()))?;

        let conn = self.db.get_connection()?;
        if Restore::get_by_process_id(&conn, process.id)?.is_some() {
            info!("Restore {} already recorded", process.command_id);
            return Ok(());
        }

        let backup_timestamp = Backup::get_by_id(&conn, latest)?.map(|b| b.start_time);
        if backup_timestamp.is_none() {
            warn!("Restore {}: backup '{}' has no record", process.command_id, latest);
        }

        let start_time = Process::list_by_command_id(&conn, &process.command_id)?
            .iter()
            .map(|p| p.start_time)
            .min()
            .unwrap_or(process.start_time);

        let restore = Restore {
            id: 0,
            backup_id: root.clone(),
            backup_timestamp,
            target,
            target_path: process.arg_str(args::TARGET_PATH).unwrap_or_default().to_string(),
            start_time,
            end_time: process.end_time,
            process_id: process.id,
        };

        if Restore::create(&conn, &restore)? {
            info!(
                "Recorded restore of '{}' into {} ({})",
                restore.backup_id, restore.target_path, restore.target
            );
        }

        if target == RestoreTarget::Database {
            if let Some(staging) = process.arg_str(args::STAGING_DIR) {
                let staging = Path::new(staging);
                match fs::remove_dir_all(staging) {
                    Ok(()) => info!("Removed staging directory {}", staging.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!("Could not remove staging directory {}: {}", staging.display(), e),
                }
            }
        }
        Ok(())
    }

    fn log_outcome(process: &Process) {
        match process.status {
            ProcessStatus::Success => info!(
                "{} command {} succeeded",
                process.process_type, process.command_id
            ),
            _ => error!(
                "{} command {} failed with code {:?}: {}",
                process.process_type,
                process.command_id,
                process.return_code,
                process.error.trim()
            ),
        }
    }
}
