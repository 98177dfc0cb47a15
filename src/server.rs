use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::builder::{cron, CommandBuilder};
use crate::completion::args;
use crate::config::{Config, CronConfig};
use crate::error::{BacksmithError, CommandError};
use crate::processes::{ProcessArgs, ProcessStatus, ProcessType};
use crate::protocol::{
    parse_command, read_message, DatabaseCommand, Framing, Response, ServiceRole, SystemCommand,
};
use crate::restores::RestoreTarget;
use crate::runner::{OsCommand, ProcessRunner};
use crate::validator::Validator;

/// Validates, builds and starts one decoded request.
pub struct Dispatcher {
    role: ServiceRole,
    validator: Validator,
    builder: CommandBuilder,
    runner: ProcessRunner,
    cron: CronConfig,
}

impl Dispatcher {
    pub fn new(
        role: ServiceRole,
        validator: Validator,
        builder: CommandBuilder,
        runner: ProcessRunner,
        cron: CronConfig,
    ) -> Self {
        Dispatcher {
            role,
            validator,
            builder,
            runner,
            cron,
        }
    }

    /// Validation probes the server and touches the store and filesystem,
    /// so each request is dispatched on the blocking pool.
    pub async fn handle(self: Arc<Self>, request: Vec<u8>) -> Response {
        match tokio::task::spawn_blocking(move || self.dispatch(&request)).await {
            Ok(response) => response,
            Err(e) => {
                let e = BacksmithError::Error(format!("dispatch task failed: {}", e));
                error!("{}", e);
                Response::internal(&e)
            }
        }
    }

    fn dispatch(&self, request: &[u8]) -> Response {
        let result = match self.role {
            ServiceRole::Database => match parse_command::<DatabaseCommand>(request) {
                Ok(command) => self.dispatch_database(command),
                Err(e) => return e.into(),
            },
            ServiceRole::System => match parse_command::<SystemCommand>(request) {
                Ok(command) => self.dispatch_system(command),
                Err(e) => return e.into(),
            },
        };

        result.unwrap_or_else(|e| {
            error!("Dispatch failed: {}", e);
            Response::internal(&e)
        })
    }

    /// Claim `<root>/<id>` for one backup. Losing a race for the same id is a
    /// conflict, never a shared directory.
    fn reserve_backup_dir(&self, backup_id: &str) -> Result<PathBuf, CommandError> {
        let dir = self.builder.backup_dir(backup_id);
        let created = dir
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::create_dir(&dir));
        match created {
            Ok(()) => Ok(dir),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CommandError::Conflict(format!(
                "backup '{}' already exists",
                backup_id
            ))),
            Err(e) => Err(CommandError::Internal(format!(
                "cannot create {}: {}",
                dir.display(),
                e
            ))),
        }
    }

    fn start_backup(
        &self,
        command_id: &str,
        backup_id: &str,
        os_command: OsCommand,
        process_args: ProcessArgs,
    ) -> Result<Option<Response>, BacksmithError> {
        let dir = match self.reserve_backup_dir(backup_id) {
            Ok(dir) => dir,
            Err(e) => {
                info!("Rejected backup '{}': {}", backup_id, e);
                return Ok(Some(e.into()));
            }
        };

        if let Err(e) = self
            .runner
            .execute(command_id, os_command, ProcessType::Backup, process_args)
        {
            if let Err(cleanup) = fs::remove_dir(&dir) {
                warn!("Could not release {}: {}", dir.display(), cleanup);
            }
            return Err(e);
        }
        Ok(None)
    }

    fn dispatch_database(&self, command: DatabaseCommand) -> Result<Response, BacksmithError> {
        if let Err(e) = self.validator.validate_database(&command) {
            info!("Rejected {:?}: {}", command, e);
            return Ok(e.into());
        }

        let command_id = ProcessRunner::new_command_id();
        let mut process_args = ProcessArgs::new();

        match command {
            DatabaseCommand::FullBackup { id, schedule_id } => {
                process_args.insert(args::BACKUP_ID.into(), json!(id));
                process_args.insert(args::SCHEDULE_ID.into(), json!(schedule_id));
                let os_command = self.builder.full_backup(&id);
                if let Some(rejected) = self.start_backup(&command_id, &id, os_command, process_args)? {
                    return Ok(rejected);
                }
            }
            DatabaseCommand::IncrementalBackup {
                id,
                from_backup_id,
                schedule_id,
            } => {
                process_args.insert(args::BACKUP_ID.into(), json!(id));
                process_args.insert(args::FROM_BACKUP_ID.into(), json!(from_backup_id));
                process_args.insert(args::SCHEDULE_ID.into(), json!(schedule_id));
                let os_command = self.builder.incremental_backup(&id, &from_backup_id);
                if let Some(rejected) = self.start_backup(&command_id, &id, os_command, process_args)? {
                    return Ok(rejected);
                }
            }
            DatabaseCommand::RestoreBackup { id_list, target } => {
                let target = match Validator::parse_target(&target) {
                    Ok(target) => target,
                    Err(e) => return Ok(e.into()),
                };
                let plan = self.builder.restore_plan(&command_id, &id_list, target);
                if let Some(parent) = plan.staging_dir.parent() {
                    fs::create_dir_all(parent)?;
                }

                let target_path = match target {
                    RestoreTarget::Database => self.builder.data_dir().to_path_buf(),
                    RestoreTarget::Folder => plan.staging_dir.clone(),
                };
                process_args.insert(args::ID_LIST.into(), json!(id_list));
                process_args.insert(args::TARGET.into(), json!(target.as_ref()));
                process_args.insert(args::TARGET_PATH.into(), json!(target_path.to_string_lossy()));
                process_args.insert(args::STAGING_DIR.into(), json!(plan.staging_dir.to_string_lossy()));

                self.runner.execute_consecutive(
                    &command_id,
                    plan.commands,
                    ProcessType::Restore,
                    process_args,
                )?;
            }
        }

        Ok(Response::accepted(&command_id))
    }

    fn dispatch_system(&self, command: SystemCommand) -> Result<Response, BacksmithError> {
        if let Err(e) = self.validator.validate_system(&command) {
            info!("Rejected {:?}: {}", command, e);
            return Ok(e.into());
        }

        let command_id = ProcessRunner::new_command_id();
        let mut process_args = ProcessArgs::new();

        match command {
            SystemCommand::UpdateCronSchedules { schedules } => {
                let timings = match Validator::cron_timings(&schedules) {
                    Ok(timings) => timings,
                    Err(e) => return Ok(e.into()),
                };
                let content = cron::render(&self.cron, &timings);
                let path = PathBuf::from(&self.cron.file_path);
                process_args.insert("schedules".into(), json!(timings.len()));

                let written = cron::write_atomically(&path, &content);

                let description = format!("write {}", path.display());
                let result = written
                    .map(|_| format!("{} schedules written to {}", timings.len(), path.display()))
                    .map_err(|e| e.to_string());
                let process = self.runner.record_internal(
                    &command_id,
                    &description,
                    ProcessType::CronUpdate,
                    process_args,
                    result,
                )?;

                if process.status != ProcessStatus::Success {
                    let mut response = Response::error(500, process.error);
                    response.id = Some(command_id);
                    return Ok(response);
                }
                return Ok(Response::ok(&command_id));
            }
            SystemCommand::DeleteDirectory { path } => {
                let os_command = self.builder.delete_paths(&[path.as_str()]);
                process_args.insert(args::PATHS.into(), json!([path]));
                self.runner.execute(
                    &command_id,
                    os_command,
                    ProcessType::DirectoryDelete,
                    process_args,
                )?;
            }
            SystemCommand::CleanupBackups { backup_ids, folders } => {
                let os_command = self.builder.delete_paths(&folders);
                process_args.insert(args::BACKUP_IDS.into(), json!(backup_ids));
                process_args.insert(args::PATHS.into(), json!(folders));
                self.runner
                    .execute(&command_id, os_command, ProcessType::Cleanup, process_args)?;
            }
        }

        Ok(Response::accepted(&command_id))
    }
}

/// Accepts connections on one role's socket until `shutdown` fires.
pub struct SocketServer {
    path: PathBuf,
    mode: u32,
    framing: Framing,
    dispatcher: Arc<Dispatcher>,
}

impl SocketServer {
    pub fn new(config: &Config, role: ServiceRole, dispatcher: Arc<Dispatcher>) -> Self {
        let path = match role {
            ServiceRole::Database => &config.socket.database_path,
            ServiceRole::System => &config.socket.system_path,
        };
        SocketServer {
            path: PathBuf::from(path),
            mode: config.socket.mode,
            framing: Framing::from(&config.socket),
            dispatcher,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bind(&self) -> Result<UnixListener, BacksmithError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.path.exists() {
            warn!("Removing stale socket {}", self.path.display());
            fs::remove_file(&self.path)?;
        }

        let listener = UnixListener::bind(&self.path)?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(self.mode))?;
        Ok(listener)
    }

    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), BacksmithError> {
        let listener = self.bind()?;
        info!(
            "Listening on {} ({} role)",
            self.path.display(),
            self.dispatcher.role
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let dispatcher = Arc::clone(&self.dispatcher);
                        let framing = self.framing;
                        tokio::spawn(async move {
                            Self::serve_connection(stream, dispatcher, framing).await;
                        });
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
            }
        }

        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Could not remove socket {}: {}", self.path.display(), e);
        }
        Ok(())
    }

    async fn serve_connection(mut stream: UnixStream, dispatcher: Arc<Dispatcher>, framing: Framing) {
        let response = match read_message(&mut stream, &framing).await {
            Ok(request) => dispatcher.handle(request).await,
            Err(e) => {
                debug!("Unreadable request: {}", e);
                Response::error(400, e.to_string())
            }
        };

        let payload = match serde_json::to_vec(&response) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode response: {}", e);
                return;
            }
        };

        if let Err(e) = stream.write_all(&payload).await {
            debug!("Client went away before the response: {}", e);
            return;
        }
        let _ = stream.shutdown().await;
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
