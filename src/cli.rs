use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use clap::{Parser, Subcommand};
use flexi_logger::{Cleanup, Criterion, Duplicate, FileSpec, Logger, LoggerHandle, Naming};
use log::{debug, info, warn};
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;

use crate::backups::{Backup, BackupType};
use crate::builder::{probe_version, select_strategy, CommandBuilder};
use crate::chain::resolve_chain;
use crate::client::SocketClient;
use crate::completion::CompletionHandler;
use crate::config::{Config, LoggingConfig, DEFAULT_CONFIG_PATH};
use crate::database::Database;
use crate::error::BacksmithError;
use crate::processes::Process;
use crate::protocol::{DatabaseCommand, ServiceRole};
use crate::retention::{RetentionEngine, SocketRemover};
use crate::runner::ProcessRunner;
use crate::schedules::Schedule;
use crate::server::{shutdown_signal, Dispatcher, SocketServer};
use crate::validator::{MysqladminProbe, Validator};

const LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;
const LOG_FILES_KEPT: usize = 7;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(
    name = "backsmith",
    version,
    about = "backsmith: database backups, restores and chain-aware retention"
)]
pub struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a privileged service (default if no command specified)
    Serve {
        /// Which command table the socket exposes: database or system
        #[arg(long, default_value = "database")]
        role: ServiceRole,
    },

    /// Delete backup chains that are past their schedule's retention
    Cleanup,

    /// Start the backup a schedule stands for
    RunSchedule { schedule_id: i64 },

    /// Show the process record for a command id
    Status {
        command_id: String,

        /// Show every step instead of the latest
        #[arg(long)]
        all: bool,
    },
}

impl Cli {
    pub fn handle_command_line() -> Result<(), BacksmithError> {
        let args = Cli::parse();
        let config = Config::load_config(&args.config);
        let _logger = start_logger(&config.logging);
        debug!("Command-line args: {:?}", std::env::args_os().collect::<Vec<_>>());

        match args.command.unwrap_or(Command::Serve {
            role: ServiceRole::Database,
        }) {
            Command::Serve { role } => Self::serve(config, role),
            Command::Cleanup => Self::cleanup(&config),
            Command::RunSchedule { schedule_id } => Self::run_schedule(&config, schedule_id),
            Command::Status { command_id, all } => Self::status(&config, &command_id, all),
        }
    }

    fn serve(config: Config, role: ServiceRole) -> Result<(), BacksmithError> {
        info!("Starting {} service", role);

        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| BacksmithError::Error(format!("Failed to create runtime: {}", e)))?;

        rt.block_on(async move {
            let db = Database::open(&config.database)?;

            let (tx, rx) = unbounded_channel();
            let completion = CompletionHandler::new(db.clone(), &config.backup.root_path()).spawn(rx);
            let runner = ProcessRunner::new(db.clone(), tx, &config.runner.safe_library_path);

            let detected = match role {
                ServiceRole::Database => probe_version(&config.backup.tool),
                ServiceRole::System => None,
            };
            let strategy = select_strategy(detected, &config.backup, &config.restore);
            let builder = CommandBuilder::new(config.backup.clone(), config.restore.clone(), strategy);
            debug!("Restore strategy: {}", builder.strategy_name());
            let validator = Validator::new(
                config.backup.clone(),
                db,
                Box::new(MysqladminProbe::new(&config.backup)),
            );

            let dispatcher = Dispatcher::new(role, validator, builder, runner, config.cron.clone());
            let server = SocketServer::new(&config, role, Arc::new(dispatcher));

            let token = CancellationToken::new();
            {
                let token = token.clone();
                tokio::spawn(async move {
                    shutdown_signal().await;
                    token.cancel();
                });
            }

            server.run(token).await?;
            drop(server);

            if tokio::time::timeout(SHUTDOWN_GRACE, completion).await.is_err() {
                warn!("Commands still in flight at shutdown; their records stay running");
            }
            info!("{} service stopped", role);
            Ok::<(), BacksmithError>(())
        })
    }

    fn cleanup(config: &Config) -> Result<(), BacksmithError> {
        let db = Database::open(&config.database)?;
        let remover = SocketRemover::new(
            SocketClient::new(Path::new(&config.socket.system_path)),
            db.clone(),
            Duration::from_millis(config.runner.cleanup_poll_ms),
            Duration::from_secs(config.runner.cleanup_wait_secs),
        );

        let engine = RetentionEngine::new(db, &config.backup.root_path(), remover);
        let report = engine.run(Utc::now())?;

        println!(
            "{} chains expired, {} backups deleted, {} failed",
            report.chains, report.deleted, report.failed
        );
        for error in &report.errors {
            eprintln!("{}", error);
        }

        if report.is_success() {
            Ok(())
        } else {
            Err(BacksmithError::Error("retention cleanup did not complete".into()))
        }
    }

    fn run_schedule(config: &Config, schedule_id: i64) -> Result<(), BacksmithError> {
        let db = Database::open(&config.database)?;
        let conn = db.get_connection()?;

        let schedule = Schedule::get_by_id(&conn, schedule_id)?
            .ok_or_else(|| BacksmithError::Error(format!("Schedule {} not found", schedule_id)))?;
        if !schedule.enabled {
            info!("Schedule {} is disabled, nothing to do", schedule_id);
            return Ok(());
        }

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let parent = match schedule.backup_type {
            BackupType::Incremental => Backup::latest_for_schedule(&conn, schedule_id)?,
            BackupType::Full => None,
        };
        if let Some(parent) = &parent {
            // Never extend a chain that could not be restored.
            let chain = resolve_chain(&conn, &parent.id)?;
            debug!("Schedule {}: extending a chain of {} backups", schedule_id, chain.len());
        }

        let command = match parent {
            Some(parent) => DatabaseCommand::IncrementalBackup {
                id: format!("s{}-{}-inc", schedule_id, stamp),
                from_backup_id: parent.id,
                schedule_id: Some(schedule_id),
            },
            None => DatabaseCommand::FullBackup {
                id: format!("s{}-{}-full", schedule_id, stamp),
                schedule_id: Some(schedule_id),
            },
        };
        info!("Schedule {}: requesting {:?}", schedule_id, command);

        let response = SocketClient::new(Path::new(&config.socket.database_path)).send(&command)?;
        println!("{}", serde_json::to_string(&response)?);

        if response.is_error() {
            return Err(BacksmithError::Error(format!(
                "backup request rejected with {}",
                response.code
            )));
        }
        Ok(())
    }

    fn status(config: &Config, command_id: &str, all: bool) -> Result<(), BacksmithError> {
        let db = Database::open(&config.database)?;
        let conn = db.get_connection()?;

        if all {
            let steps = Process::list_by_command_id(&conn, command_id)?;
            if steps.is_empty() {
                return Err(BacksmithError::Error(format!("No process for command {}", command_id)));
            }
            println!("{}", serde_json::to_string_pretty(&steps)?);
            return Ok(());
        }

        let process = Process::get_by_command_id(&conn, command_id)?
            .ok_or_else(|| BacksmithError::Error(format!("No process for command {}", command_id)))?;
        println!("{}", serde_json::to_string_pretty(&process)?);
        Ok(())
    }
}

/// File logging with rotation, warnings mirrored to stderr. Falls back to
/// stderr alone when the log directory cannot be used.
fn start_logger(config: &LoggingConfig) -> Option<LoggerHandle> {
    let spec = format!("backsmith={}", config.backsmith);

    let file_logger = Logger::try_with_str(&spec).and_then(|logger| {
        logger
            .log_to_file(
                FileSpec::default()
                    .directory(&config.dir)
                    .basename("backsmith"),
            )
            .duplicate_to_stderr(Duplicate::Warn)
            .rotate(
                Criterion::Size(LOG_FILE_BYTES),
                Naming::Numbers,
                Cleanup::KeepLogFiles(LOG_FILES_KEPT),
            )
            .format_for_files(flexi_logger::detailed_format)
            .start()
    });

    match file_logger {
        Ok(handle) => Some(handle),
        Err(e) => {
            eprintln!("Could not log to {}: {}. Logging to stderr.", config.dir, e);
            Logger::try_with_str(&spec)
                .and_then(|logger| logger.log_to_stderr().start())
                .ok()
        }
    }
}
