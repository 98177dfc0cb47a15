mod command;

pub use command::{quote, quote_path, OsCommand};

use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::database::Database;
use crate::error::BacksmithError;
use crate::processes::{NewProcess, Process, ProcessArgs, ProcessOutcome, ProcessStatus, ProcessType};
use crate::utils::Utils;

/// Variables stripped from every child environment before `LD_LIBRARY_PATH`
/// is pinned to the configured safe value. Any `DYLD_*` variable is stripped
/// as well.
const STRIPPED_ENV: [&str; 3] = ["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT"];

/// In-flight processes keyed by command id.
#[derive(Default)]
pub struct ProcessRegistry {
    inner: Mutex<HashMap<String, u32>>,
}

impl ProcessRegistry {
    pub fn register(&self, command_id: &str, pid: u32) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(command_id.to_string(), pid);
        }
    }

    pub fn unregister(&self, command_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(command_id);
        }
    }

    pub fn lookup(&self, command_id: &str) -> Option<u32> {
        self.inner
            .lock()
            .ok()
            .and_then(|map| map.get(command_id).copied())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }
}

enum Launch {
    Running(Child, Process),
    /// The OS refused the spawn; the row is already terminal.
    Refused(Process),
}

/// Spawns OS commands, persists their lifecycle and hands each finished
/// command to the completion channel.
#[derive(Clone)]
pub struct ProcessRunner {
    db: Database,
    completions: UnboundedSender<Process>,
    registry: Arc<ProcessRegistry>,
    safe_library_path: String,
}

impl ProcessRunner {
    pub fn new(db: Database, completions: UnboundedSender<Process>, safe_library_path: &str) -> Self {
        ProcessRunner {
            db,
            completions,
            registry: Arc::new(ProcessRegistry::default()),
            safe_library_path: safe_library_path.to_string(),
        }
    }

    pub fn new_command_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Start `command` and return once its row is recorded. The exit is
    /// awaited on a separate task.
    pub fn execute(
        &self,
        command_id: &str,
        command: OsCommand,
        process_type: ProcessType,
        args: ProcessArgs,
    ) -> Result<(), BacksmithError> {
        self.execute_consecutive(command_id, vec![command], process_type, args)
    }

    /// Run `commands` one after another under one command id, one process
    /// row per step. Stops at the first failing step; that step (or the last
    /// one) is what reaches the completion channel.
    ///
    /// Returns as soon as the first step is recorded.
    pub fn execute_consecutive(
        &self,
        command_id: &str,
        commands: Vec<OsCommand>,
        process_type: ProcessType,
        args: ProcessArgs,
    ) -> Result<(), BacksmithError> {
        let mut steps = commands.into_iter();
        let Some(first) = steps.next() else {
            return Err(BacksmithError::Error(format!(
                "Command {} has no steps",
                command_id
            )));
        };

        let launch = self.launch(command_id, &first, process_type, &args)?;

        let runner = self.clone();
        let command_id = command_id.to_string();
        let remaining: Vec<OsCommand> = steps.collect();

        tokio::spawn(async move {
            let mut last = runner.finish(launch).await;
            let total = remaining.len() + 1;

            for (index, step) in remaining.iter().enumerate() {
                if last.status != ProcessStatus::Success {
                    warn!(
                        "Command {} stopped after step {} of {}",
                        command_id,
                        index + 1,
                        total
                    );
                    break;
                }

                match runner.launch(&command_id, step, process_type, &args) {
                    Ok(launch) => last = runner.finish(launch).await,
                    Err(e) => {
                        let reason = format!("could not start step {} of {}: {}", index + 2, total, e);
                        error!("Command {}: {}", command_id, reason);
                        last = runner.abandon(&last, step, reason);
                        break;
                    }
                }
            }

            if let Err(e) = runner.completions.send(last) {
                error!("Completion channel closed, dropping result of {}: {}", command_id, e);
            }
        });

        Ok(())
    }

    /// Failed record for a step that never started. Stored when the store
    /// allows it, otherwise built in memory from the previous step.
    fn abandon(&self, previous: &Process, step: &OsCommand, reason: String) -> Process {
        let new = NewProcess {
            command_id: previous.command_id.clone(),
            command: step.to_string(),
            pid: None,
            process_type: previous.process_type,
            args: previous.args.clone(),
            start_time: Utils::now(),
        };
        let outcome = ProcessOutcome {
            status: ProcessStatus::Failed,
            output: String::new(),
            error: reason,
            return_code: -1,
            end_time: Utils::now(),
        };

        let stored = self
            .db
            .get_connection()
            .and_then(|conn| Process::create_terminal(&conn, &new, &outcome));
        match stored {
            Ok(process) => process,
            Err(e) => {
                warn!("Could not record abandoned step of {}: {}", previous.command_id, e);
                let mut process = previous.clone();
                process.command = new.command;
                process.pid = None;
                Self::apply(process, outcome)
            }
        }
    }

    /// Record an operation performed in-process as an already finished
    /// process and deliver it to the completion channel.
    pub fn record_internal(
        &self,
        command_id: &str,
        description: &str,
        process_type: ProcessType,
        args: ProcessArgs,
        result: Result<String, String>,
    ) -> Result<Process, BacksmithError> {
        let now = Utils::now();
        let new = NewProcess {
            command_id: command_id.to_string(),
            command: description.to_string(),
            pid: Some(std::process::id()),
            process_type,
            args,
            start_time: now,
        };
        let outcome = match result {
            Ok(output) => ProcessOutcome {
                status: ProcessStatus::Success,
                output,
                error: String::new(),
                return_code: 0,
                end_time: now,
            },
            Err(error) => ProcessOutcome {
                status: ProcessStatus::Failed,
                output: String::new(),
                error,
                return_code: 1,
                end_time: now,
            },
        };

        let conn = self.db.get_connection()?;
        let process = Process::create_terminal(&conn, &new, &outcome)?;
        if let Err(e) = self.completions.send(process.clone()) {
            error!("Completion channel closed, dropping result of {}: {}", command_id, e);
        }
        Ok(process)
    }

    /// Insert the step's row, then spawn it. The row comes first so a
    /// store failure never leaves an untracked child behind.
    fn launch(
        &self,
        command_id: &str,
        command: &OsCommand,
        process_type: ProcessType,
        args: &ProcessArgs,
    ) -> Result<Launch, BacksmithError> {
        let text = command.to_string();
        let new = NewProcess {
            command_id: command_id.to_string(),
            command: text.clone(),
            pid: None,
            process_type,
            args: args.clone(),
            start_time: Utils::now(),
        };

        let conn = self.db.get_connection()?;
        let mut process = Process::create(&conn, &new)?;

        let mut cmd = Command::new(command.program());
        cmd.args(command.arguments())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        self.sanitize_env(&mut cmd);

        match cmd.spawn() {
            Ok(child) => {
                process.pid = child.id();
                if let Some(pid) = process.pid {
                    if let Err(e) = Process::set_pid(&conn, process.id, pid) {
                        warn!("Command {}: could not record pid {}: {}", command_id, pid, e);
                    }
                    self.registry.register(command_id, pid);
                }
                info!("Command {} started [{}]: {}", command_id, process.id, text);
                Ok(Launch::Running(child, process))
            }
            Err(e) => {
                error!("Command {} failed to spawn '{}': {}", command_id, text, e);
                let outcome = ProcessOutcome {
                    status: ProcessStatus::Failed,
                    output: String::new(),
                    error: format!("failed to spawn: {}", e),
                    return_code: -1,
                    end_time: Utils::now(),
                };
                let process = match Process::complete(&conn, process.id, &outcome) {
                    Ok(stored) => stored,
                    Err(store_err) => {
                        error!("Could not record spawn failure of process {}: {}", process.id, store_err);
                        Self::apply(process, outcome)
                    }
                };
                Ok(Launch::Refused(process))
            }
        }
    }

    async fn finish(&self, launch: Launch) -> Process {
        let (child, process) = match launch {
            Launch::Running(child, process) => (child, process),
            Launch::Refused(process) => return process,
        };

        let outcome = match child.wait_with_output().await {
            Ok(output) => Self::outcome_of(&output),
            Err(e) => ProcessOutcome {
                status: ProcessStatus::Failed,
                output: String::new(),
                error: format!("failed to wait for process: {}", e),
                return_code: -1,
                end_time: Utils::now(),
            },
        };

        self.registry.unregister(&process.command_id);
        debug!(
            "Command {} step {} exited with {}",
            process.command_id, process.id, outcome.return_code
        );

        let stored = self
            .db
            .get_connection()
            .and_then(|conn| Process::complete(&conn, process.id, &outcome));

        match stored {
            Ok(stored) => stored,
            Err(e) => {
                error!("Could not record outcome of process {}: {}", process.id, e);
                Self::apply(process, outcome)
            }
        }
    }

    /// In-memory copy of `process` with `outcome` applied.
    fn apply(mut process: Process, outcome: ProcessOutcome) -> Process {
        process.status = outcome.status;
        process.output = outcome.output;
        process.error = outcome.error;
        process.return_code = Some(outcome.return_code);
        process.end_time = Some(outcome.end_time);
        process
    }

    /// Exit 0 folds stderr into the output; otherwise the streams stay apart.
    fn outcome_of(output: &Output) -> ProcessOutcome {
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let return_code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            ProcessOutcome {
                status: ProcessStatus::Success,
                output: stdout + &stderr,
                error: String::new(),
                return_code,
                end_time: Utils::now(),
            }
        } else {
            ProcessOutcome {
                status: ProcessStatus::Failed,
                output: stdout,
                error: stderr,
                return_code,
                end_time: Utils::now(),
            }
        }
    }

    fn sanitize_env(&self, cmd: &mut Command) {
        for key in STRIPPED_ENV {
            cmd.env_remove(key);
        }
        for (key, _) in std::env::vars_os() {
            if key.to_string_lossy().starts_with("DYLD_") {
                cmd.env_remove(&key);
            }
        }
        cmd.env("LD_LIBRARY_PATH", &self.safe_library_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::temp_database;
    use serial_test::serial;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    const SAFE_PATH: &str = "/usr/lib:/lib";

    fn runner() -> (tempfile::TempDir, ProcessRunner, UnboundedReceiver<Process>) {
        let (dir, db) = temp_database();
        let (tx, rx) = unbounded_channel();
        (dir, ProcessRunner::new(db, tx, SAFE_PATH), rx)
    }

    async fn next(rx: &mut UnboundedReceiver<Process>) -> Process {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("completion timed out")
            .expect("channel closed")
    }

    fn sh(script: &str) -> OsCommand {
        OsCommand::pipeline(script)
    }

    #[tokio::test]
    async fn test_success_merges_streams() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute(&id, sh("echo out; echo err >&2"), ProcessType::Backup, ProcessArgs::new())
            .unwrap();

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Success);
        assert_eq!(done.return_code, Some(0));
        assert!(done.output.contains("out"));
        assert!(done.output.contains("err"));
        assert!(done.error.is_empty());
        assert!(done.end_time.is_some());
        assert_eq!(runner.registry().lookup(&id), None);
    }

    #[tokio::test]
    async fn test_failure_keeps_streams_apart() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute(&id, sh("echo out; echo err >&2; exit 3"), ProcessType::Backup, ProcessArgs::new())
            .unwrap();

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.return_code, Some(3));
        assert_eq!(done.output.trim(), "out");
        assert_eq!(done.error.trim(), "err");
    }

    #[tokio::test]
    async fn test_row_exists_before_exit() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute(&id, sh("sleep 0.3"), ProcessType::Cleanup, ProcessArgs::new())
            .unwrap();

        {
            let conn = runner.db.get_connection().unwrap();
            let row = Process::get_by_command_id(&conn, &id).unwrap().unwrap();
            assert_eq!(row.status, ProcessStatus::Running);
            assert!(row.pid.is_some());
        }
        assert!(runner.registry().lookup(&id).is_some());

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Success);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_terminal() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute(
                &id,
                OsCommand::new("/nonexistent/backsmith-tool"),
                ProcessType::Backup,
                ProcessArgs::new(),
            )
            .unwrap();

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.return_code, Some(-1));
        assert!(done.error.contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_consecutive_halts_on_failure() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute_consecutive(
                &id,
                vec![sh("true"), sh("exit 2"), sh("echo never")],
                ProcessType::Restore,
                ProcessArgs::new(),
            )
            .unwrap();

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.return_code, Some(2));

        let conn = runner.db.get_connection().unwrap();
        let steps = Process::list_by_command_id(&conn, &id).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].status, ProcessStatus::Success);
        assert_eq!(Process::get_by_command_id(&conn, &id).unwrap().unwrap().id, done.id);
    }

    fn refuse_inserts(runner: &ProcessRunner, condition: &str) {
        let conn = runner.db.get_connection().unwrap();
        conn.execute_batch(&format!(
            "CREATE TRIGGER refuse_insert BEFORE INSERT ON processes
             WHEN {}
             BEGIN SELECT RAISE(ABORT, 'store unavailable'); END;",
            condition
        ))
        .unwrap();
    }

    #[tokio::test]
    async fn test_unrecorded_command_is_never_spawned() {
        let (dir, runner, mut rx) = runner();
        refuse_inserts(&runner, "1");
        let marker = dir.path().join("ran");
        let id = ProcessRunner::new_command_id();

        let result = runner.execute(
            &id,
            OsCommand::new("touch").arg(marker.to_string_lossy()),
            ProcessType::Backup,
            ProcessArgs::new(),
        );

        assert!(result.is_err());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!marker.exists());
        assert!(rx.try_recv().is_err());
        assert_eq!(runner.registry().len(), 0);
    }

    #[tokio::test]
    async fn test_consecutive_step_that_cannot_start_is_delivered_failed() {
        let (dir, runner, mut rx) = runner();
        let marker = dir.path().join("ran");
        refuse_inserts(&runner, "NEW.command LIKE 'touch%'");
        let id = ProcessRunner::new_command_id();

        runner
            .execute_consecutive(
                &id,
                vec![
                    sh("true"),
                    OsCommand::new("touch").arg(marker.to_string_lossy()),
                    sh("true"),
                ],
                ProcessType::Restore,
                ProcessArgs::new(),
            )
            .unwrap();

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Failed);
        assert_eq!(done.return_code, Some(-1));
        assert!(done.error.contains("could not start step 2 of 3"));
        assert!(done.command.starts_with("touch"));
        assert!(!marker.exists());

        let conn = runner.db.get_connection().unwrap();
        assert_eq!(Process::list_by_command_id(&conn, &id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_consecutive_runs_every_step() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute_consecutive(
                &id,
                vec![sh("true"), sh("true"), sh("echo last")],
                ProcessType::Restore,
                ProcessArgs::new(),
            )
            .unwrap();

        let done = next(&mut rx).await;
        assert_eq!(done.status, ProcessStatus::Success);
        assert_eq!(done.output.trim(), "last");

        let conn = runner.db.get_connection().unwrap();
        assert_eq!(Process::list_by_command_id(&conn, &id).unwrap().len(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_record_internal() {
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        let process = runner
            .record_internal(&id, "write cron file", ProcessType::CronUpdate, ProcessArgs::new(), Err("disk full".into()))
            .unwrap();
        assert_eq!(process.status, ProcessStatus::Failed);

        let delivered = next(&mut rx).await;
        assert_eq!(delivered.id, process.id);
        assert_eq!(delivered.error, "disk full");
    }

    #[tokio::test]
    #[serial]
    async fn test_environment_is_sanitized() {
        std::env::set_var("DYLD_BACKSMITH_PROBE", "leaked");
        let (_dir, runner, mut rx) = runner();
        let id = ProcessRunner::new_command_id();

        runner
            .execute(
                &id,
                sh("echo \"$LD_LIBRARY_PATH|${DYLD_BACKSMITH_PROBE:-unset}|${LD_PRELOAD:-unset}\""),
                ProcessType::Backup,
                ProcessArgs::new(),
            )
            .unwrap();

        let done = next(&mut rx).await;
        std::env::remove_var("DYLD_BACKSMITH_PROBE");

        assert_eq!(done.output.trim(), format!("{}|unset|unset", SAFE_PATH));
    }

    #[test]
    fn test_registry() {
        let registry = ProcessRegistry::default();
        registry.register("a", 10);
        registry.register("b", 11);
        assert_eq!(registry.lookup("a"), Some(10));
        assert_eq!(registry.len(), 2);
        registry.unregister("a");
        assert_eq!(registry.lookup("a"), None);
        assert_eq!(registry.len(), 1);
    }
}
