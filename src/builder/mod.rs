pub mod cron;
mod strategy;

pub use strategy::{LegacyStrategy, ModernStrategy, RestoreStrategy};

use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{info, warn};

use crate::config::{BackupConfig, RestoreConfig};
use crate::restores::RestoreTarget;
use crate::runner::{quote, quote_path, OsCommand};

/// Dotted tool version. Missing components count as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// First token of `text` that looks like `N.N` or `N.N.N`. Suffixes such
    /// as `-30` are ignored.
    pub fn parse(text: &str) -> Option<Version> {
        text.split_whitespace().find_map(|token| {
            let numeric: String = token
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.')
                .collect();
            let parts: Vec<&str> = numeric.trim_end_matches('.').split('.').collect();
            if parts.len() < 2 || parts.len() > 3 {
                return None;
            }
            let mut nums = [0u32; 3];
            for (slot, part) in nums.iter_mut().zip(&parts) {
                *slot = part.parse().ok()?;
            }
            Some(Version {
                major: nums[0],
                minor: nums[1],
                patch: nums[2],
            })
        })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Ask the backup tool for its version. The tool prints it on stderr.
pub fn probe_version(tool: &str) -> Option<Version> {
    let output = Command::new(tool).arg("--version").output().ok()?;
    let text = format!(
        "{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    Version::parse(&text)
}

/// Pick the strategy for `detected`; unknown versions get the legacy one.
pub fn select_strategy(
    detected: Option<Version>,
    backup: &BackupConfig,
    restore: &RestoreConfig,
) -> Box<dyn RestoreStrategy> {
    let threshold = Version::parse(&restore.version_threshold).unwrap_or(Version {
        major: 8,
        minor: 0,
        patch: 0,
    });

    match detected {
        Some(version) if version.cmp(&threshold) != Ordering::Less => {
            info!("Backup tool version {} selects the modern restore strategy", version);
            Box::new(ModernStrategy::new(&backup.tool, &backup.credentials_file))
        }
        Some(version) => {
            info!("Backup tool version {} selects the legacy restore strategy", version);
            Box::new(LegacyStrategy::new(&backup.credentials_file))
        }
        None => {
            warn!("Could not determine backup tool version; using the legacy restore strategy");
            Box::new(LegacyStrategy::new(&backup.credentials_file))
        }
    }
}

/// Ordered steps of one restore, all run under the same command id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestorePlan {
    pub staging_dir: PathBuf,
    pub commands: Vec<OsCommand>,
}

pub struct CommandBuilder {
    backup: BackupConfig,
    restore: RestoreConfig,
    strategy: Box<dyn RestoreStrategy>,
}

impl CommandBuilder {
    pub fn new(backup: BackupConfig, restore: RestoreConfig, strategy: Box<dyn RestoreStrategy>) -> Self {
        CommandBuilder {
            backup,
            restore,
            strategy,
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    pub fn full_backup(&self, backup_id: &str) -> OsCommand {
        self.backup_command(backup_id, None)
    }

    pub fn incremental_backup(&self, backup_id: &str, from_backup_id: &str) -> OsCommand {
        self.backup_command(backup_id, Some(from_backup_id))
    }

    fn backup_command(&self, backup_id: &str, base_id: Option<&str>) -> OsCommand {
        let target = self.backup.backup_dir(backup_id);
        let mut args = vec![
            format!("--defaults-file={}", self.backup.credentials_file),
            "--backup".to_string(),
            format!("--target-dir={}", target.display()),
        ];
        if let Some(base) = base_id {
            args.push(format!(
                "--incremental-basedir={}",
                self.backup.backup_dir(base).display()
            ));
        }

        let streaming = &self.backup.streaming;
        if !streaming.enabled {
            return OsCommand::new(&self.backup.tool).args(args);
        }

        // The backup directory keeps the LSN checkpoints so later
        // incrementals can use it as their base.
        args.push(format!("--extra-lsndir={}", target.display()));

        let mut script = format!("mkdir -p -- {} && {}", quote_path(&target), quote(&self.backup.tool));
        for arg in &args {
            script.push(' ');
            script.push_str(&quote(arg));
        }
        script.push_str(" --stream=xbstream");

        if !streaming.compress_command.trim().is_empty() {
            script.push_str(" | ");
            script.push_str(streaming.compress_command.trim());
        }

        if !streaming.forward_command.trim().is_empty() {
            script.push_str(" | ");
            script.push_str(streaming.forward_command.trim());
        } else {
            script.push_str(" > ");
            script.push_str(&quote_path(&target.join(&streaming.output_name)));
        }

        OsCommand::pipeline(script)
    }

    /// Steps for restoring `chain` (full backup first). Folder restores end
    /// after the last prepare; database restores add a copy-back.
    pub fn restore_plan(&self, command_id: &str, chain: &[String], target: RestoreTarget) -> RestorePlan {
        let staging = self.staging_dir(command_id);
        let mut commands = Vec::with_capacity(chain.len() + 2);

        if let Some((full, increments)) = chain.split_first() {
            commands.push(
                OsCommand::new("cp")
                    .arg("-a")
                    .arg(self.backup.backup_dir(full).to_string_lossy())
                    .arg(staging.to_string_lossy()),
            );

            commands.push(self.strategy.prepare(&staging, None, !increments.is_empty()));

            for (index, inc) in increments.iter().enumerate() {
                let is_last = index + 1 == increments.len();
                let inc_dir = self.backup.backup_dir(inc);
                commands.push(self.strategy.prepare(&staging, Some(&inc_dir), !is_last));
            }
        }

        if target == RestoreTarget::Database {
            commands.push(
                self.strategy.copy_back(&staging, self.data_dir()),
            );
        }

        RestorePlan {
            staging_dir: staging,
            commands,
        }
    }

    pub fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.backup.backup_dir(backup_id)
    }

    pub fn data_dir(&self) -> &Path {
        Path::new(&self.backup.data_dir)
    }

    pub fn staging_dir(&self, command_id: &str) -> PathBuf {
        Path::new(&self.restore.staging_root).join(format!("restore-{}", command_id))
    }

    pub fn delete_paths<S: AsRef<str>>(&self, paths: &[S]) -> OsCommand {
        OsCommand::new("rm")
            .arg("-rf")
            .arg("--")
            .args(paths.iter().map(|p| p.as_ref().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StreamingConfig};
    use pretty_assertions::assert_eq;

    fn builder_with(strategy: Box<dyn RestoreStrategy>) -> CommandBuilder {
        let config = Config::default();
        CommandBuilder::new(config.backup, config.restore, strategy)
    }

    fn modern() -> CommandBuilder {
        let config = Config::default();
        builder_with(Box::new(ModernStrategy::new(
            &config.backup.tool,
            &config.backup.credentials_file,
        )))
    }

    fn chain(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("b{}", i)).collect()
    }

    #[test]
    fn test_version_parse() {
        assert_eq!(
            Version::parse("xtrabackup version 8.0.35-30 based on MySQL server 8.0.35"),
            Some(Version { major: 8, minor: 0, patch: 35 })
        );
        assert_eq!(
            Version::parse("2.4"),
            Some(Version { major: 2, minor: 4, patch: 0 })
        );
        assert_eq!(Version::parse("no digits here"), None);
        assert_eq!(Version::parse("8"), None);
    }

    #[test]
    fn test_strategy_selection() {
        let config = Config::default();
        let pick = |v: Option<Version>| select_strategy(v, &config.backup, &config.restore).name();

        assert_eq!(pick(Version::parse("8.0.0")), "modern");
        assert_eq!(pick(Version::parse("8.4.1")), "modern");
        assert_eq!(pick(Version::parse("2.4.29")), "legacy");
        assert_eq!(pick(None), "legacy");
    }

    #[test]
    fn test_backup_commands() {
        let b = modern();
        assert_eq!(
            b.full_backup("full-1").to_string(),
            "xtrabackup --defaults-file=/etc/backsmith/my.cnf --backup --target-dir=/var/backups/backsmith/full-1"
        );
        assert!(b
            .incremental_backup("inc-1", "full-1")
            .to_string()
            .ends_with("--incremental-basedir=/var/backups/backsmith/full-1"));
    }

    fn streaming_builder(root: &Path, tool: &str, compress: &str, forward: &str) -> CommandBuilder {
        let mut config = Config::default();
        config.backup.root = root.to_string_lossy().into_owned();
        config.backup.tool = tool.to_string();
        config.backup.streaming = StreamingConfig {
            enabled: true,
            compress_command: compress.into(),
            forward_command: forward.into(),
            output_name: "full.xbstream.zst".into(),
        };
        CommandBuilder::new(
            config.backup,
            config.restore,
            Box::new(LegacyStrategy::new("/etc/my.cnf")),
        )
    }

    #[test]
    fn test_streaming_pipeline() {
        let b = streaming_builder(Path::new("/var/backups/backsmith"), "xtrabackup", "zstd -q", "");

        let cmd = b.full_backup("full-1");
        assert_eq!(cmd.program(), "/bin/bash");
        assert_eq!(&cmd.arguments()[..3], &["-o", "pipefail", "-c"]);
        let script = &cmd.arguments()[3];
        assert!(script.starts_with("mkdir -p -- /var/backups/backsmith/full-1 && xtrabackup "));
        assert!(script.contains("--extra-lsndir=/var/backups/backsmith/full-1"));
        assert!(script.ends_with(
            "--stream=xbstream | zstd -q > /var/backups/backsmith/full-1/full.xbstream.zst"
        ));
    }

    #[test]
    fn test_streaming_forward_replaces_file_sink() {
        let b = streaming_builder(Path::new("/var/backups/backsmith"), "xtrabackup", "", "ssh vault 'cat > x'");
        let script = b.incremental_backup("inc-1", "full-1").arguments()[3].clone();
        assert!(script.contains("--incremental-basedir=/var/backups/backsmith/full-1"));
        assert!(script.ends_with("--stream=xbstream | ssh vault 'cat > x'"));
        assert!(!script.contains(" > /var/backups"));
    }

    mod streaming_runs {
        use super::*;
        use pretty_assertions::assert_eq;
        use crate::database::test_support::temp_database;
        use crate::processes::{Process, ProcessArgs, ProcessStatus, ProcessType};
        use crate::runner::ProcessRunner;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Duration;
        use tokio::sync::mpsc::unbounded_channel;

        fn fake_tool(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("fake-xtrabackup");
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        async fn run(builder: &CommandBuilder) -> Process {
            let (_db_dir, db) = temp_database();
            let (tx, mut rx) = unbounded_channel();
            let runner = ProcessRunner::new(db, tx, "/usr/lib:/lib");
            runner
                .execute(
                    &ProcessRunner::new_command_id(),
                    builder.full_backup("full-1"),
                    ProcessType::Backup,
                    ProcessArgs::new(),
                )
                .unwrap();
            tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .unwrap()
                .unwrap()
        }

        #[tokio::test]
        async fn test_stream_lands_in_new_backup_directory() {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("backups");
            let tool = fake_tool(dir.path(), "echo stream-data");
            let b = streaming_builder(&root, &tool.to_string_lossy(), "cat", "");

            let done = run(&b).await;
            assert_eq!(done.status, ProcessStatus::Success, "{}", done.error);
            let written = fs::read_to_string(root.join("full-1").join("full.xbstream.zst")).unwrap();
            assert_eq!(written.trim(), "stream-data");
        }

        #[tokio::test]
        async fn test_failing_tool_fails_the_pipeline() {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("backups");
            let tool = fake_tool(dir.path(), "echo partial; exit 3");
            let b = streaming_builder(&root, &tool.to_string_lossy(), "cat", "");

            let done = run(&b).await;
            assert_eq!(done.status, ProcessStatus::Failed);
            assert_eq!(done.return_code, Some(3));
        }
    }

    #[test]
    fn test_restore_step_counts() {
        let b = modern();
        for n in 1..5 {
            let db = b.restore_plan("c", &chain(n), RestoreTarget::Database);
            assert_eq!(db.commands.len(), n + 2);
            let folder = b.restore_plan("c", &chain(n), RestoreTarget::Folder);
            assert_eq!(folder.commands.len(), n + 1);
        }
    }

    #[test]
    fn test_restore_log_only_on_all_but_last_prepare() {
        let b = modern();
        let plan = b.restore_plan("abc", &chain(3), RestoreTarget::Folder);

        assert_eq!(plan.staging_dir, PathBuf::from("/var/lib/backsmith/restore/restore-abc"));
        assert_eq!(
            plan.commands[0].to_string(),
            "cp -a /var/backups/backsmith/b0 /var/lib/backsmith/restore/restore-abc"
        );

        let prepares: Vec<String> = plan.commands[1..].iter().map(|c| c.to_string()).collect();
        assert_eq!(prepares.len(), 3);
        assert!(prepares[0].contains("--apply-log-only"));
        assert!(!prepares[0].contains("--incremental-dir"));
        assert!(prepares[1].contains("--apply-log-only"));
        assert!(prepares[1].contains("--incremental-dir=/var/backups/backsmith/b1"));
        assert!(!prepares[2].contains("--apply-log-only"));
        assert!(prepares[2].contains("--incremental-dir=/var/backups/backsmith/b2"));
    }

    #[test]
    fn test_single_full_restore_prepares_fully() {
        let b = modern();
        let plan = b.restore_plan("x", &chain(1), RestoreTarget::Database);
        assert!(!plan.commands[1].to_string().contains("--apply-log-only"));
        assert!(plan.commands[2].to_string().contains("--copy-back"));
    }

    #[test]
    fn test_delete_paths() {
        let b = modern();
        assert_eq!(
            b.delete_paths(&["/var/backups/backsmith/a", "/tmp/b c"]).to_string(),
            "rm -rf -- /var/backups/backsmith/a '/tmp/b c'"
        );
    }
}
