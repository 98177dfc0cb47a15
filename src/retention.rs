use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Months, TimeDelta, Utc};
use log::{error, info, warn, Level};
use logging_timer::timer;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::backups::Backup;
use crate::chain::{BackupChain, BackupGraph};
use crate::client::SocketClient;
use crate::database::Database;
use crate::error::BacksmithError;
use crate::processes::{Process, ProcessStatus};
use crate::protocol::SystemCommand;
use crate::schedules::Schedule;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RetentionUnit {
    Days,
    Weeks,
    Months,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub value: u32,
    pub unit: RetentionUnit,
}

impl RetentionPolicy {
    /// `now` minus the retention window. Months are calendar months, clamped
    /// to the end of shorter months.
    /// Windows reaching past the representable range clamp to the earliest
    /// instant, which selects nothing.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let value = i64::from(self.value);
        let earlier = match self.unit {
            RetentionUnit::Days => Self::days_before(now, value),
            RetentionUnit::Weeks => Self::days_before(now, value * 7),
            RetentionUnit::Months => now.checked_sub_months(Months::new(self.value)),
        };
        earlier.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn days_before(now: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
        TimeDelta::try_days(days).and_then(|delta| now.checked_sub_signed(delta))
    }
}

/// Removes backup directories on behalf of the retention engine.
///
/// Per-directory success is judged afterwards by whether the directory is
/// still there, so an error here does not by itself fail every member.
pub trait DirectoryRemover {
    fn remove(&self, backup_ids: &[String], folders: &[PathBuf]) -> Result<(), BacksmithError>;
}

/// Sends `cleanup_backups` to the privileged system service and waits for the
/// resulting process to finish.
pub struct SocketRemover {
    client: SocketClient,
    db: Database,
    poll_interval: Duration,
    max_wait: Duration,
}

impl SocketRemover {
    pub fn new(client: SocketClient, db: Database, poll_interval: Duration, max_wait: Duration) -> Self {
        SocketRemover {
            client,
            db,
            poll_interval,
            max_wait,
        }
    }

    fn wait_for(&self, command_id: &str) -> Result<Process, BacksmithError> {
        let deadline = Instant::now() + self.max_wait;
        loop {
            let conn = self.db.get_connection()?;
            if let Some(process) = Process::get_by_command_id(&conn, command_id)? {
                if process.status.is_terminal() {
                    return Ok(process);
                }
            }
            drop(conn);

            if Instant::now() >= deadline {
                return Err(BacksmithError::Error(format!(
                    "Timed out waiting for cleanup command {}",
                    command_id
                )));
            }
            thread::sleep(self.poll_interval);
        }
    }
}

impl DirectoryRemover for SocketRemover {
    fn remove(&self, backup_ids: &[String], folders: &[PathBuf]) -> Result<(), BacksmithError> {
        let command = SystemCommand::CleanupBackups {
            backup_ids: backup_ids.to_vec(),
            folders: folders
                .iter()
                .map(|f| f.to_string_lossy().into_owned())
                .collect(),
        };

        let response = self.client.send(&command)?;
        let command_id = match (response.code, response.id) {
            (202, Some(id)) => id,
            (code, _) => {
                return Err(BacksmithError::Error(format!(
                    "cleanup_backups rejected with {}: {}",
                    code,
                    response.message.unwrap_or_default()
                )))
            }
        };

        let process = self.wait_for(&command_id)?;
        match process.status {
            ProcessStatus::Success => Ok(()),
            _ => Err(BacksmithError::Error(format!(
                "cleanup command {} failed with code {:?}: {}",
                command_id,
                process.return_code,
                process.error.trim()
            ))),
        }
    }
}

/// Outcome of one retention pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub chains: usize,
    pub deleted: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.errors.is_empty()
    }
}

pub struct RetentionEngine<R: DirectoryRemover> {
    db: Database,
    backup_root: PathBuf,
    remover: R,
}

impl<R: DirectoryRemover> RetentionEngine<R> {
    pub fn new(db: Database, backup_root: &Path, remover: R) -> Self {
        RetentionEngine {
            db,
            backup_root: backup_root.to_path_buf(),
            remover,
        }
    }

    /// Chains of every retention-bearing schedule, enabled or not, whose
    /// members all started before that schedule's cutoff. Schedules whose backups cannot be
    /// grouped are reported in the returned error list and skipped.
    pub fn select_expired(
        &self,
        graph: &BackupGraph,
        now: DateTime<Utc>,
    ) -> Result<(Vec<BackupChain>, Vec<String>), BacksmithError> {
        let conn = self.db.get_connection()?;
        let schedules = Schedule::list_with_retention(&conn)?;

        let mut selected: Vec<BackupChain> = Vec::new();
        let mut seen_roots = HashSet::new();
        let mut errors = Vec::new();

        for schedule in schedules {
            let policy = match schedule.retention() {
                Ok(Some(policy)) => policy,
                Ok(None) => continue,
                Err(e) => {
                    error!("Schedule {}: invalid retention policy: {}", schedule.id, e);
                    errors.push(format!("schedule {}: {}", schedule.id, e));
                    continue;
                }
            };
            let cutoff = policy.cutoff(now).timestamp();

            let chains = match graph.chains_for_schedule(schedule.id) {
                Ok(chains) => chains,
                Err(e) => {
                    error!("Schedule {}: cannot group backups: {}", schedule.id, e);
                    errors.push(format!("schedule {}: {}", schedule.id, e));
                    continue;
                }
            };

            for chain in chains {
                if chain.is_expired(cutoff) && seen_roots.insert(chain.root().id.clone()) {
                    info!(
                        "Schedule {}: chain rooted at '{}' ({} backups) is past retention",
                        schedule.id,
                        chain.root().id,
                        chain.members().len()
                    );
                    selected.push(chain);
                }
            }
        }

        Ok((selected, errors))
    }

    /// Delete every expired chain as one batch: directories first, then rows.
    pub fn run(&self, now: DateTime<Utc>) -> Result<CleanupReport, BacksmithError> {
        let _tmr = timer!(Level::Trace; "RetentionEngine::run");

        let graph = {
            let conn = self.db.get_connection()?;
            BackupGraph::load(&conn)?
        };

        let (chains, errors) = self.select_expired(&graph, now)?;
        let mut report = CleanupReport {
            chains: chains.len(),
            errors,
            ..CleanupReport::default()
        };

        let members: Vec<&Backup> = chains.iter().flat_map(|c| c.members()).collect();
        if members.is_empty() {
            info!("Retention: nothing to delete");
            return Ok(report);
        }

        let ids: Vec<String> = chains.iter().flat_map(|c| c.ids()).collect();
        let folders: Vec<PathBuf> = members
            .iter()
            .map(|b| self.backup_root.join(&b.id))
            .collect();

        if let Err(e) = self.remover.remove(&ids, &folders) {
            warn!("Retention: directory removal reported an error: {}", e);
            report.errors.push(e.to_string());
        }

        let removed: HashSet<String> = members
            .iter()
            .zip(&folders)
            .filter(|(_, folder)| !folder.exists())
            .map(|(b, _)| b.id.clone())
            .collect();

        let deletable = Self::deletable_rows(&graph, &removed);
        let ordered = Self::children_first(&chains, deletable);

        let deleted = {
            let conn = self.db.get_connection()?;
            Database::immediate_transaction(&conn, |c| Backup::delete_many(c, &ordered))?
        };

        report.deleted = deleted;
        report.failed = members.len() - deleted;

        if report.is_success() {
            info!(
                "Retention: deleted {} backups from {} chains",
                report.deleted, report.chains
            );
        } else {
            error!(
                "Retention: deleted {} backups, {} failed ({} errors)",
                report.deleted,
                report.failed,
                report.errors.len()
            );
        }

        Ok(report)
    }

    /// A row may go only if its directory is gone and none of its children
    /// stay behind.
    fn deletable_rows(graph: &BackupGraph, removed: &HashSet<String>) -> HashSet<String> {
        let mut deletable = removed.clone();
        loop {
            let blocked: Vec<String> = deletable
                .iter()
                .filter(|id| {
                    graph
                        .children_of(id)
                        .iter()
                        .any(|child| !deletable.contains(&child.id))
                })
                .cloned()
                .collect();

            if blocked.is_empty() {
                return deletable;
            }
            for id in blocked {
                deletable.remove(&id);
            }
        }
    }

    /// Deepest members first so no row outlives a child that references it.
    fn children_first(chains: &[BackupChain], ids: HashSet<String>) -> Vec<String> {
        let depth = |id: &str| chains.iter().find_map(|c| c.depth_of(id)).unwrap_or(0);

        let mut ordered: Vec<(usize, String)> = ids.into_iter().map(|id| (depth(&id), id)).collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ordered.into_iter().map(|(_, id)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backups::test_support::backup;
    use crate::chain::resolve_chain;
    use crate::database::test_support::temp_database;
    use crate::schedules::test_support::daily_schedule;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use std::fs;

    /// Removes directories in-process, optionally refusing some of them.
    struct LocalRemover {
        refuse: Vec<String>,
        calls: RefCell<usize>,
    }

    impl LocalRemover {
        fn new() -> Self {
            LocalRemover {
                refuse: Vec::new(),
                calls: RefCell::new(0),
            }
        }
    }

    impl DirectoryRemover for LocalRemover {
        fn remove(&self, backup_ids: &[String], folders: &[PathBuf]) -> Result<(), BacksmithError> {
            *self.calls.borrow_mut() += 1;
            let mut failed = false;
            for (id, folder) in backup_ids.iter().zip(folders) {
                if self.refuse.contains(id) {
                    failed = true;
                    continue;
                }
                fs::remove_dir_all(folder)?;
            }
            if failed {
                return Err(BacksmithError::Error("some folders were refused".into()));
            }
            Ok(())
        }
    }

    const DAY: i64 = 86_400;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 16, 12, 0, 0).unwrap()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        root: tempfile::TempDir,
        db: Database,
        schedule_id: i64,
    }

    impl Fixture {
        fn new(retention: Option<(i64, RetentionUnit)>) -> Self {
            let (dir, db) = temp_database();
            let root = tempfile::tempdir().unwrap();
            let schedule_id = {
                let conn = db.get_connection().unwrap();
                Schedule::create(&conn, &daily_schedule(retention)).unwrap()
            };
            Fixture {
                _dir: dir,
                root,
                db,
                schedule_id,
            }
        }

        fn add(&self, id: &str, parent: Option<&str>, start: i64) {
            let conn = self.db.get_connection().unwrap();
            Backup::create(&conn, &backup(id, parent, Some(self.schedule_id), start)).unwrap();
            let dir = self.root.path().join(id);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("xtrabackup_checkpoints"), "backup_type = full-backuped").unwrap();
        }

        fn backdate(&self, id: &str, start: i64) {
            let conn = self.db.get_connection().unwrap();
            conn.execute("UPDATE backups SET start_time = ? WHERE id = ?", rusqlite::params![start, id])
                .unwrap();
        }

        fn engine<R: DirectoryRemover>(&self, remover: R) -> RetentionEngine<R> {
            RetentionEngine::new(self.db.clone(), self.root.path(), remover)
        }

        fn remaining(&self) -> Vec<String> {
            let conn = self.db.get_connection().unwrap();
            Backup::list_all(&conn).unwrap().into_iter().map(|b| b.id).collect()
        }
    }

    #[test]
    fn test_cutoff_units() {
        let days = RetentionPolicy { value: 7, unit: RetentionUnit::Days };
        assert_eq!(days.cutoff(now()), Utc.with_ymd_and_hms(2026, 10, 9, 12, 0, 0).unwrap());

        let weeks = RetentionPolicy { value: 2, unit: RetentionUnit::Weeks };
        assert_eq!(weeks.cutoff(now()), Utc.with_ymd_and_hms(2026, 10, 2, 12, 0, 0).unwrap());

        let months = RetentionPolicy { value: 1, unit: RetentionUnit::Months };
        assert_eq!(months.cutoff(now()), Utc.with_ymd_and_hms(2026, 9, 16, 12, 0, 0).unwrap());

        let end_of_month = Utc.with_ymd_and_hms(2026, 3, 31, 0, 0, 0).unwrap();
        assert_eq!(
            months.cutoff(end_of_month),
            Utc.with_ymd_and_hms(2026, 2, 28, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_cutoff_beyond_calendar_clamps_to_earliest() {
        for unit in [RetentionUnit::Days, RetentionUnit::Weeks, RetentionUnit::Months] {
            let policy = RetentionPolicy { value: u32::MAX, unit };
            assert_eq!(policy.cutoff(now()), DateTime::<Utc>::MIN_UTC);
        }

        let large = RetentionPolicy { value: 200_000_000, unit: RetentionUnit::Days };
        assert_eq!(large.cutoff(now()), DateTime::<Utc>::MIN_UTC);
    }

    #[test]
    fn test_children_first_orders_by_depth() {
        let graph = BackupGraph::new(vec![
            backup("F", None, Some(1), 100),
            backup("I1", Some("F"), Some(1), 200),
            backup("I2", Some("I1"), Some(1), 300),
            backup("J1", Some("F"), Some(1), 250),
        ]);
        let chains = graph.chains_for_schedule(1).unwrap();
        let ids: HashSet<String> = ["F", "I1", "I2", "J1"].iter().map(|s| s.to_string()).collect();

        let ordered = RetentionEngine::<LocalRemover>::children_first(&chains, ids);
        assert_eq!(ordered, vec!["I2", "I1", "J1", "F"]);
    }

    #[test]
    fn test_end_to_end_chain_retention() {
        let fx = Fixture::new(Some((7, RetentionUnit::Days)));
        let t = now().timestamp();
        fx.add("F", None, t - 3 * DAY);
        fx.add("I1", Some("F"), t - 2 * DAY);
        fx.add("I2", Some("I1"), t - DAY);

        {
            let conn = fx.db.get_connection().unwrap();
            let chain = resolve_chain(&conn, "I2").unwrap();
            let ids: Vec<&str> = chain.iter().map(|b| b.id.as_str()).collect();
            assert_eq!(ids, vec!["F", "I1", "I2"]);
        }

        fx.backdate("F", t - 10 * DAY);
        fx.backdate("I1", t - 10 * DAY);

        let report = fx.engine(LocalRemover::new()).run(now()).unwrap();
        assert_eq!(report, CleanupReport::default());
        assert_eq!(fx.remaining().len(), 3);
        assert!(fx.root.path().join("F").exists());

        fx.backdate("I2", t - 10 * DAY);

        let report = fx.engine(LocalRemover::new()).run(now()).unwrap();
        assert!(report.is_success());
        assert_eq!(report.chains, 1);
        assert_eq!(report.deleted, 3);
        assert!(fx.remaining().is_empty());
        for id in ["F", "I1", "I2"] {
            assert!(!fx.root.path().join(id).exists());
        }
    }

    #[test]
    fn test_no_retention_policy_keeps_everything() {
        let fx = Fixture::new(None);
        let t = now().timestamp();
        fx.add("F", None, t - 400 * DAY);

        let remover = LocalRemover::new();
        let engine = fx.engine(remover);
        let report = engine.run(now()).unwrap();
        assert_eq!(report.chains, 0);
        assert_eq!(*engine.remover.calls.borrow(), 0);
        assert_eq!(fx.remaining(), vec!["F"]);
    }

    #[test]
    fn test_only_expired_chains_are_selected() {
        let fx = Fixture::new(Some((1, RetentionUnit::Weeks)));
        let t = now().timestamp();
        fx.add("old", None, t - 30 * DAY);
        fx.add("old-inc", Some("old"), t - 29 * DAY);
        fx.add("new", None, t - 2 * DAY);

        let report = fx.engine(LocalRemover::new()).run(now()).unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(fx.remaining(), vec!["new"]);
    }

    #[test]
    fn test_partial_failure_is_tallied_and_keeps_parents() {
        let fx = Fixture::new(Some((7, RetentionUnit::Days)));
        let t = now().timestamp();
        fx.add("F", None, t - 20 * DAY);
        fx.add("I1", Some("F"), t - 19 * DAY);
        fx.add("I2", Some("I1"), t - 18 * DAY);

        let remover = LocalRemover {
            refuse: vec!["I2".to_string()],
            calls: RefCell::new(0),
        };
        let report = fx.engine(remover).run(now()).unwrap();

        assert!(!report.is_success());
        assert_eq!(report.deleted, 0);
        assert_eq!(report.failed, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(fx.remaining().len(), 3);
        assert!(fx.root.path().join("I2").exists());
    }

    #[test]
    fn test_partial_failure_on_root_still_deletes_children() {
        let fx = Fixture::new(Some((7, RetentionUnit::Days)));
        let t = now().timestamp();
        fx.add("F", None, t - 20 * DAY);
        fx.add("I1", Some("F"), t - 19 * DAY);

        let remover = LocalRemover {
            refuse: vec!["F".to_string()],
            calls: RefCell::new(0),
        };
        let report = fx.engine(remover).run(now()).unwrap();

        assert_eq!(report.deleted, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(fx.remaining(), vec!["F"]);
    }

    #[test]
    fn test_disabled_schedule_still_expires() {
        let fx = Fixture::new(Some((7, RetentionUnit::Days)));
        {
            let conn = fx.db.get_connection().unwrap();
            conn.execute("UPDATE schedules SET enabled = 0 WHERE id = ?", [fx.schedule_id])
                .unwrap();
        }
        let t = now().timestamp();
        fx.add("F", None, t - 30 * DAY);

        let report = fx.engine(LocalRemover::new()).run(now()).unwrap();
        assert_eq!(report.deleted, 1);
        assert!(fx.remaining().is_empty());
    }

    #[test]
    fn test_out_of_range_retention_is_reported_and_keeps_backups() {
        let fx = Fixture::new(Some((4_294_967_297, RetentionUnit::Days)));
        let t = now().timestamp();
        fx.add("F", None, t - 30 * DAY);

        let report = fx.engine(LocalRemover::new()).run(now()).unwrap();
        assert_eq!(report.chains, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("retention_value out of range"));
        assert_eq!(fx.remaining(), vec!["F"]);
    }

    #[test]
    fn test_broken_schedule_is_reported_not_looped() {
        let fx = Fixture::new(Some((7, RetentionUnit::Days)));
        let t = now().timestamp();
        fx.add("A", None, t - 20 * DAY);
        fx.add("B", Some("A"), t - 19 * DAY);
        {
            let conn = fx.db.get_connection().unwrap();
            conn.execute("UPDATE backups SET from_backup_id = 'B' WHERE id = 'A'", [])
                .unwrap();
        }

        let report = fx.engine(LocalRemover::new()).run(now()).unwrap();
        assert_eq!(report.chains, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(!report.is_success());
        assert_eq!(fx.remaining().len(), 2);
    }
}
