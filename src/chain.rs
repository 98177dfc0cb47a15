use std::collections::{HashMap, HashSet};

use log::Level;
use logging_timer::timer;
use rusqlite::Connection;

use crate::backups::Backup;
use crate::error::BacksmithError;

/// Walk `from_backup_id` links from `start_id` up to the full backup and
/// return the chain oldest-first.
///
/// Terminates on every input: a revisited id is reported as a cycle and a
/// parent the lookup cannot find as a dangling reference.
fn walk<F>(start_id: &str, mut lookup: F) -> Result<Vec<Backup>, BacksmithError>
where
    F: FnMut(&str) -> Result<Option<Backup>, BacksmithError>,
{
    let mut chain = Vec::new();
    let mut seen = HashSet::new();

    let mut current = lookup(start_id)?
        .ok_or_else(|| BacksmithError::Error(format!("Backup '{}' not found", start_id)))?;

    loop {
        if !seen.insert(current.id.clone()) {
            return Err(BacksmithError::IntegrityError(format!(
                "cycle detected at backup '{}' while resolving '{}'",
                current.id, start_id
            )));
        }

        let parent_id = current.from_backup_id.clone();
        chain.push(current);

        let Some(parent_id) = parent_id else {
            break;
        };

        current = lookup(&parent_id)?.ok_or_else(|| {
            BacksmithError::IntegrityError(format!(
                "backup '{}' references missing parent '{}'",
                chain.last().map(|b| b.id.as_str()).unwrap_or(start_id),
                parent_id
            ))
        })?;
    }

    chain.reverse();
    Ok(chain)
}

/// Resolve the chain ending at `backup_id` straight from the store.
pub fn resolve_chain(conn: &Connection, backup_id: &str) -> Result<Vec<Backup>, BacksmithError> {
    walk(backup_id, |id| Backup::get_by_id(conn, id))
}

/// A full backup and every incremental whose parent walk reaches it, ordered
/// by start time (the full backup first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupChain {
    members: Vec<Backup>,
    depths: HashMap<String, usize>,
}

impl BackupChain {
    pub fn root(&self) -> &Backup {
        &self.members[0]
    }

    pub fn members(&self) -> &[Backup] {
        &self.members
    }

    pub fn ids(&self) -> Vec<String> {
        self.members.iter().map(|b| b.id.clone()).collect()
    }

    /// Parent links between `backup_id` and the full backup (0 for the root).
    pub fn depth_of(&self, backup_id: &str) -> Option<usize> {
        self.depths.get(backup_id).copied()
    }

    /// True only if every member started before `cutoff`. A single recent
    /// member keeps the whole chain, full backup included.
    pub fn is_expired(&self, cutoff: i64) -> bool {
        self.members.iter().all(|b| b.start_time < cutoff)
    }
}

/// In-memory view of all backups for chain grouping.
pub struct BackupGraph {
    backups: HashMap<String, Backup>,
}

impl BackupGraph {
    pub fn new(backups: Vec<Backup>) -> Self {
        BackupGraph {
            backups: backups.into_iter().map(|b| (b.id.clone(), b)).collect(),
        }
    }

    pub fn load(conn: &Connection) -> Result<Self, BacksmithError> {
        Ok(Self::new(Backup::list_all(conn)?))
    }

    pub fn resolve(&self, backup_id: &str) -> Result<Vec<Backup>, BacksmithError> {
        walk(backup_id, |id| Ok(self.backups.get(id).cloned()))
    }

    /// Partition the backups of `schedule_id` into chains, one per full
    /// backup. Members from other schedules that hang off the same full
    /// backup are included so the chain is never split.
    pub fn chains_for_schedule(&self, schedule_id: i64) -> Result<Vec<BackupChain>, BacksmithError> {
        let _tmr = timer!(Level::Trace; "BackupGraph::chains_for_schedule", "schedule {}", schedule_id);

        let mut placed: HashMap<&str, (String, usize)> = HashMap::new();
        for backup in self.backups.values() {
            let ancestry = self.resolve(&backup.id)?;
            placed.insert(&backup.id, (ancestry[0].id.clone(), ancestry.len() - 1));
        }

        let roots_of_interest: HashSet<&str> = self
            .backups
            .values()
            .filter(|b| b.schedule_id == Some(schedule_id))
            .filter_map(|b| placed.get(b.id.as_str()).map(|(root, _)| root.as_str()))
            .collect();

        let mut by_root: HashMap<String, (Vec<Backup>, HashMap<String, usize>)> = HashMap::new();
        for backup in self.backups.values() {
            let Some((root, depth)) = placed.get(backup.id.as_str()) else {
                continue;
            };
            if roots_of_interest.contains(root.as_str()) {
                let (members, depths) = by_root.entry(root.clone()).or_default();
                members.push(backup.clone());
                depths.insert(backup.id.clone(), *depth);
            }
        }

        let mut chains: Vec<BackupChain> = by_root
            .into_iter()
            .map(|(root, (mut members, depths))| {
                members.sort_by(|a, b| {
                    let a_is_root = a.id == root;
                    let b_is_root = b.id == root;
                    b_is_root
                        .cmp(&a_is_root)
                        .then(a.start_time.cmp(&b.start_time))
                        .then(a.id.cmp(&b.id))
                });
                BackupChain { members, depths }
            })
            .collect();

        chains.sort_by(|a, b| {
            a.root()
                .start_time
                .cmp(&b.root().start_time)
                .then(a.root().id.cmp(&b.root().id))
        });

        Ok(chains)
    }

    /// Ids of every backup that has `backup_id` as its parent.
    pub fn children_of(&self, backup_id: &str) -> Vec<&Backup> {
        self.backups
            .values()
            .filter(|b| b.from_backup_id.as_deref() == Some(backup_id))
            .collect()
    }
}
