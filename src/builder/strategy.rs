use std::path::Path;

use crate::runner::OsCommand;

/// Prepare and copy-back invocations differ between backup tool
/// generations. One implementation is chosen at startup.
pub trait RestoreStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Prepare `staging`, optionally applying `incremental` on top of it.
    /// `log_only` defers the rollback phase so further increments can follow.
    fn prepare(&self, staging: &Path, incremental: Option<&Path>, log_only: bool) -> OsCommand;

    fn copy_back(&self, staging: &Path, data_dir: &Path) -> OsCommand;
}

fn path_arg(flag: &str, path: &Path) -> String {
    format!("{}={}", flag, path.display())
}

/// xtrabackup 8.0 and later.
pub struct ModernStrategy {
    tool: String,
    defaults_file: String,
}

impl ModernStrategy {
    pub fn new(tool: &str, defaults_file: &str) -> Self {
        ModernStrategy {
            tool: tool.to_string(),
            defaults_file: defaults_file.to_string(),
        }
    }
}

impl RestoreStrategy for ModernStrategy {
    fn name(&self) -> &'static str {
        "modern"
    }

    fn prepare(&self, staging: &Path, incremental: Option<&Path>, log_only: bool) -> OsCommand {
        let mut cmd = OsCommand::new(&self.tool)
            .arg(format!("--defaults-file={}", self.defaults_file))
            .arg("--prepare");
        if log_only {
            cmd = cmd.arg("--apply-log-only");
        }
        cmd = cmd.arg(path_arg("--target-dir", staging));
        if let Some(inc) = incremental {
            cmd = cmd.arg(path_arg("--incremental-dir", inc));
        }
        cmd
    }

    fn copy_back(&self, staging: &Path, data_dir: &Path) -> OsCommand {
        OsCommand::new(&self.tool)
            .arg(format!("--defaults-file={}", self.defaults_file))
            .arg("--copy-back")
            .arg(path_arg("--target-dir", staging))
            .arg(path_arg("--datadir", data_dir))
    }
}

/// The `innobackupex` wrapper shipped with 2.x tools. Used whenever the
/// installed version cannot be established.
pub struct LegacyStrategy {
    defaults_file: String,
}

impl LegacyStrategy {
    pub fn new(defaults_file: &str) -> Self {
        LegacyStrategy {
            defaults_file: defaults_file.to_string(),
        }
    }
}

impl RestoreStrategy for LegacyStrategy {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn prepare(&self, staging: &Path, incremental: Option<&Path>, log_only: bool) -> OsCommand {
        let mut cmd = OsCommand::new("innobackupex")
            .arg(format!("--defaults-file={}", self.defaults_file))
            .arg("--apply-log");
        if log_only {
            cmd = cmd.arg("--redo-only");
        }
        cmd = cmd.arg(staging.to_string_lossy());
        if let Some(inc) = incremental {
            cmd = cmd.arg(path_arg("--incremental-dir", inc));
        }
        cmd
    }

    fn copy_back(&self, staging: &Path, _data_dir: &Path) -> OsCommand {
        OsCommand::new("innobackupex")
            .arg(format!("--defaults-file={}", self.defaults_file))
            .arg("--copy-back")
            .arg(staging.to_string_lossy())
    }
}
