use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::config::CronConfig;
use crate::schedules::CronTiming;

const HEADER: &str = "# Managed by backsmith. Manual edits are overwritten.\n\
SHELL=/bin/sh\n\
PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n";

/// Full content of the managed cron file: header, the nightly retention
/// line and one line per schedule in the order given.
pub fn render(config: &CronConfig, schedules: &[(i64, CronTiming)]) -> String {
    let mut content = String::from(HEADER);
    content.push('\n');
    content.push_str(&format!(
        "{} {} * * * {} {} cleanup\n",
        config.cleanup_minute, config.cleanup_hour, config.user, config.binary
    ));

    for (id, timing) in schedules {
        content.push_str(&format!(
            "{} {} {} run-schedule {}\n",
            timing.expression(),
            config.user,
            config.binary,
            id
        ));
    }

    content
}

/// Replace `path` with `content` via a temp file in the same directory so
/// cron never reads a partial file.
pub fn write_atomically(path: &Path, content: &str) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    // cron.d ignores names containing a dot
    let mut temp = tempfile::Builder::new()
        .prefix(".backsmith-cron.")
        .suffix(".tmp")
        .tempfile_in(dir)?;

    temp.write_all(content.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o644))?;

    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
