pub const SCHEMA_VERSION: &str = "1";

pub const CREATE_SCHEMA_SQL: &str = r#"
BEGIN TRANSACTION;

CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', '1');

-- Every OS command (or in-process operation) run by a privileged service.
-- Multi-step commands write one row per step, all sharing command_id.
CREATE TABLE IF NOT EXISTS processes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command_id TEXT NOT NULL,           -- Correlation token handed back to callers
    command TEXT NOT NULL,              -- Rendered command line
    pid INTEGER DEFAULT NULL,           -- OS pid (NULL if the spawn failed or in-process)
    status TEXT NOT NULL,               -- running | success | failed
    output TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL DEFAULT '',
    return_code INTEGER DEFAULT NULL,
    start_time INTEGER NOT NULL,        -- Unix seconds (UTC)
    end_time INTEGER DEFAULT NULL,      -- Set iff status != running
    type TEXT NOT NULL,                 -- backup | restore | cleanup | cron-update | directory-delete
    args TEXT NOT NULL DEFAULT '{}'     -- JSON object
);

CREATE INDEX IF NOT EXISTS idx_processes_command_id ON processes (command_id, id);

CREATE TABLE IF NOT EXISTS schedules (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_type TEXT NOT NULL,          -- full | incremental
    frequency TEXT NOT NULL,            -- daily | weekly | monthly | hourly | interval
    hour INTEGER DEFAULT NULL,
    minute INTEGER DEFAULT NULL,
    day_of_week INTEGER DEFAULT NULL,
    day_of_month INTEGER DEFAULT NULL,
    interval_value INTEGER DEFAULT NULL,
    interval_unit TEXT DEFAULT NULL,    -- minutes | hours
    retention_value INTEGER DEFAULT NULL,
    retention_unit TEXT DEFAULT NULL,   -- days | weeks | months
    enabled BOOLEAN NOT NULL DEFAULT 1
);

-- Backup type is never stored: NULL from_backup_id means full.
CREATE TABLE IF NOT EXISTS backups (
    id TEXT PRIMARY KEY,                -- Also the directory name under the backup root
    from_backup_id TEXT DEFAULT NULL,
    schedule_id INTEGER DEFAULT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER DEFAULT NULL,
    process_id INTEGER DEFAULT NULL,
    size INTEGER DEFAULT NULL,
    FOREIGN KEY (from_backup_id) REFERENCES backups(id),
    FOREIGN KEY (schedule_id) REFERENCES schedules(id),
    FOREIGN KEY (process_id) REFERENCES processes(id)
);

CREATE INDEX IF NOT EXISTS idx_backups_parent ON backups (from_backup_id);
CREATE INDEX IF NOT EXISTS idx_backups_schedule ON backups (schedule_id, start_time);

CREATE TABLE IF NOT EXISTS restores (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    backup_id TEXT NOT NULL,            -- Chain root that was requested
    backup_timestamp INTEGER DEFAULT NULL, -- start_time of the latest chain member
    target TEXT NOT NULL,               -- database | folder
    target_path TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER DEFAULT NULL,
    process_id INTEGER NOT NULL UNIQUE,
    FOREIGN KEY (process_id) REFERENCES processes(id)
);

COMMIT;
"#;
