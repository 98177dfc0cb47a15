use std::str::FromStr;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::backups::BackupType;
use crate::error::BacksmithError;
use crate::retention::{RetentionPolicy, RetentionUnit};

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
    Hourly,
    Interval,
}

/// Interval unit for interval-based schedules
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IntervalUnit {
    Minutes,
    Hours,
}

impl IntervalUnit {
    /// Largest step that still fires more than once per enclosing cron field.
    fn max_step(self) -> i64 {
        match self {
            IntervalUnit::Minutes => 59,
            IntervalUnit::Hours => 23,
        }
    }
}

/// Validated timing of one schedule, ready to render as a cron expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronTiming {
    Daily { hour: u32, minute: u32 },
    Weekly { day_of_week: u32, hour: u32, minute: u32 },
    Monthly { day_of_month: u32, hour: u32, minute: u32 },
    Hourly { minute: u32 },
    Interval { value: u32, unit: IntervalUnit },
}

impl CronTiming {
    /// Five-field cron expression (minute hour day-of-month month day-of-week).
    pub fn expression(&self) -> String {
        match *self {
            CronTiming::Daily { hour, minute } => format!("{} {} * * *", minute, hour),
            CronTiming::Weekly {
                day_of_week,
                hour,
                minute,
            } => format!("{} {} * * {}", minute, hour, day_of_week),
            CronTiming::Monthly {
                day_of_month,
                hour,
                minute,
            } => format!("{} {} {} * *", minute, hour, day_of_month),
            CronTiming::Hourly { minute } => format!("{} * * * *", minute),
            CronTiming::Interval {
                value,
                unit: IntervalUnit::Minutes,
            } => format!("*/{} * * * *", value),
            CronTiming::Interval {
                value,
                unit: IntervalUnit::Hours,
            } => format!("0 */{} * * *", value),
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One schedule as carried by an `update_cron_schedules` request. Fields are
/// loosely typed so that range problems surface as validation messages
/// instead of parse failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronSchedule {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub frequency: Option<String>,
    #[serde(default)]
    pub hour: Option<i64>,
    #[serde(default)]
    pub minute: Option<i64>,
    #[serde(default)]
    pub day_of_week: Option<i64>,
    #[serde(default)]
    pub day_of_month: Option<i64>,
    #[serde(default)]
    pub interval_value: Option<i64>,
    #[serde(default)]
    pub interval_unit: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl CronSchedule {
    /// Check required fields and ranges for the schedule's frequency.
    pub fn timing(&self) -> Result<CronTiming, String> {
        if self.id.is_none() {
            return Err("id is required".to_string());
        }

        let frequency_str = self
            .frequency
            .as_deref()
            .ok_or_else(|| "frequency is required".to_string())?;
        let frequency = Frequency::from_str(frequency_str)
            .map_err(|_| format!("unknown frequency '{}'", frequency_str))?;

        match frequency {
            Frequency::Daily => Ok(CronTiming::Daily {
                hour: self.hour()?,
                minute: self.minute()?,
            }),
            Frequency::Weekly => {
                let day_of_week = Self::in_range("day_of_week", self.day_of_week, 0, 6)?;
                Ok(CronTiming::Weekly {
                    day_of_week,
                    hour: self.hour()?,
                    minute: self.minute()?,
                })
            }
            Frequency::Monthly => {
                let day_of_month = Self::in_range("day_of_month", self.day_of_month, 1, 31)?;
                Ok(CronTiming::Monthly {
                    day_of_month,
                    hour: self.hour()?,
                    minute: self.minute()?,
                })
            }
            Frequency::Hourly => Ok(CronTiming::Hourly {
                minute: self.minute()?,
            }),
            Frequency::Interval => {
                let unit_str = self
                    .interval_unit
                    .as_deref()
                    .ok_or_else(|| "interval_unit is required".to_string())?;
                let unit = IntervalUnit::from_str(unit_str).map_err(|_| {
                    format!(
                        "interval_unit must be 'minutes' or 'hours', got '{}'",
                        unit_str
                    )
                })?;
                let value =
                    Self::in_range("interval_value", self.interval_value, 1, unit.max_step())?;
                Ok(CronTiming::Interval { value, unit })
            }
        }
    }

    fn hour(&self) -> Result<u32, String> {
        Self::in_range("hour", self.hour, 0, 23)
    }

    fn minute(&self) -> Result<u32, String> {
        Self::in_range("minute", self.minute, 0, 59)
    }

    fn in_range(field: &str, value: Option<i64>, min: i64, max: i64) -> Result<u32, String> {
        let value = value.ok_or_else(|| format!("{} is required", field))?;
        if value < min || value > max {
            return Err(format!(
                "{} must be {}-{}, got: {}",
                field, min, max, value
            ));
        }
        Ok(value as u32)
    }
}

/// A backup schedule row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: i64,
    pub backup_type: BackupType,
    pub frequency: Frequency,
    pub hour: Option<i64>,
    pub minute: Option<i64>,
    pub day_of_week: Option<i64>,
    pub day_of_month: Option<i64>,
    pub interval_value: Option<i64>,
    pub interval_unit: Option<IntervalUnit>,
    pub retention_value: Option<i64>,
    pub retention_unit: Option<RetentionUnit>,
    pub enabled: bool,
}

const SCHEDULE_COLUMNS: &str = "id, backup_type, frequency, hour, minute, day_of_week,
    day_of_month, interval_value, interval_unit, retention_value, retention_unit, enabled";

impl Schedule {
    /// Retention policy, if both halves are set and the value is positive.
    /// Values that do not fit a `u32` are rejected rather than truncated.
    pub fn retention(&self) -> Result<Option<RetentionPolicy>, String> {
        match (self.retention_value, self.retention_unit) {
            (Some(value), Some(unit)) if value > 0 => {
                let value = u32::try_from(value)
                    .map_err(|_| format!("retention_value out of range: {}", value))?;
                Ok(Some(RetentionPolicy { value, unit }))
            }
            _ => Ok(None),
        }
    }

    /// Insert a schedule and return its id. The `id` field is ignored.
    pub fn create(conn: &Connection, schedule: &Schedule) -> Result<i64, BacksmithError> {
        let id: i64 = conn.query_row(
            "INSERT INTO schedules
                (backup_type, frequency, hour, minute, day_of_week, day_of_month,
                 interval_value, interval_unit, retention_value, retention_unit, enabled)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
            params![
                schedule.backup_type.as_ref(),
                schedule.frequency.as_ref(),
                schedule.hour,
                schedule.minute,
                schedule.day_of_week,
                schedule.day_of_month,
                schedule.interval_value,
                schedule.interval_unit.map(|u| u.to_string()),
                schedule.retention_value,
                schedule.retention_unit.map(|u| u.to_string()),
                schedule.enabled,
            ],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    pub fn get_by_id(conn: &Connection, id: i64) -> Result<Option<Schedule>, BacksmithError> {
        conn.query_row(
            &format!("SELECT {} FROM schedules WHERE id = ?", SCHEDULE_COLUMNS),
            [id],
            Self::from_row,
        )
        .optional()
        .map_err(BacksmithError::DatabaseError)
    }

    /// Schedules carrying both retention columns, disabled ones included.
    pub fn list_with_retention(conn: &Connection) -> Result<Vec<Schedule>, BacksmithError> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM schedules
             WHERE retention_value IS NOT NULL AND retention_unit IS NOT NULL
             ORDER BY id ASC",
            SCHEDULE_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::from_row)?;
        let results: Result<Vec<_>, _> = rows.collect();
        results.map_err(BacksmithError::DatabaseError)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Schedule> {
        fn parse<T: FromStr>(idx: usize, name: &str, value: String) -> rusqlite::Result<T> {
            T::from_str(&value).map_err(|_| {
                rusqlite::Error::InvalidColumnType(idx, name.to_string(), rusqlite::types::Type::Text)
            })
        }

        Ok(Schedule {
            id: row.get(0)?,
            backup_type: parse(1, "backup_type", row.get(1)?)?,
            frequency: parse(2, "frequency", row.get(2)?)?,
            hour: row.get(3)?,
            minute: row.get(4)?,
            day_of_week: row.get(5)?,
            day_of_month: row.get(6)?,
            interval_value: row.get(7)?,
            interval_unit: row
                .get::<_, Option<String>>(8)?
                .map(|v| parse(8, "interval_unit", v))
                .transpose()?,
            retention_value: row.get(9)?,
            retention_unit: row
                .get::<_, Option<String>>(10)?
                .map(|v| parse(10, "retention_unit", v))
                .transpose()?,
            enabled: row.get(11)?,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::daily_schedule;
    use super::*;
    use crate::database::test_support::temp_database;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn cron(value: serde_json::Value) -> CronSchedule {
        serde_json::from_value(value).unwrap()
    }

    fn expression(value: serde_json::Value) -> String {
        cron(value).timing().unwrap().expression()
    }

    #[test]
    fn test_cron_expressions() {
        assert_eq!(
            expression(json!({"id": 1, "frequency": "daily", "hour": 2, "minute": 30})),
            "30 2 * * *"
        );
        assert_eq!(
            expression(json!({"id": 1, "frequency": "weekly", "day_of_week": 1, "hour": 2, "minute": 30})),
            "30 2 * * 1"
        );
        assert_eq!(
            expression(json!({"id": 1, "frequency": "monthly", "day_of_month": 15, "hour": 2, "minute": 30})),
            "30 2 15 * *"
        );
        assert_eq!(
            expression(json!({"id": 1, "frequency": "hourly", "minute": 30})),
            "30 * * * *"
        );
        assert_eq!(
            expression(json!({"id": 1, "frequency": "interval", "interval_value": 15, "interval_unit": "minutes"})),
            "*/15 * * * *"
        );
        assert_eq!(
            expression(json!({"id": 1, "frequency": "interval", "interval_value": 2, "interval_unit": "hours"})),
            "0 */2 * * *"
        );
    }

    #[test]
    fn test_hour_boundaries() {
        let ok = cron(json!({"id": 1, "frequency": "daily", "hour": 23, "minute": 0}));
        assert!(ok.timing().is_ok());

        let bad = cron(json!({"id": 1, "frequency": "daily", "hour": 24, "minute": 0}));
        assert_eq!(bad.timing().unwrap_err(), "hour must be 0-23, got: 24");
    }

    #[test]
    fn test_day_of_month_zero_rejected() {
        let bad = cron(json!({"id": 1, "frequency": "monthly", "day_of_month": 0, "hour": 1, "minute": 0}));
        assert!(bad.timing().is_err());
    }

    #[test]
    fn test_day_of_week_range() {
        let bad = cron(json!({"id": 1, "frequency": "weekly", "day_of_week": 7, "hour": 1, "minute": 0}));
        assert!(bad.timing().is_err());
    }

    #[test]
    fn test_interval_rules() {
        let zero = cron(json!({"id": 1, "frequency": "interval", "interval_value": 0, "interval_unit": "minutes"}));
        assert!(zero.timing().is_err());

        let seconds = cron(json!({"id": 1, "frequency": "interval", "interval_value": 5, "interval_unit": "seconds"}));
        assert!(seconds.timing().unwrap_err().contains("interval_unit"));

        let missing = cron(json!({"id": 1, "frequency": "interval", "interval_value": 5}));
        assert_eq!(missing.timing().unwrap_err(), "interval_unit is required");
    }

    #[test]
    fn test_missing_fields() {
        let no_id = cron(json!({"frequency": "hourly", "minute": 5}));
        assert_eq!(no_id.timing().unwrap_err(), "id is required");

        let unknown = cron(json!({"id": 3, "frequency": "fortnightly"}));
        assert_eq!(unknown.timing().unwrap_err(), "unknown frequency 'fortnightly'");

        let no_minute = cron(json!({"id": 3, "frequency": "daily", "hour": 4}));
        assert_eq!(no_minute.timing().unwrap_err(), "minute is required");
    }

    #[test]
    fn test_enabled_defaults_to_true() {
        assert!(cron(json!({"id": 1})).enabled);
    }

    #[test]
    fn test_schedule_round_trip_and_list_with_retention() {
        let (_dir, db) = temp_database();
        let conn = db.get_connection().unwrap();

        let id = Schedule::create(&conn, &daily_schedule(Some((7, RetentionUnit::Days)))).unwrap();
        let mut disabled = daily_schedule(Some((2, RetentionUnit::Weeks)));
        disabled.enabled = false;
        let disabled_id = Schedule::create(&conn, &disabled).unwrap();
        Schedule::create(&conn, &daily_schedule(None)).unwrap();

        let stored = Schedule::get_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(stored.frequency, Frequency::Daily);
        assert_eq!(
            stored.retention(),
            Ok(Some(RetentionPolicy {
                value: 7,
                unit: RetentionUnit::Days
            }))
        );

        let ids: Vec<i64> = Schedule::list_with_retention(&conn)
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec![id, disabled_id]);
    }

    #[test]
    fn test_retention_requires_both_halves() {
        let mut schedule = daily_schedule(Some((0, RetentionUnit::Weeks)));
        assert_eq!(schedule.retention(), Ok(None));
        schedule.retention_value = Some(2);
        schedule.retention_unit = None;
        assert_eq!(schedule.retention(), Ok(None));
    }

    #[test]
    fn test_retention_value_beyond_u32_is_rejected() {
        let schedule = daily_schedule(Some((4_294_967_297, RetentionUnit::Days)));
        assert_eq!(
            schedule.retention(),
            Err("retention_value out of range: 4294967297".to_string())
        );

        let largest = daily_schedule(Some((i64::from(u32::MAX), RetentionUnit::Days)));
        assert_eq!(
            largest.retention().unwrap().map(|p| p.value),
            Some(u32::MAX)
        );
    }
}
