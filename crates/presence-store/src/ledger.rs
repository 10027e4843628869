//! Attendance ledger. At most one record per user per local calendar day.

use crate::storage::{Storage, StoreError};
use chrono::{DateTime, FixedOffset, Local, NaiveDate, NaiveTime};
use rusqlite::{params, OptionalExtension, Params, Row};
use serde::Serialize;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

/// Result of a [`AttendanceLedger::mark`] call. All three are normal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarkedToday,
    UserNotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub user_id: String,
    /// Display name; `None` if the user row no longer resolves.
    pub name: Option<String>,
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub timestamp: DateTime<FixedOffset>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub total_days: u64,
    pub first_seen: Option<DateTime<FixedOffset>>,
    pub last_seen: Option<DateTime<FixedOffset>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub date: NaiveDate,
    pub total_records: u64,
    pub unique_users: u64,
    pub first_entry: Option<NaiveTime>,
    pub last_entry: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DaySummary {
    pub date: NaiveDate,
    pub total: u64,
}

const RECORD_SELECT: &str = "SELECT a.user_id, u.name, a.date, a.time, a.timestamp
   FROM attendance a
   LEFT JOIN users u ON u.user_id = a.user_id";

const RECORD_ORDER: &str = "ORDER BY a.date DESC, a.time ASC, a.user_id ASC";

type RawRecord = (String, Option<String>, String, String, String);

fn raw_record(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad date {raw:?}: {e}")))
}

fn parse_time(raw: &str) -> Result<NaiveTime, StoreError> {
    NaiveTime::parse_from_str(raw, TIME_FORMAT)
        .map_err(|e| StoreError::Corrupt(format!("bad time {raw:?}: {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn into_record((user_id, name, date, time, timestamp): RawRecord) -> Result<AttendanceRecord, StoreError> {
    Ok(AttendanceRecord {
        date: parse_date(&date)?,
        time: parse_time(&time)?,
        timestamp: parse_timestamp(&timestamp)?,
        user_id,
        name,
    })
}

fn count(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

/// Sole writer of the attendance table.
#[derive(Clone)]
pub struct AttendanceLedger {
    storage: Storage,
}

impl AttendanceLedger {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Record that `user_id` was seen at `when`, once per local calendar day.
    ///
    /// The insert and the enrollment check are one statement and duplicates
    /// are rejected by the `(user_id, date)` unique key, so concurrent callers
    /// for the same user and day see exactly one `Marked`.
    pub fn mark(&self, user_id: &str, when: DateTime<Local>) -> Result<MarkOutcome, StoreError> {
        let date = when.date_naive().format(DATE_FORMAT).to_string();
        let time = when.time().format(TIME_FORMAT).to_string();
        let timestamp = when.fixed_offset().to_rfc3339();

        let outcome = self.storage.with_conn(|conn| {
            let inserted = conn.execute(
                "INSERT INTO attendance (user_id, date, time, timestamp)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM users WHERE user_id = ?1)
                 ON CONFLICT(user_id, date) DO NOTHING",
                params![user_id, date, time, timestamp],
            )?;
            if inserted > 0 {
                return Ok::<_, StoreError>(MarkOutcome::Marked);
            }
            let enrolled = conn
                .prepare_cached("SELECT 1 FROM users WHERE user_id = ?1")?
                .exists(params![user_id])?;
            Ok(if enrolled {
                MarkOutcome::AlreadyMarkedToday
            } else {
                MarkOutcome::UserNotFound
            })
        })?;

        match outcome {
            MarkOutcome::Marked => tracing::info!(user_id, %date, %time, "attendance marked"),
            MarkOutcome::AlreadyMarkedToday => {
                tracing::debug!(user_id, %date, "already marked today")
            }
            MarkOutcome::UserNotFound => {
                tracing::warn!(user_id, "mark rejected: user not enrolled")
            }
        }
        Ok(outcome)
    }

    /// Records for one calendar day.
    pub fn on_date(&self, date: NaiveDate) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            &format!("{RECORD_SELECT} WHERE a.date = ?1 {RECORD_ORDER}"),
            params![date.format(DATE_FORMAT).to_string()],
        )
    }

    /// Records with `from <= date <= to`.
    pub fn in_range(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            &format!("{RECORD_SELECT} WHERE a.date BETWEEN ?1 AND ?2 {RECORD_ORDER}"),
            params![
                from.format(DATE_FORMAT).to_string(),
                to.format(DATE_FORMAT).to_string()
            ],
        )
    }

    pub fn for_user(&self, user_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(
            &format!("{RECORD_SELECT} WHERE a.user_id = ?1 {RECORD_ORDER}"),
            params![user_id],
        )
    }

    pub fn all(&self) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.query_records(&format!("{RECORD_SELECT} {RECORD_ORDER}"), [])
    }

    pub fn user_stats(&self, user_id: &str) -> Result<UserStats, StoreError> {
        let (total, first, last) = self.storage.with_conn(|conn| {
            let total: i64 = conn.query_row(
                "SELECT COUNT(*) FROM attendance WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )?;
            let first: Option<String> = conn
                .query_row(
                    "SELECT timestamp FROM attendance WHERE user_id = ?1
                     ORDER BY date ASC, time ASC LIMIT 1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            let last: Option<String> = conn
                .query_row(
                    "SELECT timestamp FROM attendance WHERE user_id = ?1
                     ORDER BY date DESC, time DESC LIMIT 1",
                    params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok::<_, rusqlite::Error>((total, first, last))
        })?;

        Ok(UserStats {
            user_id: user_id.to_string(),
            total_days: count(total),
            first_seen: first.as_deref().map(parse_timestamp).transpose()?,
            last_seen: last.as_deref().map(parse_timestamp).transpose()?,
        })
    }

    pub fn daily_stats(&self, date: NaiveDate) -> Result<DailyStats, StoreError> {
        let (total, unique, first, last): (i64, i64, Option<String>, Option<String>) =
            self.storage.with_conn(|conn| {
                conn.query_row(
                    "SELECT COUNT(*), COUNT(DISTINCT user_id), MIN(time), MAX(time)
                     FROM attendance WHERE date = ?1",
                    params![date.format(DATE_FORMAT).to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )
            })?;
        Ok(DailyStats {
            date,
            total_records: count(total),
            unique_users: count(unique),
            first_entry: first.as_deref().map(parse_time).transpose()?,
            last_entry: last.as_deref().map(parse_time).transpose()?,
        })
    }

    /// Per-day record counts, newest day first, optionally within `range`.
    pub fn summary(
        &self,
        range: Option<(NaiveDate, NaiveDate)>,
    ) -> Result<Vec<DaySummary>, StoreError> {
        let (from, to) = match range {
            Some((from, to)) => (
                from.format(DATE_FORMAT).to_string(),
                to.format(DATE_FORMAT).to_string(),
            ),
            None => ("0000-01-01".to_string(), "9999-12-31".to_string()),
        };
        let rows: Vec<(String, i64)> = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT date, COUNT(*) FROM attendance
                 WHERE date BETWEEN ?1 AND ?2
                 GROUP BY date ORDER BY date DESC",
            )?;
            let rows = stmt.query_map(params![from, to], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        rows.into_iter()
            .map(|(date, total)| {
                Ok(DaySummary {
                    date: parse_date(&date)?,
                    total: count(total),
                })
            })
            .collect()
    }

    fn query_records<P: Params>(
        &self,
        sql: &str,
        params: P,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let raw = self.storage.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map(params, raw_record)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raw.into_iter().map(into_record).collect()
    }
}
