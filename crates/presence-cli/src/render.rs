//! Plain-text tables for terminal output.

use presence_store::{AttendanceRecord, DailyStats, DaySummary, User, UserStats};
use std::fmt::Write;

fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn users_table(users: &[User]) -> String {
    if users.is_empty() {
        return "No users enrolled\n".to_string();
    }
    let id_width = users.iter().map(|u| u.user_id.len()).max().unwrap_or(0).max(7);
    let mut out = format!("{:<id_width$}  {:<24}  REGISTERED\n", "USER ID", "NAME");
    for user in users {
        let _ = writeln!(
            out,
            "{:<id_width$}  {:<24}  {}",
            user.user_id,
            user.name,
            user.registered_at.format("%Y-%m-%d %H:%M")
        );
    }
    out
}

pub fn records_table(records: &[AttendanceRecord]) -> String {
    if records.is_empty() {
        return "No attendance records\n".to_string();
    }
    let id_width = records.iter().map(|r| r.user_id.len()).max().unwrap_or(0).max(7);
    let mut out = format!("{:<10}  {:<8}  {:<id_width$}  NAME\n", "DATE", "TIME", "USER ID");
    for record in records {
        let _ = writeln!(
            out,
            "{:<10}  {:<8}  {:<id_width$}  {}",
            record.date,
            record.time.format("%H:%M:%S"),
            record.user_id,
            record.name.as_deref().unwrap_or("(unknown)")
        );
    }
    let _ = writeln!(out, "{} record(s)", records.len());
    out
}

pub fn user_stats(stats: &UserStats) -> String {
    format!(
        "user:        {}\ndays:        {}\nfirst seen:  {}\nlast seen:   {}\n",
        stats.user_id,
        stats.total_days,
        or_dash(stats.first_seen.map(|t| t.format("%Y-%m-%d %H:%M:%S"))),
        or_dash(stats.last_seen.map(|t| t.format("%Y-%m-%d %H:%M:%S"))),
    )
}

pub fn daily_stats(stats: &DailyStats) -> String {
    format!(
        "date:         {}\nrecords:      {}\nunique users: {}\nfirst entry:  {}\nlast entry:   {}\n",
        stats.date,
        stats.total_records,
        stats.unique_users,
        or_dash(stats.first_entry),
        or_dash(stats.last_entry),
    )
}

pub fn summary_table(days: &[DaySummary]) -> String {
    if days.is_empty() {
        return "No attendance records\n".to_string();
    }
    let mut out = String::from("DATE        PRESENT\n");
    for day in days {
        let _ = writeln!(out, "{:<10}  {}", day.date, day.total);
    }
    out
}
