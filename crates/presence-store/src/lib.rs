//! Persistent state of the attendance pipeline.
//!
//! One SQLite database holds the enrolled users and the append-only
//! attendance table. [`IdentityStore`] and [`AttendanceLedger`] are the only
//! writers of their tables and share a [`Storage`] handle.

pub mod identity;
pub mod ledger;
pub mod storage;

pub use identity::{EnrollError, IdentityStore, User};
pub use ledger::{AttendanceLedger, AttendanceRecord, DailyStats, DaySummary, MarkOutcome, UserStats};
pub use storage::{Storage, StoreError};
