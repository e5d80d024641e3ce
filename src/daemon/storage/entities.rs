use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use serde::Deserialize;
use serde::Serialize;

use std::sync::Arc;

use crate::utils::time::duration_secs;

/// One completed tracking session. Written once to the session log and never changed afterwards.
/// The duration isn't stored, it's always derived from the two bounds.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct SessionRecord {
    pub process_name: Arc<str>,
    pub track_id: Arc<str>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub stopped_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn duration(&self) -> Duration {
        self.stopped_at - self.started_at
    }

    /// Whether `[started_at, stopped_at)` overlaps `[from, to)`.
    pub fn intersects(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> bool {
        self.started_at < to && self.stopped_at > from
    }

    /// Splits a session into 2 halves, 1 before split, 1 after. Used to separate sessions into
    /// smaller chunks, when counting days.
    pub fn split_by(self, split: DateTime<Utc>) -> (Option<SessionRecord>, Option<SessionRecord>) {
        if split <= self.started_at {
            (None, Some(self))
        } else if split >= self.stopped_at {
            (Some(self), None)
        } else {
            let before = SessionRecord {
                stopped_at: split,
                ..self.clone()
            };
            let after = SessionRecord {
                started_at: split,
                ..self
            };
            (Some(before), Some(after))
        }
    }

    /// Returns the part of the session inside `[from, to)`. Sessions that don't overlap the range
    /// at all, or only touch its bounds, yield nothing.
    pub fn clamp(self, from: DateTime<Utc>, to: DateTime<Utc>) -> Option<SessionRecord> {
        let started_at = self.started_at.max(from);
        let stopped_at = self.stopped_at.min(to);
        (started_at < stopped_at).then(|| SessionRecord {
            started_at,
            stopped_at,
            ..self
        })
    }
}

/// Whole-registry state written periodically so that an abnormal shutdown loses at most one
/// snapshot period of tracking.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct RecoverySnapshot {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub taken_at: DateTime<Utc>,
    pub entries: Vec<SnapshotEntry>,
    /// Finished sessions that couldn't be written to the log yet.
    #[serde(default)]
    pub pending: Vec<SessionRecord>,
}

/// A running entry as seen at snapshot time.
#[derive(PartialEq, Eq, Debug, Serialize, Deserialize, Clone)]
pub struct SnapshotEntry {
    pub id: Arc<str>,
    pub process_name: Arc<str>,
    pub pid: Option<u32>,
    #[serde(default)]
    pub process_start_time: Option<u64>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_secs")]
    pub accrued: Duration,
    #[serde(default)]
    pub foreground: bool,
}
