use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use futures::TryStreamExt;
use tracing::debug;

use crate::{protocol::ReportRow, utils::time::next_day_start};

use super::{
    error::TrackError,
    storage::{entities::SessionRecord, session_log::SessionLog},
};

struct Accumulator {
    total: Duration,
    days: HashMap<NaiveDate, Duration>,
}

impl Accumulator {
    fn new() -> Self {
        Accumulator {
            total: Duration::zero(),
            days: HashMap::new(),
        }
    }

    fn add_to_day(&mut self, day: NaiveDate, duration: Duration) {
        *self.days.entry(day).or_insert_with(Duration::zero) += duration;
    }

    /// Days with at least a second of runtime.
    fn active_days(&self) -> usize {
        self.days
            .values()
            .filter(|d| **d >= Duration::seconds(1))
            .count()
    }
}

/// Builds report rows out of sessions for the range `[start, end)`.
///
/// Every session is clipped to the range first. Its clipped part is then cut at each midnight of
/// `tz` to find the calendar days it touched. A day is active once it holds a second of runtime and
/// processes with less than a second in total are left out. Rows are ordered by total runtime, longest first, ties by name.
pub fn aggregate_records<Tz: TimeZone>(
    records: impl IntoIterator<Item = SessionRecord>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    tz: &Tz,
) -> Vec<ReportRow> {
    let mut processes: HashMap<Arc<str>, Accumulator> = HashMap::new();

    for record in records {
        let Some(clipped) = record.clamp(start, end) else {
            continue;
        };
        let accumulator = processes
            .entry(clipped.process_name.clone())
            .or_insert_with(Accumulator::new);
        accumulator.total += clipped.duration();

        let mut rest = Some(clipped);
        while let Some(piece) = rest {
            let local_start = piece.started_at.with_timezone(tz);
            let day = local_start.date_naive();
            let split = next_day_start(local_start).with_timezone(&Utc);
            if split <= piece.started_at {
                accumulator.add_to_day(day, piece.duration());
                break;
            }
            let (today, after) = piece.split_by(split);
            if let Some(today) = today {
                accumulator.add_to_day(day, today.duration());
            }
            rest = after;
        }
    }

    let mut rows = processes
        .into_iter()
        .filter(|(_, v)| v.total >= Duration::seconds(1))
        .map(|(process_name, v)| ReportRow {
            process_name,
            total_runtime: v.total,
            active_days: v.active_days(),
        })
        .collect::<Vec<_>>();
    rows.sort_by(|a, b| {
        b.total_runtime
            .cmp(&a.total_runtime)
            .then_with(|| a.process_name.cmp(&b.process_name))
    });
    rows
}

/// Report over the session log plus sessions that haven't reached it yet. Active days are
/// counted in the local time zone.
///
/// `live` is expected to be taken before the log is read. A session that got written in between
/// shows up in both, the logged copy wins.
pub async fn aggregate(
    log: &SessionLog,
    live: Vec<SessionRecord>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<ReportRow>, TrackError> {
    if start >= end {
        return Err(TrackError::InvalidRange { start, end });
    }

    let mut records: Vec<SessionRecord> = log
        .read(start, end)
        .await
        .map_err(TrackError::IoFailure)?
        .try_collect()
        .await
        .map_err(TrackError::IoFailure)?;
    debug!("Report over {start} - {end} read {} sessions", records.len());

    let logged = records
        .iter()
        .map(|r| (r.track_id.clone(), r.started_at))
        .collect::<HashSet<_>>();
    records.extend(
        live.into_iter()
            .filter(|r| !logged.contains(&(r.track_id.clone(), r.started_at))),
    );

    Ok(aggregate_records(records, start, end, &Local))
}
