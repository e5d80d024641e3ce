use std::{net::SocketAddr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    daemon::storage::entities::{SessionRecord, SnapshotEntry},
    process_api::ProcessIdentity,
    protocol::{EntrySnapshot, EntryStatus},
};

/// Sends the final state of an entry once it stops. Foreground clients wait on the receiving
/// side.
pub type FinishedSender = watch::Sender<Option<EntrySnapshot>>;
pub type FinishedReceiver = watch::Receiver<Option<EntrySnapshot>>;

pub(super) struct TrackedEntry {
    pub id: Arc<str>,
    pub identity: ProcessIdentity,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub connection: Option<SocketAddr>,
    pub foreground: bool,
    /// Present exactly while the entry is running.
    pub monitor: Option<CancellationToken>,
    /// Session of a stopped entry that hasn't reached the log yet.
    pub pending: Option<SessionRecord>,
    pub persist_error: Option<String>,
    pub finished: FinishedSender,
}

impl TrackedEntry {
    /// Stopped entry for a session a previous run couldn't write. The process itself is long
    /// gone, only its name is known.
    pub fn unsaved(record: SessionRecord) -> Self {
        TrackedEntry {
            id: record.track_id.clone(),
            identity: ProcessIdentity {
                pid: 0,
                name: record.process_name.clone(),
                start_time: None,
            },
            started_at: record.started_at,
            stopped_at: Some(record.stopped_at),
            connection: None,
            foreground: false,
            monitor: None,
            pending: Some(record),
            persist_error: None,
            finished: watch::channel(None).0,
        }
    }

    pub fn status(&self) -> EntryStatus {
        if self.stopped_at.is_some() {
            EntryStatus::Stopped
        } else {
            EntryStatus::Running
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == EntryStatus::Running
    }

    pub fn runtime(&self, now: DateTime<Utc>) -> Duration {
        let end = self.stopped_at.unwrap_or(now);
        (end - self.started_at).max(Duration::zero())
    }

    /// Running entries still watch `identity`. Stopped ones or those matching another process
    /// don't.
    pub fn watches(&self, identity: &ProcessIdentity) -> bool {
        self.is_running()
            && (self.identity.pid == identity.pid
                || self.identity.name.eq_ignore_ascii_case(&identity.name))
    }

    /// Moves a running entry into the stopped state and leaves its session pending. Has no
    /// effect on an entry that already stopped.
    pub fn stop(&mut self, at: DateTime<Utc>) {
        if !self.is_running() {
            return;
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.cancel();
        }
        let stopped_at = at.max(self.started_at);
        self.stopped_at = Some(stopped_at);
        self.pending = Some(self.session_until(stopped_at));
    }

    /// Session as it would look if it stopped at `at`. The id is read at call time, so a rename
    /// is always reflected.
    pub fn session_until(&self, at: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            process_name: self.identity.name.clone(),
            track_id: self.id.clone(),
            started_at: self.started_at,
            stopped_at: at.max(self.started_at),
        }
    }

    pub fn recovery_entry(&self, now: DateTime<Utc>) -> SnapshotEntry {
        SnapshotEntry {
            id: self.id.clone(),
            process_name: self.identity.name.clone(),
            pid: Some(self.identity.pid),
            process_start_time: self.identity.start_time,
            started_at: self.started_at,
            accrued: self.runtime(now),
            foreground: self.foreground,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> EntrySnapshot {
        EntrySnapshot {
            id: self.id.clone(),
            process_name: self.identity.name.clone(),
            pid: self.is_running().then_some(self.identity.pid),
            started_at: self.started_at,
            stopped_at: self.stopped_at,
            status: self.status(),
            connection: self.connection.map(|v| v.to_string()),
            foreground: self.foreground,
            runtime: self.runtime(now),
            persist_error: self.persist_error.clone(),
        }
    }

    /// Publishes the final state to whoever waits for the entry.
    pub fn notify_finished(&self, now: DateTime<Utc>) {
        self.finished.send_replace(Some(self.snapshot(now)));
    }
}
