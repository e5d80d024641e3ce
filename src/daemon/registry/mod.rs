//! Authoritative in-memory state of every tracked process.
//!
//! All structural changes go through one async mutex. Liveness monitors run as separate tasks
//! and only take the lock when their process is gone. Any session that leaves the registry is
//! appended to the [SessionLog] first. Appends run outside the lock, one at a time. If one fails
//! the entry stays in memory as stopped with the session pending until a later flush succeeds,
//! and pending sessions travel in the recovery snapshot.

mod entry;
pub mod id;

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use entry::FinishedReceiver;
use entry::TrackedEntry;
use id::{generate_id, validate_id};

use crate::{
    process_api::{ProcessIdentity, ProcessInspector, ProcessTarget},
    protocol::EntrySnapshot,
    utils::clock::Clock,
};

use super::{
    error::TrackError,
    monitor::LivenessMonitor,
    storage::{
        entities::{RecoverySnapshot, SessionRecord},
        session_log::SessionLog,
    },
};

/// Stopped entries kept around for `ps -a`. The log is the long term history.
pub const STOPPED_RETENTION: usize = 64;

const APPEND_ATTEMPTS: u32 = 3;
const APPEND_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    Running,
    All,
}

#[derive(Debug, Clone)]
pub struct TrackRequest {
    pub target: ProcessTarget,
    pub id: Option<String>,
    pub foreground: bool,
    pub connection: Option<SocketAddr>,
}

/// Result of a successful registration.
pub struct TrackTicket {
    /// Internal handle of the entry. Unlike the id it survives renames.
    pub key: u64,
    pub entry: EntrySnapshot,
    /// Yields the final snapshot once the entry stops.
    pub finished: FinishedReceiver,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryStatus {
    pub uptime: Duration,
    pub running: usize,
    pub stopped: usize,
    pub limit: usize,
    pub persist_errors: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RestoreSummary {
    pub reattached: usize,
    pub finalized: usize,
    /// Unwritten sessions of the previous run taken over from the snapshot.
    pub carried: usize,
    /// Finalized or carried sessions that couldn't be appended yet.
    pub unsaved: usize,
}

#[derive(Default)]
struct RegistryState {
    entries: BTreeMap<u64, TrackedEntry>,
    next_key: u64,
}

impl RegistryState {
    /// Ids are compared ignoring case.
    fn key_of(&self, id: &str) -> Option<u64> {
        self.entries
            .iter()
            .find(|(_, entry)| entry.id.eq_ignore_ascii_case(id))
            .map(|(key, _)| *key)
    }

    fn running_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_running()).count()
    }

    fn allocate_key(&mut self) -> u64 {
        let key = self.next_key;
        self.next_key += 1;
        key
    }

    fn free_id(&self, identity: &ProcessIdentity, at: DateTime<Utc>) -> Arc<str> {
        let mut attempt = 0;
        loop {
            let id = generate_id(identity, at, attempt);
            if self.key_of(&id).is_none() {
                return id.into();
            }
            attempt += 1;
        }
    }

    /// Drops the oldest stopped entries above the retention limit. Entries with a pending
    /// session are never dropped.
    fn evict_stopped(&mut self) {
        let mut stopped = self.entries.len() - self.running_count();
        while stopped > STOPPED_RETENTION {
            let oldest = self
                .entries
                .iter()
                .filter(|(_, e)| !e.is_running() && e.pending.is_none())
                .min_by_key(|(_, e)| e.stopped_at)
                .map(|(key, _)| *key);
            let Some(key) = oldest else {
                break;
            };
            self.entries.remove(&key);
            stopped -= 1;
        }
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    /// Held for the whole of one pending write, so a session is appended at most once.
    persist_lock: Mutex<()>,
    inspector: Arc<dyn ProcessInspector>,
    log: Arc<SessionLog>,
    clock: Arc<dyn Clock>,
    limit: usize,
    poll_interval: std::time::Duration,
    started_at: DateTime<Utc>,
    /// Parent of every monitor token.
    monitors: CancellationToken,
}

impl Registry {
    pub fn new(
        inspector: Arc<dyn ProcessInspector>,
        log: Arc<SessionLog>,
        clock: Arc<dyn Clock>,
        limit: usize,
        poll_interval: std::time::Duration,
    ) -> Arc<Self> {
        let started_at = clock.time();
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            persist_lock: Mutex::new(()),
            inspector,
            log,
            clock,
            limit,
            poll_interval,
            started_at,
            monitors: CancellationToken::new(),
        })
    }

    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    /// Resolves the target to one live process and starts monitoring it.
    pub async fn add(self: &Arc<Self>, request: TrackRequest) -> Result<TrackTicket, TrackError> {
        if let Some(id) = &request.id {
            validate_id(id)?;
        }

        if self.state.lock().await.running_count() >= self.limit {
            return Err(TrackError::LimitExceeded { limit: self.limit });
        }
        let identity = self.resolve(&request.target)?;

        let mut state = self.state.lock().await;
        if state.running_count() >= self.limit {
            return Err(TrackError::LimitExceeded { limit: self.limit });
        }
        if state.entries.values().any(|e| e.watches(&identity)) {
            return Err(TrackError::AlreadyTracking(format!(
                "{} (pid {})",
                identity.name, identity.pid
            )));
        }

        let now = self.clock.time();
        let id: Arc<str> = match request.id {
            Some(id) if state.key_of(&id).is_some() => return Err(TrackError::AlreadyExists(id)),
            Some(id) => id.into(),
            None => state.free_id(&identity, now),
        };

        let key = state.allocate_key();
        let cancellation = self.monitors.child_token();
        let (finished, receiver) = watch::channel(None);
        let entry = TrackedEntry {
            id,
            identity: identity.clone(),
            started_at: now,
            stopped_at: None,
            connection: request.connection,
            foreground: request.foreground,
            monitor: Some(cancellation.clone()),
            pending: None,
            persist_error: None,
            finished,
        };
        let snapshot = entry.snapshot(now);
        state.entries.insert(key, entry);
        info!(
            id = %snapshot.id,
            "Started tracking {} (pid {})", identity.name, identity.pid
        );
        self.spawn_monitor(key, identity, cancellation);

        Ok(TrackTicket {
            key,
            entry: snapshot,
            finished: receiver,
        })
    }

    /// Stops the entry if it still runs, persists its session and forgets it.
    pub async fn remove(&self, id: &str) -> Result<EntrySnapshot, TrackError> {
        let key = {
            let mut state = self.state.lock().await;
            let now = self.clock.time();
            let key = state
                .key_of(id)
                .ok_or_else(|| TrackError::NotFound(id.to_string()))?;
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.stop(now);
            }
            key
        };
        self.finish_removal(key).await
    }

    /// Same as [Registry::remove], addressed by key. Used when a foreground client goes away.
    pub async fn release(&self, key: u64) -> Result<Option<EntrySnapshot>, TrackError> {
        {
            let mut state = self.state.lock().await;
            let now = self.clock.time();
            let Some(entry) = state.entries.get_mut(&key) else {
                return Ok(None);
            };
            entry.stop(now);
        }
        self.finish_removal(key).await.map(Some)
    }

    /// Persists a stopped entry and forgets it. An entry whose session can't be written stays.
    async fn finish_removal(&self, key: u64) -> Result<EntrySnapshot, TrackError> {
        let persisted = self.persist(key).await;

        let mut state = self.state.lock().await;
        let now = self.clock.time();
        let Some(entry) = state.entries.get(&key) else {
            return Err(TrackError::NotFound(key.to_string()));
        };
        entry.notify_finished(now);
        persisted.map_err(TrackError::IoFailure)?;

        let snapshot = entry.snapshot(now);
        state.entries.remove(&key);
        info!(id = %snapshot.id, "Stopped tracking {}", snapshot.process_name);
        Ok(snapshot)
    }

    pub async fn rename(&self, id: &str, new_id: &str) -> Result<EntrySnapshot, TrackError> {
        validate_id(new_id)?;

        let mut state = self.state.lock().await;
        let key = state
            .key_of(id)
            .ok_or_else(|| TrackError::NotFound(id.to_string()))?;
        if matches!(state.key_of(new_id), Some(other) if other != key) {
            return Err(TrackError::AlreadyExists(new_id.to_string()));
        }

        let now = self.clock.time();
        let Some(entry) = state.entries.get_mut(&key) else {
            return Err(TrackError::NotFound(id.to_string()));
        };
        let new_id: Arc<str> = new_id.into();
        info!("Renamed {} to {new_id}", entry.id);
        entry.id = new_id.clone();
        if let Some(pending) = entry.pending.as_mut() {
            pending.track_id = new_id;
        }
        Ok(entry.snapshot(now))
    }

    /// Entries in registration order.
    pub async fn list(&self, filter: ListFilter) -> Vec<EntrySnapshot> {
        let state = self.state.lock().await;
        let now = self.clock.time();
        state
            .entries
            .values()
            .filter(|e| filter == ListFilter::All || e.is_running())
            .map(|e| e.snapshot(now))
            .collect()
    }

    pub async fn status(&self) -> RegistryStatus {
        let state = self.state.lock().await;
        let now = self.clock.time();
        let running = state.running_count();
        RegistryStatus {
            uptime: (now - self.started_at).max(Duration::zero()),
            running,
            stopped: state.entries.len() - running,
            limit: self.limit,
            persist_errors: state
                .entries
                .values()
                .filter_map(|e| e.persist_error.as_ref().map(|err| format!("{}: {err}", e.id)))
                .collect(),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running_count()
    }

    /// Sessions that are not in the log: running entries up to now and pending ones.
    pub async fn live_records(&self) -> Vec<SessionRecord> {
        let state = self.state.lock().await;
        let now = self.clock.time();
        state
            .entries
            .values()
            .filter_map(|e| {
                if e.is_running() {
                    Some(e.session_until(now))
                } else {
                    e.pending.clone()
                }
            })
            .collect()
    }

    pub async fn recovery_snapshot(&self) -> RecoverySnapshot {
        let state = self.state.lock().await;
        let now = self.clock.time();
        RecoverySnapshot {
            taken_at: now,
            entries: state
                .entries
                .values()
                .filter(|e| e.is_running())
                .map(|e| e.recovery_entry(now))
                .collect(),
            pending: state
                .entries
                .values()
                .filter_map(|e| e.pending.clone())
                .collect(),
        }
    }

    /// Retries every pending session once more. Returns how many are still pending.
    pub async fn flush_pending(&self) -> usize {
        let keys = self
            .state
            .lock()
            .await
            .entries
            .iter()
            .filter(|(_, e)| e.pending.is_some())
            .map(|(key, _)| *key)
            .collect::<Vec<_>>();

        let mut remaining = 0;
        for key in keys {
            if self.persist(key).await.is_err() {
                remaining += 1;
            }
        }
        self.state.lock().await.evict_stopped();
        remaining
    }

    /// Finalizes every running entry and empties the registry.
    pub async fn clear_all(&self) -> Result<usize, TrackError> {
        self.drain(true).await
    }

    /// Finalizes and removes the running entries only.
    pub async fn remove_running(&self) -> Result<usize, TrackError> {
        self.drain(false).await
    }

    async fn drain(&self, include_stopped: bool) -> Result<usize, TrackError> {
        let keys = {
            let mut state = self.state.lock().await;
            let now = self.clock.time();
            state
                .entries
                .iter_mut()
                .filter(|(_, entry)| include_stopped || entry.is_running())
                .map(|(key, entry)| {
                    entry.stop(now);
                    *key
                })
                .collect::<Vec<_>>()
        };

        let mut failure = None;
        let mut drained = 0;
        for key in keys {
            match self.finish_removal(key).await {
                Ok(_) => drained += 1,
                // Already removed by someone else.
                Err(TrackError::NotFound(_)) => {}
                Err(e) => failure = Some(e),
            }
        }
        info!("Removed {drained} entries");

        match failure {
            Some(e) => Err(e),
            None => Ok(drained),
        }
    }

    /// Cancels every monitor without finalizing anything. Running entries stay running so the
    /// final snapshot still contains them.
    pub fn shutdown(&self) {
        self.monitors.cancel();
    }

    /// Rebuilds the registry from a recovery snapshot. Processes that still run are monitored
    /// again, the rest become sessions that ended when the snapshot was taken. Sessions the
    /// previous run couldn't write are written now, unless they reached the log after all.
    pub async fn restore(self: &Arc<Self>, snapshot: RecoverySnapshot) -> RestoreSummary {
        let unlogged = self.unlogged(snapshot.pending).await;
        let mut summary = RestoreSummary::default();
        let mut to_persist = vec![];

        let mut state = self.state.lock().await;
        for saved in snapshot.entries {
            let identity = ProcessIdentity {
                pid: saved.pid.unwrap_or_default(),
                name: saved.process_name.clone(),
                start_time: saved.process_start_time,
            };
            let id = if state.key_of(&saved.id).is_some() {
                warn!("Snapshot holds duplicate id {}, generating a new one", saved.id);
                state.free_id(&identity, saved.started_at)
            } else {
                saved.id.clone()
            };

            let alive = saved.pid.is_some()
                && state.running_count() < self.limit
                && !self.inspector.is_self(identity.pid)
                && !state.entries.values().any(|e| e.watches(&identity))
                && self.inspector.is_alive(&identity);

            let key = state.allocate_key();
            let (finished, _) = watch::channel(None);
            let mut entry = TrackedEntry {
                id,
                identity: identity.clone(),
                started_at: saved.started_at,
                stopped_at: None,
                connection: None,
                foreground: false,
                monitor: None,
                pending: None,
                persist_error: None,
                finished,
            };

            if alive {
                let cancellation = self.monitors.child_token();
                entry.monitor = Some(cancellation.clone());
                info!(id = %entry.id, "Re-attached to {} (pid {})", identity.name, identity.pid);
                state.entries.insert(key, entry);
                self.spawn_monitor(key, identity, cancellation);
                summary.reattached += 1;
            } else {
                entry.stop(snapshot.taken_at);
                info!(
                    id = %entry.id,
                    "{} is gone, recording its session up to {}", identity.name, snapshot.taken_at
                );
                state.entries.insert(key, entry);
                to_persist.push(key);
                summary.finalized += 1;
            }
        }

        for mut record in unlogged {
            if state.key_of(&record.track_id).is_some() {
                let identity = ProcessIdentity {
                    pid: 0,
                    name: record.process_name.clone(),
                    start_time: None,
                };
                warn!("Unwritten session reuses id {}, generating a new one", record.track_id);
                record.track_id = state.free_id(&identity, record.started_at);
            }
            info!(
                id = %record.track_id,
                "Taking over the unwritten session of {}", record.process_name
            );
            let key = state.allocate_key();
            state.entries.insert(key, TrackedEntry::unsaved(record));
            to_persist.push(key);
            summary.carried += 1;
        }
        drop(state);

        for key in to_persist {
            if self.persist(key).await.is_err() {
                summary.unsaved += 1;
            }
        }
        self.state.lock().await.evict_stopped();
        summary
    }

    /// Leaves out sessions that are in the log already. The previous run may have written them
    /// after its last snapshot.
    async fn unlogged(&self, records: Vec<SessionRecord>) -> Vec<SessionRecord> {
        let mut unlogged = vec![];
        for record in records {
            match self.log.get_data_for(record.stopped_at.date_naive()).await {
                Ok(logged)
                    if logged.iter().any(|r| {
                        r.track_id == record.track_id && r.started_at == record.started_at
                    }) =>
                {
                    debug!(
                        id = %record.track_id,
                        "Session of {} is already written", record.process_name
                    );
                }
                Ok(_) => unlogged.push(record),
                Err(e) => {
                    warn!(
                        "Failed to look up session {} in the log, writing it again {e:?}",
                        record.track_id
                    );
                    unlogged.push(record);
                }
            }
        }
        unlogged
    }

    /// Called by a monitor once its process is gone. The id used for the session is whatever
    /// the entry is called at this moment.
    pub(crate) async fn finalize_terminated(&self, key: u64) {
        {
            let mut state = self.state.lock().await;
            let now = self.clock.time();
            let Some(entry) = state.entries.get_mut(&key) else {
                return;
            };
            if !entry.is_running() {
                return;
            }

            entry.stop(now);
            info!(
                id = %entry.id,
                "{} (pid {}) terminated after {}s",
                entry.identity.name,
                entry.identity.pid,
                entry.runtime(now).num_seconds()
            );
        }
        // Failure is already logged and kept on the entry.
        let _ = self.persist(key).await;

        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get(&key) {
            entry.notify_finished(self.clock.time());
        }
        state.evict_stopped();
    }

    fn resolve(&self, target: &ProcessTarget) -> Result<ProcessIdentity, TrackError> {
        let candidates = self.inspector.find(target);
        if let Some(own) = candidates.iter().find(|c| self.inspector.is_self(c.pid)) {
            return Err(TrackError::SelfTrack(own.pid));
        }
        candidates
            .into_iter()
            .min_by_key(|c| (c.start_time.unwrap_or(u64::MAX), c.pid))
            .ok_or_else(|| TrackError::ProcessNotFound(target.to_string()))
    }

    fn spawn_monitor(
        self: &Arc<Self>,
        key: u64,
        identity: ProcessIdentity,
        cancellation: CancellationToken,
    ) {
        let monitor = LivenessMonitor::new(
            key,
            identity,
            self.inspector.clone(),
            self.clock.clone(),
            Arc::downgrade(self),
            self.poll_interval,
            cancellation,
        );
        tokio::spawn(monitor.run());
    }

    /// Writes the pending session of an entry, if any. The registry lock is only taken around
    /// the append. On failure the session stays pending and the error is recorded on the entry.
    async fn persist(&self, key: u64) -> anyhow::Result<()> {
        let _writing = self.persist_lock.lock().await;
        let Some(record) = self
            .state
            .lock()
            .await
            .entries
            .get(&key)
            .and_then(|e| e.pending.clone())
        else {
            return Ok(());
        };

        let written = self.append_with_retries(&record).await;

        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.get_mut(&key) else {
            return written;
        };
        match &written {
            Ok(()) => {
                entry.pending = None;
                entry.persist_error = None;
            }
            Err(e) => {
                error!(
                    id = %record.track_id,
                    "Session of {} could not be written, keeping it in memory: {e:?}",
                    record.process_name
                );
                entry.persist_error = Some(format!("{e:#}"));
            }
        }
        written
    }

    async fn append_with_retries(&self, record: &SessionRecord) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match self.log.append(record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < APPEND_ATTEMPTS => {
                    warn!("Append attempt {attempt} for {} failed: {e}", record.track_id);
                    attempt += 1;
                    self.clock.sleep(APPEND_RETRY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
