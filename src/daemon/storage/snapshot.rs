use std::{io::ErrorKind, path::PathBuf};

use anyhow::Result;
use tracing::{debug, warn};

use crate::fs::operations::atomic_write;

use super::entities::RecoverySnapshot;

pub const SNAPSHOT_FILE_NAME: &str = "recovery.json";

/// Overwritable recovery snapshot. Every write replaces the whole file atomically.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn write(&self, snapshot: &RecoverySnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || atomic_write(&path, &data)).await??;
        debug!(
            "Wrote recovery snapshot with {} entries",
            snapshot.entries.len()
        );
        Ok(())
    }

    /// A missing snapshot is the normal state of a fresh storage root. A corrupted one is
    /// reported and treated as missing, there is nothing to recover from it.
    pub async fn read(&self) -> Result<Option<RecoverySnapshot>> {
        let content = match tokio::fs::read(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => Err(e)?,
        };

        match serde_json::from_slice::<RecoverySnapshot>(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("Recovery snapshot at {:?} is corrupted: {e}", self.path);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::tempdir;

    use crate::daemon::storage::entities::{RecoverySnapshot, SessionRecord, SnapshotEntry};

    use super::{SnapshotStore, SNAPSHOT_FILE_NAME};

    #[tokio::test]
    async fn test_snapshot_is_overwritten() -> Result<()> {
        let dir = tempdir()?;
        let store = SnapshotStore::new(dir.path().join(SNAPSHOT_FILE_NAME));
        assert_eq!(store.read().await?, None);

        let started_at = Utc.with_ymd_and_hms(2025, 5, 21, 9, 0, 0).unwrap();
        let first = RecoverySnapshot {
            taken_at: started_at + Duration::minutes(1),
            entries: vec![SnapshotEntry {
                id: "nap".into(),
                process_name: "sleep".into(),
                pid: Some(4242),
                process_start_time: Some(1_747_818_000),
                started_at,
                accrued: Duration::minutes(1),
                foreground: false,
            }],
            pending: vec![],
        };
        store.write(&first).await?;
        assert_eq!(store.read().await?, Some(first));

        let second = RecoverySnapshot {
            taken_at: started_at + Duration::minutes(2),
            entries: vec![],
            pending: vec![SessionRecord {
                process_name: "sleep".into(),
                track_id: "nap".into(),
                started_at,
                stopped_at: started_at + Duration::seconds(90),
            }],
        };
        store.write(&second).await?;
        assert_eq!(store.read().await?, Some(second));
        Ok(())
    }

    #[tokio::test]
    async fn test_snapshot_without_pending_sessions_is_read() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        std::fs::write(&path, r#"{"taken_at": 1747818000000, "entries": []}"#)?;
        let snapshot = SnapshotStore::new(path).read().await?.unwrap();
        assert!(snapshot.entries.is_empty());
        assert!(snapshot.pending.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_snapshot_reads_as_missing() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(SNAPSHOT_FILE_NAME);
        std::fs::write(&path, "{\"taken_at\": 12")?;
        assert_eq!(SnapshotStore::new(path).read().await?, None);
        Ok(())
    }
}
