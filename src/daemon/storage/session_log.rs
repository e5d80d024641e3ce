use std::{
    future,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use fs4::tokio::AsyncFileExt;
use futures::{stream, Stream, StreamExt};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::Mutex,
};
use tracing::{debug, error, info, warn};

use crate::{
    fs::operations::truncate_torn_tail,
    utils::time::{date_to_record_name, record_name_to_date},
};

use super::entities::SessionRecord;

/// Append-only store of completed sessions.
///
/// Every record lands in the file named after the UTC date its session stopped on, one JSON
/// document per line. Writers are serialized by an in-process mutex and hold an exclusive file
/// lock while writing. Readers take a shared file lock, so a line that is still being written is
/// never observed.
pub struct SessionLog {
    record_dir: PathBuf,
    append_lock: Mutex<()>,
}

impl SessionLog {
    pub fn new(record_dir: PathBuf) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&record_dir)?;

        Ok(Self {
            record_dir,
            append_lock: Mutex::new(()),
        })
    }

    pub fn record_dir(&self) -> &Path {
        &self.record_dir
    }

    /// Durably appends one record. Returns only after the line reached the disk.
    pub async fn append(&self, record: &SessionRecord) -> Result<()> {
        let _guard = self.append_lock.lock().await;

        let path = self
            .record_dir
            .join(date_to_record_name(record.stopped_at.date_naive()));

        let mut file = File::options()
            .write(true)
            .create(true)
            .read(true)
            .truncate(false)
            .open(&path)
            .await?;

        file.lock_exclusive()?;
        let result = Self::append_with_file(&mut file, record).await;
        file.unlock_async().await?;

        debug!("Appended session {} to {path:?}", record.track_id);
        result
    }

    async fn append_with_file(file: &mut File, record: &SessionRecord) -> Result<()> {
        // A crash in the middle of a previous write leaves a partial last line behind. It has to
        // go before anything new is written, otherwise the new record would be glued to it.
        let removed = truncate_torn_tail(file).await?;
        if removed > 0 {
            warn!("Removed {removed} bytes of an interrupted write before appending");
        }

        let mut buffer = serde_json::to_vec(record)?;
        buffer.push(b'\n');

        file.write_all(&buffer).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    /// Retrieves all records of sessions that stopped on a certain UTC day.
    pub async fn get_data_for(&self, date: NaiveDate) -> Result<Vec<SessionRecord>> {
        let path = self.record_dir.join(date_to_record_name(date));

        async fn extract(path: &Path) -> std::result::Result<Vec<SessionRecord>, std::io::Error> {
            debug!("Extracting {path:?}");
            let file = File::open(path).await?;
            file.lock_shared()?;
            let buffer = BufReader::new(file);
            let mut lines = buffer.lines();
            let mut records = vec![];
            while let Ok(Some(v)) = lines.next_line().await {
                if v.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SessionRecord>(&v) {
                    Ok(v) => records.push(v),
                    Err(e) => {
                        // ignore illegal values. Might happen after an abrupt shutdown
                        warn!(
                            "During parsing in path {:?} found illegal json string {}:  {e}",
                            path, &v
                        )
                    }
                }
            }

            lines.into_inner().into_inner().unlock_async().await?;

            Ok(records)
        }

        match extract(&path).await {
            Ok(s) => Ok(s),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(vec![]),
            Err(e) => Err(e)?,
        }
    }

    /// Days that have a record file, oldest first.
    pub async fn record_days(&self) -> Result<Vec<NaiveDate>> {
        let mut entries = tokio::fs::read_dir(&self.record_dir).await?;
        let mut days = vec![];
        while let Some(entry) = entries.next_entry().await? {
            if let Some(day) = entry.file_name().to_str().and_then(record_name_to_date) {
                days.push(day);
            }
        }
        days.sort();
        Ok(days)
    }

    /// Lazily reads every record whose `[started_at, stopped_at)` overlaps `[from, to)`.
    ///
    /// A session overlapping the range can't have stopped before the UTC day of `from`, so older
    /// files are skipped. Order of the produced records isn't defined.
    pub async fn read(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<impl Stream<Item = Result<SessionRecord>> + '_> {
        let first_day = from.date_naive();
        let days = self
            .record_days()
            .await?
            .into_iter()
            .filter(move |day| *day >= first_day);

        let files = stream::iter(days)
            .map(move |day| async move { (day, self.get_data_for(day).await) })
            .buffered(4);

        let records = files
            .flat_map(|(day, data)| match data {
                Ok(data) => stream::iter(data).map(Ok).boxed(),
                Err(e) => {
                    error!("Failed to read record file {day} {e}");
                    stream::once(future::ready(Err(e))).boxed()
                }
            })
            .filter(move |v| {
                future::ready(match v {
                    Ok(record) => record.intersects(from, to),
                    Err(_) => true,
                })
            });

        Ok(records)
    }

    /// Deletes every record file. Returns the amount of files removed.
    pub async fn clear_history(&self) -> Result<usize> {
        let _guard = self.append_lock.lock().await;

        let mut removed = 0;
        for day in self.record_days().await? {
            let path = self.record_dir.join(date_to_record_name(day));
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => Err(e)?,
            }
        }
        info!("Cleared {removed} record files");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, sync::Arc};

    use anyhow::Result;
    use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
    use futures::TryStreamExt;
    use tempfile::tempdir;

    use crate::{daemon::storage::entities::SessionRecord, utils::time::date_to_record_name};

    use super::SessionLog;

    const TEST_START_DATE: NaiveDateTime =
        NaiveDateTime::new(NaiveDate::from_ymd_opt(2018, 7, 4).unwrap(), NaiveTime::MIN);

    fn start() -> DateTime<Utc> {
        Utc.from_utc_datetime(&TEST_START_DATE)
    }

    fn record(name: &str, from: Duration, to: Duration) -> SessionRecord {
        SessionRecord {
            process_name: name.into(),
            track_id: format!("{name}-id").into(),
            started_at: start() + from,
            stopped_at: start() + to,
        }
    }

    #[tokio::test]
    async fn test_session_log_basic() -> Result<()> {
        let dir = tempdir()?;
        let log = SessionLog::new(dir.path().to_owned())?;
        let records = [
            record("sleep", Duration::hours(1), Duration::hours(2)),
            record("chrome", Duration::hours(3), Duration::hours(5)),
        ];
        for r in &records {
            log.append(r).await?;
        }

        let values = log.get_data_for(TEST_START_DATE.date()).await?;
        assert_eq!(values, records.to_vec());
        Ok(())
    }

    #[tokio::test]
    async fn test_records_are_filed_by_stop_day() -> Result<()> {
        let dir = tempdir()?;
        let log = SessionLog::new(dir.path().to_owned())?;
        let overnight = record("mongod", Duration::hours(20), Duration::hours(30));
        log.append(&overnight).await?;

        assert!(log.get_data_for(TEST_START_DATE.date()).await?.is_empty());
        let next_day = TEST_START_DATE.date().succ_opt().unwrap();
        assert_eq!(log.get_data_for(next_day).await?, vec![overnight]);
        assert_eq!(log.record_days().await?, vec![next_day]);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_returns_intersecting_records() -> Result<()> {
        let dir = tempdir()?;
        let log = SessionLog::new(dir.path().to_owned())?;
        let inside = record("chrome", Duration::hours(10), Duration::hours(11));
        let overlapping = record("mongod", Duration::hours(-30), Duration::hours(9));
        let before = record("old", Duration::hours(-50), Duration::hours(-40));
        let after = record("late", Duration::hours(40), Duration::hours(41));
        for r in [&inside, &overlapping, &before, &after] {
            log.append(r).await?;
        }

        let mut found = log
            .read(start() + Duration::hours(8), start() + Duration::hours(24))
            .await?
            .try_collect::<Vec<_>>()
            .await?;
        found.sort_by_key(|r| r.started_at);

        assert_eq!(found, vec![overlapping, inside]);
        Ok(())
    }

    #[tokio::test]
    async fn test_torn_line_is_skipped_and_repaired() -> Result<()> {
        let dir = tempdir()?;
        let log = SessionLog::new(dir.path().to_owned())?;
        let first = record("sleep", Duration::hours(1), Duration::hours(2));
        log.append(&first).await?;

        // Simulates a crash in the middle of a write.
        let path = dir.path().join(date_to_record_name(TEST_START_DATE.date()));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path)?;
        file.write_all(br#"{"process_name":"tor"#)?;
        drop(file);

        assert_eq!(log.get_data_for(TEST_START_DATE.date()).await?, vec![first.clone()]);

        let second = record("vim", Duration::hours(3), Duration::hours(4));
        log.append(&second).await?;

        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content.lines().count(), 2);
        assert_eq!(
            log.get_data_for(TEST_START_DATE.date()).await?,
            vec![first, second]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_appends_keep_every_line() -> Result<()> {
        let dir = tempdir()?;
        let log = Arc::new(SessionLog::new(dir.path().to_owned())?);

        let tasks = (0..16)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    log.append(&record(
                        &format!("process-{i}"),
                        Duration::minutes(i),
                        Duration::minutes(i + 1),
                    ))
                    .await
                })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await??;
        }

        assert_eq!(log.get_data_for(TEST_START_DATE.date()).await?.len(), 16);
        Ok(())
    }

    #[tokio::test]
    async fn test_clear_history_removes_only_record_files() -> Result<()> {
        let dir = tempdir()?;
        let log = SessionLog::new(dir.path().to_owned())?;
        log.append(&record("a", Duration::hours(1), Duration::hours(2)))
            .await?;
        log.append(&record("b", Duration::hours(1), Duration::hours(30)))
            .await?;
        std::fs::write(dir.path().join("notes.txt"), "keep me")?;

        assert_eq!(log.clear_history().await?, 2);
        assert!(log.record_days().await?.is_empty());
        assert!(dir.path().join("notes.txt").exists());
        Ok(())
    }
}
