use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use monitor::DEFAULT_POLL_INTERVAL;
use registry::Registry;
use server::Dispatcher;
use storage::{
    session_log::SessionLog,
    snapshot::{SnapshotStore, SNAPSHOT_FILE_NAME},
};
use tokio::{net::TcpListener, select};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::{load_config, Config},
    process_api::{system::SystemInspector, ProcessInspector},
    utils::clock::{Clock, DefaultClock},
};

pub mod args;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod report;
pub mod server;
pub mod shutdown;
pub mod storage;

pub const RECORDS_DIR: &str = "records";
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);

/// Represents the starting point for the daemon
pub async fn start_daemon(dir: PathBuf) -> Result<()> {
    let dir = std::path::absolute(dir)?;
    std::env::set_current_dir("/")?;

    let config = load_config(&dir);
    info!(
        "Starting daemon for {dir:?} on {} with a limit of {} processes",
        config.address(),
        config.max_tracked_processes
    );

    let shutdown_token = CancellationToken::new();
    let daemon = Daemon::prepare(
        &dir,
        &config,
        Arc::new(SystemInspector::new()),
        Arc::new(DefaultClock),
        DEFAULT_POLL_INTERVAL,
    )
    .await?;

    let (_, result) = tokio::join!(
        shutdown::detect_shutdown(shutdown_token.clone()),
        daemon.run(shutdown_token.clone(), SNAPSHOT_INTERVAL),
    );

    if let Err(e) = &result {
        error!("Daemon stopped with an error {e:?}");
    }
    result
}

/// Daemon that is bound and restored but doesn't accept connections yet.
pub struct Daemon {
    registry: Arc<Registry>,
    listener: TcpListener,
    snapshots: SnapshotStore,
    address: SocketAddr,
}

impl Daemon {
    /// Binds the listener first so a second daemon on the same address fails before touching
    /// the storage. Then brings back whatever the last recovery snapshot held.
    pub async fn prepare(
        root: &Path,
        config: &Config,
        inspector: Arc<dyn ProcessInspector>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Result<Self> {
        let listener = TcpListener::bind(config.address())
            .await
            .with_context(|| format!("Failed to listen on {}", config.address()))?;
        let address = listener.local_addr()?;

        let log = Arc::new(SessionLog::new(root.join(RECORDS_DIR))?);
        let registry = Registry::new(
            inspector,
            log,
            clock,
            config.max_tracked_processes,
            poll_interval,
        );

        let snapshots = SnapshotStore::new(root.join(SNAPSHOT_FILE_NAME));
        match snapshots.read().await {
            Ok(Some(snapshot)) => {
                let summary = registry.restore(snapshot).await;
                info!(
                    "Recovered {} running, {} finished and {} unwritten sessions from the snapshot",
                    summary.reattached, summary.finalized, summary.carried
                );
                if summary.unsaved > 0 {
                    error!("{} recovered sessions are not written yet", summary.unsaved);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Failed to read the recovery snapshot {e:?}"),
        }
        if let Err(e) = snapshots.write(&registry.recovery_snapshot().await).await {
            warn!("Failed to write the recovery snapshot {e:?}");
        }

        Ok(Self {
            registry,
            listener,
            snapshots,
            address,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Serves until `shutdown` is cancelled or the listener dies. Either way monitors are
    /// cancelled and one last snapshot is written.
    pub async fn run(self, shutdown: CancellationToken, snapshot_interval: Duration) -> Result<()> {
        let Daemon {
            registry,
            listener,
            snapshots,
            address,
        } = self;
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), address, shutdown.clone()));

        let (served, _) = tokio::join!(
            async {
                let served = server::serve(listener, dispatcher, shutdown.clone()).await;
                shutdown.cancel();
                served
            },
            snapshot_ticker(&registry, &snapshots, snapshot_interval, shutdown.clone()),
        );

        registry.shutdown();
        let pending = registry.flush_pending().await;
        if pending > 0 {
            error!("{pending} sessions could not be written before exit, keeping them in the snapshot");
        }
        match snapshots.write(&registry.recovery_snapshot().await).await {
            Ok(()) => info!("Wrote final recovery snapshot"),
            Err(e) => error!("Failed to write final recovery snapshot {e:?}"),
        }
        info!("Daemon stopped");
        served
    }
}

/// Periodically stores the running entries and retries sessions that failed to reach the log.
/// Failures are logged and retried on the next tick.
async fn snapshot_ticker(
    registry: &Registry,
    snapshots: &SnapshotStore,
    interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let pending = registry.flush_pending().await;
        if pending > 0 {
            warn!("{pending} sessions are still waiting to be written");
        }
        if let Err(e) = snapshots.write(&registry.recovery_snapshot().await).await {
            warn!("Failed to write recovery snapshot, retrying next tick {e:?}");
        }
    }
}

#[cfg(test)]
mod daemon_tests {
    use std::{
        net::SocketAddr,
        path::Path,
        sync::{Arc, Mutex as StdMutex},
        time::Duration,
    };

    use anyhow::Result;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use tempfile::tempdir;
    use tokio::{io::BufReader, net::TcpStream};
    use tokio_util::sync::CancellationToken;

    use crate::{
        config::{save_config, Config},
        daemon::storage::{
            entities::{RecoverySnapshot, SnapshotEntry},
            snapshot::{SnapshotStore, SNAPSHOT_FILE_NAME},
        },
        process_api::{MockProcessInspector, ProcessIdentity, ProcessTarget},
        protocol::{read_message, write_message, EntryStatus, ErrorCode, Request, Response},
        utils::{clock::TestClock, logging::TEST_LOGGING},
    };

    use super::Daemon;

    type Processes = Arc<StdMutex<Vec<ProcessIdentity>>>;

    fn process(pid: u32, name: &str) -> ProcessIdentity {
        ProcessIdentity {
            pid,
            name: name.into(),
            start_time: Some(pid as u64 * 10),
        }
    }

    fn inspector(processes: &Processes) -> MockProcessInspector {
        let mut mock = MockProcessInspector::new();
        let table = processes.clone();
        mock.expect_find().returning(move |target| {
            table
                .lock()
                .unwrap()
                .iter()
                .filter(|p| match target {
                    ProcessTarget::Pid(pid) => p.pid == *pid,
                    ProcessTarget::Name(name) => p.name.eq_ignore_ascii_case(name),
                })
                .cloned()
                .collect()
        });
        let table = processes.clone();
        mock.expect_is_alive()
            .returning(move |identity| table.lock().unwrap().contains(identity));
        mock.expect_is_self().returning(|pid| pid == 1);
        mock
    }

    fn test_config(limit: usize) -> Config {
        Config {
            port: 0,
            max_tracked_processes: limit,
            ..Config::default()
        }
    }

    async fn start(
        root: &Path,
        limit: usize,
        processes: &Processes,
        now: DateTime<Utc>,
    ) -> Result<(SocketAddr, CancellationToken, tokio::task::JoinHandle<Result<()>>)> {
        let daemon = Daemon::prepare(
            root,
            &test_config(limit),
            Arc::new(inspector(processes)),
            Arc::new(TestClock::starting_at(now)),
            Duration::from_millis(20),
        )
        .await?;
        let address = daemon.address();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(daemon.run(shutdown.clone(), Duration::from_millis(50)));
        Ok((address, shutdown, handle))
    }

    async fn send(address: SocketAddr, request: Request) -> Result<Response> {
        let stream = TcpStream::connect(address).await?;
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, &request).await?;
        read_message(&mut BufReader::new(reader))
            .await?
            .ok_or_else(|| anyhow::anyhow!("daemon closed the connection"))
    }

    fn add(target: &str, id: Option<&str>) -> Request {
        Request::Add {
            target: target.into(),
            id: id.map(str::to_string),
            foreground: false,
        }
    }

    async fn entries(address: SocketAddr) -> Result<Vec<crate::protocol::EntrySnapshot>> {
        match send(address, Request::Ps { all: true }).await? {
            Response::Entries { entries } => Ok(entries),
            other => Err(anyhow::anyhow!("unexpected response {other:?}")),
        }
    }

    /// Drives the daemon through a client connection the same way the cli does: tracking,
    /// limits, self tracking and external termination.
    #[tokio::test]
    async fn smoke_test_daemon() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let processes: Processes = Arc::new(StdMutex::new(vec![
            process(1, "trakd-daemon"),
            process(10, "sleep"),
            process(11, "vim"),
        ]));
        let now = Utc.with_ymd_and_hms(2025, 5, 21, 9, 0, 0).unwrap();
        let (address, shutdown, handle) = start(dir.path(), 1, &processes, now).await?;

        assert!(matches!(
            send(address, add("sleep", Some("nap"))).await?,
            Response::Tracking { .. }
        ));
        assert!(matches!(
            send(address, add("vim", None)).await?,
            Response::Error {
                code: ErrorCode::LimitExceeded,
                ..
            }
        ));
        assert!(matches!(
            send(address, add("1", None)).await?,
            Response::Error {
                code: ErrorCode::SelfTrack,
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        processes.lock().unwrap().retain(|p| p.pid != 10);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let all = entries(address).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(&*all[0].id, "nap");
        assert_eq!(all[0].status, EntryStatus::Stopped);
        assert!(all[0].runtime > ChronoDuration::zero());

        assert_eq!(send(address, Request::Stop { force: false }).await?, Response::Ok);
        tokio::time::timeout(Duration::from_secs(5), handle).await???;
        assert!(shutdown.is_cancelled());
        Ok(())
    }

    #[tokio::test]
    async fn crashed_daemon_sessions_end_at_the_last_snapshot() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let taken_at = Utc.with_ymd_and_hms(2025, 5, 21, 12, 0, 0).unwrap();
        let saved = |id: &str, pid: u32, name: &str| SnapshotEntry {
            id: id.into(),
            process_name: name.into(),
            pid: Some(pid),
            process_start_time: Some(pid as u64 * 10),
            started_at: taken_at - ChronoDuration::hours(2),
            accrued: ChronoDuration::hours(2),
            foreground: false,
        };
        SnapshotStore::new(dir.path().join(SNAPSHOT_FILE_NAME))
            .write(&RecoverySnapshot {
                taken_at,
                entries: vec![saved("web", 20, "chrome"), saved("db", 21, "mongod")],
                pending: vec![],
            })
            .await?;

        // Neither process survived the crash.
        let processes: Processes = Arc::new(StdMutex::new(vec![]));
        let now = taken_at + ChronoDuration::hours(1);
        let (address, shutdown, handle) = start(dir.path(), 8, &processes, now).await?;

        let all = entries(address).await?;
        assert_eq!(all.len(), 2);
        for entry in &all {
            assert_eq!(entry.status, EntryStatus::Stopped);
            assert_eq!(entry.stopped_at, Some(taken_at));
        }

        let Response::Report { rows, .. } = send(
            address,
            Request::Report {
                start: taken_at - ChronoDuration::days(1),
                end: now,
            },
        )
        .await?
        else {
            panic!("expected a report");
        };
        assert_eq!(rows.len(), 2);
        assert!(rows
            .iter()
            .all(|r| r.total_runtime == ChronoDuration::hours(2)));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await???;

        let snapshot = SnapshotStore::new(dir.path().join(SNAPSHOT_FILE_NAME))
            .read()
            .await?
            .unwrap();
        assert!(snapshot.entries.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn running_entries_survive_a_restart() -> Result<()> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        save_config(dir.path(), &test_config(8))?;
        let processes: Processes = Arc::new(StdMutex::new(vec![process(10, "sleep")]));
        let now = Utc.with_ymd_and_hms(2025, 5, 21, 9, 0, 0).unwrap();

        let (address, shutdown, handle) = start(dir.path(), 8, &processes, now).await?;
        send(address, add("sleep", Some("nap"))).await?;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await???;

        let (address, shutdown, handle) = start(dir.path(), 8, &processes, now).await?;
        let all = entries(address).await?;
        assert_eq!(all.len(), 1);
        assert_eq!(&*all[0].id, "nap");
        assert_eq!(all[0].status, EntryStatus::Running);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle).await???;
        Ok(())
    }
}
