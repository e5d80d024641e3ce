use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use tokio::{
    io::{AsyncReadExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    select,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    process_api::ProcessTarget,
    protocol::{
        read_message, write_message, EntrySnapshot, FrameError, Request, Response, StatusReport,
    },
};

use super::{
    error::TrackError,
    registry::{ListFilter, Registry, TrackRequest, TrackTicket},
    report,
};

/// Accepts connections until `shutdown` is cancelled. Each connection is handled on its own
/// task. An error from the listener itself ends the loop, the daemon can't go on without it.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Listening on {}", dispatcher.address);
    loop {
        let (stream, peer) = select! {
            _ = shutdown.cancelled() => {
                info!("Stopped accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => accepted.context("Lost the listening socket")?,
        };

        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            if let Err(e) = dispatcher.handle(stream, peer).await {
                warn!("Connection with {peer} failed: {e}");
            }
        });
    }
}

/// Turns requests into registry, report and log calls.
pub struct Dispatcher {
    registry: Arc<Registry>,
    address: SocketAddr,
    shutdown: CancellationToken,
}

enum ForegroundOutcome {
    Finished(Option<EntrySnapshot>),
    Disconnected,
    ShuttingDown,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, address: SocketAddr, shutdown: CancellationToken) -> Self {
        Self {
            registry,
            address,
            shutdown,
        }
    }

    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), FrameError> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let request = match read_message::<Request, _>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(FrameError::Io(e)) => return Err(FrameError::Io(e)),
            Err(e) => {
                debug!("Rejected request from {peer}: {e}");
                let response = Response::from(TrackError::Protocol(e.to_string()));
                return write_message(&mut writer, &response).await;
            }
        };
        debug!(?request, %peer, "Received request");

        match request {
            Request::Add {
                target,
                id,
                foreground: true,
            } => {
                let request = TrackRequest {
                    target: ProcessTarget::parse(&target),
                    id,
                    foreground: true,
                    connection: Some(peer),
                };
                self.track_foreground(request, reader, writer).await
            }
            request => {
                let response = match self.execute(request, peer).await {
                    Ok(response) => response,
                    Err(e) => {
                        debug!("Request from {peer} failed: {e}");
                        Response::from(e)
                    }
                };
                write_message(&mut writer, &response).await
            }
        }
    }

    async fn execute(&self, request: Request, peer: SocketAddr) -> Result<Response, TrackError> {
        let response = match request {
            Request::Add {
                target,
                id,
                foreground,
            } => {
                let ticket = self
                    .registry
                    .add(TrackRequest {
                        target: ProcessTarget::parse(&target),
                        id,
                        foreground,
                        connection: Some(peer),
                    })
                    .await?;
                Response::Tracking {
                    entry: ticket.entry,
                }
            }
            Request::Rm { id } => Response::Finished {
                entry: self.registry.remove(&id).await?,
            },
            Request::Rename { id, new_id } => Response::Entries {
                entries: vec![self.registry.rename(&id, &new_id).await?],
            },
            Request::Ps { all } => {
                let filter = if all {
                    ListFilter::All
                } else {
                    ListFilter::Running
                };
                Response::Entries {
                    entries: self.registry.list(filter).await,
                }
            }
            Request::Status => {
                let status = self.registry.status().await;
                Response::Status(StatusReport {
                    address: self.address.to_string(),
                    pid: std::process::id(),
                    uptime: status.uptime,
                    running: status.running,
                    stopped: status.stopped,
                    limit: status.limit,
                    persist_errors: status.persist_errors,
                })
            }
            Request::Report { start, end } => {
                let live = self.registry.live_records().await;
                let rows = report::aggregate(self.registry.log(), live, start, end).await?;
                Response::Report { start, end, rows }
            }
            Request::ClearHistory => {
                self.registry
                    .log()
                    .clear_history()
                    .await
                    .map_err(TrackError::IoFailure)?;
                Response::Ok
            }
            Request::ClearAll => {
                self.registry.clear_all().await?;
                Response::Ok
            }
            Request::Stop { force } => {
                if force {
                    self.registry.remove_running().await?;
                } else {
                    let running = self.registry.running_count().await;
                    if running > 0 {
                        return Err(TrackError::Busy(running));
                    }
                }
                info!("Stop requested by {peer}");
                self.shutdown.cancel();
                Response::Ok
            }
            Request::Ping => Response::Pong,
        };
        Ok(response)
    }

    /// Keeps the connection open until the process is gone. A client that disconnects first
    /// takes its entry with it.
    async fn track_foreground(
        &self,
        request: TrackRequest,
        mut reader: BufReader<OwnedReadHalf>,
        mut writer: OwnedWriteHalf,
    ) -> Result<(), FrameError> {
        let mut ticket = match self.registry.add(request).await {
            Ok(ticket) => ticket,
            Err(e) => return write_message(&mut writer, &Response::from(e)).await,
        };

        let tracking = Response::Tracking {
            entry: ticket.entry.clone(),
        };
        if let Err(e) = write_message(&mut writer, &tracking).await {
            self.release(&ticket).await;
            return Err(e);
        }

        let outcome = select! {
            finished = ticket.finished.wait_for(|v| v.is_some()) => {
                ForegroundOutcome::Finished(finished.ok().and_then(|v| v.clone()))
            }
            _ = wait_for_disconnect(&mut reader) => ForegroundOutcome::Disconnected,
            _ = self.shutdown.cancelled() => ForegroundOutcome::ShuttingDown,
        };

        match outcome {
            ForegroundOutcome::Finished(Some(entry)) => {
                write_message(&mut writer, &Response::Finished { entry }).await
            }
            ForegroundOutcome::Finished(None) | ForegroundOutcome::ShuttingDown => Ok(()),
            ForegroundOutcome::Disconnected => {
                debug!("Foreground client of {} went away", ticket.entry.id);
                self.release(&ticket).await;
                Ok(())
            }
        }
    }

    async fn release(&self, ticket: &TrackTicket) {
        if let Err(e) = self.registry.release(ticket.key).await {
            warn!("Failed to release {}: {e}", ticket.entry.id);
        }
    }
}

/// Resolves once the peer closes its side. Anything the peer sends meanwhile is ignored.
async fn wait_for_disconnect(reader: &mut BufReader<OwnedReadHalf>) {
    let mut buffer = [0u8; 64];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{Arc, Mutex as StdMutex},
        time::Duration,
    };

    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use tempfile::{tempdir, TempDir};
    use tokio::{
        io::{AsyncWriteExt, BufReader},
        net::{TcpListener, TcpStream},
    };
    use tokio_util::sync::CancellationToken;

    use crate::{
        daemon::{registry::Registry, storage::session_log::SessionLog},
        process_api::{MockProcessInspector, ProcessIdentity, ProcessTarget},
        protocol::{read_message, write_message, EntryStatus, ErrorCode, Request, Response},
        utils::{clock::TestClock, logging::TEST_LOGGING},
    };

    use super::{serve, Dispatcher};

    type Processes = Arc<StdMutex<Vec<ProcessIdentity>>>;

    struct TestServer {
        address: SocketAddr,
        registry: Arc<Registry>,
        processes: Processes,
        shutdown: CancellationToken,
        _dir: TempDir,
    }

    async fn start_server(limit: usize) -> Result<TestServer> {
        *TEST_LOGGING;
        let dir = tempdir()?;
        let processes: Processes = Arc::new(StdMutex::new(vec![ProcessIdentity {
            pid: 10,
            name: "sleep".into(),
            start_time: Some(5),
        }]));

        let mut inspector = MockProcessInspector::new();
        let table = processes.clone();
        inspector.expect_find().returning(move |target| {
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
        inspector
            .expect_is_alive()
            .returning(move |identity| table.lock().unwrap().contains(identity));
        inspector.expect_is_self().returning(|_| false);

        let registry = Registry::new(
            Arc::new(inspector),
            Arc::new(SessionLog::new(dir.path().join("records"))?),
            Arc::new(TestClock::starting_at(
                Utc.with_ymd_and_hms(2025, 5, 21, 9, 0, 0).unwrap(),
            )),
            limit,
            Duration::from_millis(20),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let address = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(registry.clone(), address, shutdown.clone()));
        tokio::spawn(serve(listener, dispatcher, shutdown.clone()));

        Ok(TestServer {
            address,
            registry,
            processes,
            shutdown,
            _dir: dir,
        })
    }

    async fn request(address: SocketAddr, request: &Request) -> Result<Response> {
        let stream = TcpStream::connect(address).await?;
        let (reader, mut writer) = stream.into_split();
        write_message(&mut writer, request).await?;
        let mut reader = BufReader::new(reader);
        read_message(&mut reader)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no response"))
    }

    #[tokio::test]
    async fn answers_simple_requests() -> Result<()> {
        let server = start_server(8).await?;
        assert_eq!(request(server.address, &Request::Ping).await?, Response::Pong);

        let response = request(
            server.address,
            &Request::Add {
                target: "sleep".into(),
                id: Some("nap".into()),
                foreground: false,
            },
        )
        .await?;
        assert!(matches!(response, Response::Tracking { ref entry } if &*entry.id == "nap"));

        let Response::Entries { entries } =
            request(server.address, &Request::Ps { all: true }).await?
        else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, EntryStatus::Running);
        assert!(entries[0].connection.is_some());

        let Response::Status(status) = request(server.address, &Request::Status).await? else {
            panic!("expected status");
        };
        assert_eq!(status.running, 1);
        assert_eq!(status.limit, 8);

        let response = request(server.address, &Request::Rm { id: "ghost".into() }).await?;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::NotFound,
                ..
            }
        ));
        server.registry.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn malformed_request_gets_protocol_error() -> Result<()> {
        let server = start_server(8).await?;
        let mut stream = TcpStream::connect(server.address).await?;
        stream.write_all(b"{\"command\": \"dance\"}\n").await?;
        let mut reader = BufReader::new(stream);
        let response: Option<Response> = read_message(&mut reader).await?;
        assert!(matches!(
            response,
            Some(Response::Error {
                code: ErrorCode::ProtocolError,
                ..
            })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn foreground_add_reports_termination() -> Result<()> {
        let server = start_server(8).await?;
        let stream = TcpStream::connect(server.address).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        write_message(
            &mut writer,
            &Request::Add {
                target: "10".into(),
                id: Some("nap".into()),
                foreground: true,
            },
        )
        .await?;

        let first: Option<Response> = read_message(&mut reader).await?;
        assert!(matches!(first, Some(Response::Tracking { .. })));

        server.processes.lock().unwrap().clear();
        let last: Option<Response> =
            tokio::time::timeout(Duration::from_secs(5), read_message(&mut reader)).await??;
        let Some(Response::Finished { entry }) = last else {
            panic!("expected finished");
        };
        assert_eq!(entry.status, EntryStatus::Stopped);
        assert_eq!(&*entry.id, "nap");
        Ok(())
    }

    #[tokio::test]
    async fn foreground_disconnect_releases_the_entry() -> Result<()> {
        let server = start_server(8).await?;
        let stream = TcpStream::connect(server.address).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        write_message(
            &mut writer,
            &Request::Add {
                target: "sleep".into(),
                id: None,
                foreground: true,
            },
        )
        .await?;
        let first: Option<Response> = read_message(&mut reader).await?;
        assert!(matches!(first, Some(Response::Tracking { .. })));

        drop(writer);
        drop(reader);

        tokio::time::timeout(Duration::from_secs(5), async {
            while server.registry.running_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;
        assert_eq!(
            server.registry.log().record_days().await?.len(),
            1,
            "released session is written to the log"
        );
        Ok(())
    }

    #[tokio::test]
    async fn stop_refuses_while_tracking_unless_forced() -> Result<()> {
        let server = start_server(8).await?;
        request(
            server.address,
            &Request::Add {
                target: "sleep".into(),
                id: None,
                foreground: false,
            },
        )
        .await?;

        let refused = request(server.address, &Request::Stop { force: false }).await?;
        assert!(matches!(
            refused,
            Response::Error {
                code: ErrorCode::Busy,
                ..
            }
        ));
        assert!(!server.shutdown.is_cancelled());

        assert_eq!(
            request(server.address, &Request::Stop { force: true }).await?,
            Response::Ok
        );
        assert!(server.shutdown.is_cancelled());
        assert_eq!(server.registry.running_count().await, 0);
        Ok(())
    }
}
