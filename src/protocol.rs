//! Messages exchanged between the cli and the daemon.
//!
//! Every message is a single JSON document terminated by a newline. A connection carries exactly
//! one request. The daemon answers with one response, except for a foreground `add`, which first
//! gets `tracking` and later `finished` once the process is gone.

use std::{sync::Arc, time::Duration as StdDuration};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::utils::time::duration_secs;

/// Requests longer than this are rejected without being parsed.
pub const MAX_MESSAGE_BYTES: u64 = 1024 * 1024;

/// How long the cli waits for the daemon to accept a connection.
pub const CONNECT_TIMEOUT: StdDuration = StdDuration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Add {
        target: String,
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        foreground: bool,
    },
    Rm {
        id: String,
    },
    Rename {
        id: String,
        new_id: String,
    },
    Ps {
        #[serde(default)]
        all: bool,
    },
    Status,
    Report {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        start: DateTime<Utc>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        end: DateTime<Utc>,
    },
    ClearHistory,
    ClearAll,
    Stop {
        #[serde(default)]
        force: bool,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "snake_case")]
pub enum Response {
    Tracking {
        entry: EntrySnapshot,
    },
    Finished {
        entry: EntrySnapshot,
    },
    Entries {
        entries: Vec<EntrySnapshot>,
    },
    Report {
        #[serde(with = "chrono::serde::ts_milliseconds")]
        start: DateTime<Utc>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        end: DateTime<Utc>,
        rows: Vec<ReportRow>,
    },
    Status(StatusReport),
    Ok,
    Pong,
    Error {
        code: ErrorCode,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    AlreadyExists,
    AlreadyTracking,
    LimitExceeded,
    SelfTrack,
    ProcessNotFound,
    InvalidRange,
    InvalidId,
    IoFailure,
    ProtocolError,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Running,
    Stopped,
}

/// Point-in-time copy of a tracked entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub id: Arc<str>,
    pub process_name: Arc<str>,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub status: EntryStatus,
    /// Address of the client that registered the entry.
    pub connection: Option<String>,
    pub foreground: bool,
    #[serde(with = "duration_secs")]
    pub runtime: Duration,
    /// Set while the session of a stopped entry couldn't be written to the log.
    #[serde(default)]
    pub persist_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub process_name: Arc<str>,
    #[serde(with = "duration_secs")]
    pub total_runtime: Duration,
    pub active_days: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub address: String,
    pub pid: u32,
    #[serde(with = "duration_secs")]
    pub uptime: Duration,
    pub running: usize,
    pub stopped: usize,
    pub limit: usize,
    #[serde(default)]
    pub persist_errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("message exceeds {MAX_MESSAGE_BYTES} bytes")]
    TooLarge,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Reads one newline terminated message. Returns `None` when the peer closed the connection
/// before sending anything.
pub async fn read_message<T, R>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut buffer = Vec::new();
    let read = reader
        .take(MAX_MESSAGE_BYTES + 1)
        .read_until(b'\n', &mut buffer)
        .await?;
    if read == 0 {
        return Ok(None);
    }
    if buffer.len() as u64 > MAX_MESSAGE_BYTES {
        return Err(FrameError::TooLarge);
    }
    Ok(Some(serde_json::from_slice(&buffer)?))
}

pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buffer = serde_json::to_vec(message)?;
    buffer.push(b'\n');
    writer.write_all(&buffer).await?;
    writer.flush().await?;
    Ok(())
}
