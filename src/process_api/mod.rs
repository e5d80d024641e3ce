//! Contains logic for looking at operating system processes.
//! [ProcessInspector] is the contract the daemon depends on, [system::SystemInspector] is the
//! implementation used outside of tests.

pub mod system;

use std::{fmt::Display, sync::Arc};

use serde::{Deserialize, Serialize};

/// What the user asked to track: a PID when the input is all digits, a process name otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessTarget {
    Pid(u32),
    Name(String),
}

impl ProcessTarget {
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(pid) = value.parse::<u32>() {
                return Self::Pid(pid);
            }
        }
        Self::Name(value.to_string())
    }
}

impl Display for ProcessTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessTarget::Pid(pid) => write!(f, "pid {pid}"),
            ProcessTarget::Name(name) => write!(f, "{name}"),
        }
    }
}

/// A concrete process instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub name: Arc<str>,
    /// Start time of the process in seconds since epoch. Together with the pid it tells apart a
    /// process from whatever later reuses its pid.
    pub start_time: Option<u64>,
}

/// One row of the `ls` output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessListing {
    pub user: Option<String>,
    pub pid: u32,
    pub name: String,
}

/// Intended to serve as a contract any process backend must implement.
#[cfg_attr(test, mockall::automock)]
pub trait ProcessInspector: Send + Sync {
    /// All live processes matching the target. Name matching ignores case.
    fn find(&self, target: &ProcessTarget) -> Vec<ProcessIdentity>;

    /// Whether the exact process instance still runs. A pid that now belongs to a process with a
    /// different start time counts as dead.
    fn is_alive(&self, identity: &ProcessIdentity) -> bool;

    /// Whether the pid belongs to the daemon itself.
    fn is_self(&self, pid: u32) -> bool;

    fn list(&self) -> Vec<ProcessListing>;
}
