//! Small daemon that tracks how long chosen processes run and keeps a log of their sessions.
//! The cli talks to the daemon over a local socket and turns the log into per process reports.

pub mod cli;
pub mod config;
pub mod daemon;
pub mod fs;
pub mod process_api;
pub mod protocol;
pub mod utils;
