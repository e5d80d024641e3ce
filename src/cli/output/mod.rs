//! Tab separated tables printed by the cli.

use std::path::PathBuf;

use ansi_term::Colour;
use chrono::{DateTime, Duration, Local, Utc};

use crate::{
    config::Config,
    process_api::ProcessListing,
    protocol::{EntrySnapshot, EntryStatus, ReportRow, StatusReport},
};

const TIME_FORMAT: &str = "%x %H:%M:%S";
const MISSING: &str = "--";

pub fn format_duration(v: Duration) -> String {
    if v.num_hours() > 0 {
        format!(
            "{}h{}m{}s",
            v.num_hours(),
            v.num_minutes() % 60,
            v.num_seconds() % 60
        )
    } else if v.num_minutes() > 0 {
        format!("{}m{}s", v.num_minutes() % 60, v.num_seconds() % 60)
    } else {
        format!("{}s", v.num_seconds() % 60)
    }
}

fn format_time(v: DateTime<Utc>) -> String {
    v.with_timezone(&Local).format(TIME_FORMAT).to_string()
}

/// Strips directories some platforms report as part of the process name.
pub fn clean_process_name(value: &str) -> String {
    PathBuf::from(value)
        .file_name()
        .map(|v| v.to_string_lossy().to_string())
        .unwrap_or_else(|| value.to_string())
}

fn status_text(entry: &EntrySnapshot) -> String {
    match (entry.status, &entry.persist_error) {
        (EntryStatus::Running, _) => Colour::Green.paint("running").to_string(),
        (EntryStatus::Stopped, None) => Colour::Red.paint("stopped").to_string(),
        (EntryStatus::Stopped, Some(_)) => Colour::Yellow.paint("stopped (unsaved)").to_string(),
    }
}

pub fn entries_header(detailed: bool) -> String {
    if detailed {
        "TRACK ID\tPROCESS\tPID\tSTARTED\tSTOPPED\tRUNTIME\tSTATUS\tMODE\tCONNECTION".to_string()
    } else {
        "TRACK ID\tPROCESS\tSTARTED\tRUNTIME\tSTATUS".to_string()
    }
}

pub fn entry_row(entry: &EntrySnapshot, detailed: bool) -> String {
    let name = clean_process_name(&entry.process_name);
    let started = format_time(entry.started_at);
    let runtime = format_duration(entry.runtime);
    let status = status_text(entry);
    if !detailed {
        return format!("{}\t{name}\t{started}\t{runtime}\t{status}", entry.id);
    }

    let pid = entry.pid.map_or_else(|| MISSING.to_string(), |v| v.to_string());
    let stopped = entry
        .stopped_at
        .map_or_else(|| MISSING.to_string(), format_time);
    let mode = if entry.foreground {
        "foreground"
    } else {
        "background"
    };
    let connection = entry.connection.as_deref().unwrap_or(MISSING);
    format!(
        "{}\t{name}\t{pid}\t{started}\t{stopped}\t{runtime}\t{status}\t{mode}\t{connection}",
        entry.id
    )
}

pub fn print_entries(entries: &[EntrySnapshot], detailed: bool) {
    if entries.is_empty() {
        println!("No processes are being tracked");
        return;
    }
    println!("{}", entries_header(detailed));
    for entry in entries {
        println!("{}", entry_row(entry, detailed));
    }
    for entry in entries {
        if let Some(error) = &entry.persist_error {
            eprintln!(
                "{} session of {} is not saved yet: {error}",
                Colour::Yellow.paint("warning:"),
                entry.id
            );
        }
    }
}

pub fn print_status(status: &StatusReport) {
    println!("SERVER:\t{}", Colour::Green.paint("running"));
    println!("HOST:\t{}", status.address);
    println!("PID:\t{}", status.pid);
    println!("UPTIME:\t{}", format_duration(status.uptime));
    let tracked = status.running + status.stopped;
    if tracked == 0 {
        println!("TRACKED PROCESSES:\t0 (limit {})", status.limit);
    } else {
        println!(
            "TRACKED PROCESSES:\t{tracked} ({} running, {} stopped, limit {})",
            status.running, status.stopped, status.limit
        );
    }
    for error in &status.persist_errors {
        println!("{}\t{error}", Colour::Yellow.paint("UNSAVED:"));
    }
}

pub fn print_stopped_status(address: &str) {
    println!("SERVER:\t{}", Colour::Red.paint("stopped"));
    println!("HOST:\t{address}");
}

pub fn report_row(row: &ReportRow) -> String {
    format!(
        "{}\t{}\t{}",
        clean_process_name(&row.process_name),
        format_duration(row.total_runtime),
        row.active_days
    )
}

pub fn print_report(start: DateTime<Utc>, end: DateTime<Utc>, rows: &[ReportRow]) {
    println!("{} - {}", format_time(start), format_time(end));
    if rows.is_empty() {
        println!("Nothing was tracked in this range");
        return;
    }
    println!("PROCESS\tRUNTIME\tACTIVE DAYS");
    for row in rows {
        println!("{}", report_row(row));
    }
}

pub fn print_processes(processes: &[ProcessListing]) {
    println!("USER\tPID\tPROCESS");
    for process in processes {
        println!(
            "{}\t{}\t{}",
            process.user.as_deref().unwrap_or(MISSING),
            process.pid,
            process.name
        );
    }
}

pub fn print_config(config: &Config) {
    println!("IP:\t{}", config.bind_ip);
    println!("PORT:\t{}", config.port);
    println!("LIMIT:\t{}", config.max_tracked_processes);
}
