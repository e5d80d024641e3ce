use std::{fmt::Display, path::Path};

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_english::parse_date_string;
use clap::{ArgGroup, Parser, ValueEnum};
use now::DateTimeNow;

use crate::{
    daemon::{report, storage::session_log::SessionLog, RECORDS_DIR},
    protocol::{Request, Response},
    utils::time::next_day_start,
};

use super::{client::DaemonClient, output::print_report};

const EXPLICIT_DATE_FORMATS: [&str; 2] = ["%Y/%m/%d", "%Y-%m-%d"];

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DateStyle {
    Uk,
    Us,
}

impl From<DateStyle> for chrono_english::Dialect {
    fn from(value: DateStyle) -> Self {
        match value {
            DateStyle::Uk => Self::Uk,
            DateStyle::Us => Self::Us,
        }
    }
}

impl Display for DateStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateStyle::Uk => write!(f, "uk"),
            DateStyle::Us => write!(f, "us"),
        }
    }
}

#[derive(Debug, Parser)]
#[command(group(ArgGroup::new("shortcut").args(["weekly", "monthly"]).conflicts_with_all(["start_date", "end_date"])))]
pub struct ReportCommand {
    #[arg(
        long = "start",
        short,
        help = "Start of the range. Examples are \"2025/05/21\", \"2025-05-21\", \"yesterday\", \"5 days ago\". Defaults to the start of today"
    )]
    start_date: Option<String>,
    #[arg(
        long = "end",
        short,
        help = "End of the range, a plain date includes the whole day. Defaults to now"
    )]
    end_date: Option<String>,
    #[arg(long, short, help = "Last 7 days including today")]
    weekly: bool,
    #[arg(long, short, help = "Last 30 days including today")]
    monthly: bool,
    #[arg(long, default_value_t = DateStyle::Uk, help = "Style of dates used during parsing. For Uk it's day/month/year. For Us it's month/day/year")]
    date_style: DateStyle,
}

/// Concrete `[start, end)` range a report covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRange {
    pub start: DateTime<Local>,
    pub end: DateTime<Local>,
}

impl ReportCommand {
    pub fn resolve(&self, now: DateTime<Local>) -> Result<ReportRange> {
        let range = if self.weekly {
            days_back(now, 7)
        } else if self.monthly {
            days_back(now, 30)
        } else {
            let dialect = self.date_style.into();
            let start = match &self.start_date {
                Some(value) => parse_bound(value, now, dialect)?.0,
                None => now.beginning_of_day(),
            };
            let end = match &self.end_date {
                Some(value) => match parse_bound(value, now, dialect)? {
                    (date, true) => next_day_start(date),
                    (time, false) => time,
                },
                None => now,
            };
            ReportRange { start, end }
        };

        if range.start >= range.end {
            bail!(
                "Start of the range ({}) must be before its end ({})",
                range.start,
                range.end
            );
        }
        Ok(range)
    }
}

fn days_back(now: DateTime<Local>, days: i64) -> ReportRange {
    ReportRange {
        start: now.beginning_of_day() - Duration::days(days - 1),
        end: now,
    }
}

/// Parses a range bound. The flag tells whether only a date was given.
fn parse_bound(
    value: &str,
    now: DateTime<Local>,
    dialect: chrono_english::Dialect,
) -> Result<(DateTime<Local>, bool)> {
    let value = value.trim();
    for format in EXPLICIT_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(value, format) {
            let Some(midnight) = Local
                .from_local_datetime(&date.and_time(NaiveTime::MIN))
                .earliest()
            else {
                bail!("{value} has no midnight in the local time zone");
            };
            return Ok((midnight, true));
        }
    }
    match parse_date_string(value, now, dialect) {
        Ok(v) => Ok((v, false)),
        Err(e) => bail!("Failed to parse date {value:?}: {e}"),
    }
}

/// Asks the daemon for the report. Without a daemon the log is read directly, which misses
/// sessions that are still running.
pub async fn process_report_command(command: ReportCommand, root: &Path) -> Result<()> {
    let range = command.resolve(Local::now())?;
    let start = range.start.with_timezone(&Utc);
    let end = range.end.with_timezone(&Utc);

    let client = DaemonClient::for_root(root);
    if client.is_running().await {
        match client.call(&Request::Report { start, end }).await? {
            Response::Report { start, end, rows } => print_report(start, end, &rows),
            other => bail!("Unexpected response {other:?}"),
        }
        return Ok(());
    }

    eprintln!("Daemon is not running, processes that are still tracked are not included");
    let log = SessionLog::new(root.join(RECORDS_DIR))?;
    let rows = report::aggregate(&log, vec![], start, end).await?;
    print_report(start, end, &rows);
    Ok(())
}

#[cfg(test)]
mod tests {
    use anyhow::Result;
    use chrono::{DateTime, Duration, Local, TimeZone};
    use clap::Parser;

    use super::ReportCommand;

    fn now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 5, 27, 15, 30, 0).unwrap()
    }

    fn midnight(day: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2025, 5, day, 0, 0, 0).unwrap()
    }

    fn command(args: &[&str]) -> ReportCommand {
        ReportCommand::parse_from(std::iter::once("report").chain(args.iter().copied()))
    }

    #[test]
    fn default_range_is_today_so_far() -> Result<()> {
        let range = command(&[]).resolve(now())?;
        assert_eq!(range.start, midnight(27));
        assert_eq!(range.end, now());
        Ok(())
    }

    #[test]
    fn explicit_end_date_includes_the_whole_day() -> Result<()> {
        let range = command(&["--start", "2025/05/21", "--end", "2025-05-26"]).resolve(now())?;
        assert_eq!(range.start, midnight(21));
        assert_eq!(range.end, midnight(27));
        Ok(())
    }

    #[test]
    fn shortcuts_cover_whole_days() -> Result<()> {
        let weekly = command(&["--weekly"]).resolve(now())?;
        assert_eq!(weekly.start, midnight(21));
        assert_eq!(weekly.end, now());

        let monthly = command(&["--monthly"]).resolve(now())?;
        assert_eq!(monthly.start, midnight(27) - Duration::days(29));
        Ok(())
    }

    #[test]
    fn relative_phrases_are_understood() -> Result<()> {
        let range = command(&["--start", "2 days ago"]).resolve(now())?;
        assert_eq!(range.start, now() - Duration::days(2));
        Ok(())
    }

    #[test]
    fn reversed_range_is_rejected() {
        assert!(command(&["--start", "2025/05/26", "--end", "2025/05/21"])
            .resolve(now())
            .is_err());
        assert!(command(&["--start", "bananas"]).resolve(now()).is_err());
    }

    #[test]
    fn shortcuts_conflict_with_explicit_bounds() {
        assert!(ReportCommand::try_parse_from(["report", "--weekly", "--start", "yesterday"]).is_err());
        assert!(ReportCommand::try_parse_from(["report", "--weekly", "--monthly"]).is_err());
    }
}
