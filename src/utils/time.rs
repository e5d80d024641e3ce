use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone};

const RECORD_NAME_FORMAT: &str = "%Y-%m-%d";

/// This is the standard way of converting a date to a record file name in trakd.
pub fn date_to_record_name(date: NaiveDate) -> String {
    date.format(RECORD_NAME_FORMAT).to_string()
}

/// Inverse of [date_to_record_name]. Foreign files in the record directory yield `None`.
pub fn record_name_to_date(name: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(name, RECORD_NAME_FORMAT).ok()
}

/// Returns the first instant of the calendar day after the one `date` falls on. Days aren't
/// always 24 hours long, so the following date is taken first and then resolved in the zone.
/// When that midnight is skipped by a clock change the result is a plain day later, which still
/// lies after `date`.
pub fn next_day_start<Tz: TimeZone>(date: DateTime<Tz>) -> DateTime<Tz> {
    let tz = date.timezone();
    date.date_naive()
        .succ_opt()
        .and_then(|day| tz.from_local_datetime(&day.and_time(NaiveTime::MIN)).earliest())
        .unwrap_or_else(|| date + Duration::days(1))
}

/// Serializes [Duration] as whole seconds.
pub mod duration_secs {
    use chrono::Duration;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64(duration.num_seconds())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(s))
    }
}
