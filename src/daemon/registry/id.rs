use chrono::{DateTime, Utc};

use crate::{daemon::error::TrackError, process_api::ProcessIdentity};

pub const MIN_ID_LEN: usize = 3;
pub const MAX_ID_LEN: usize = 24;
const GENERATED_ID_LEN: usize = 12;

/// Ids chosen by the user have to be short and printable, they end up in tables and commands.
pub fn validate_id(id: &str) -> Result<(), TrackError> {
    let invalid = |reason: &str| TrackError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let len = id.chars().count();
    if !(MIN_ID_LEN..=MAX_ID_LEN).contains(&len) {
        return Err(invalid(&format!(
            "must be between {MIN_ID_LEN} and {MAX_ID_LEN} characters long"
        )));
    }
    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid("must not contain whitespace or control characters"));
    }
    Ok(())
}

/// Derives an id from the process and the moment it got registered. `attempt` is bumped by the
/// caller until the id is free.
pub fn generate_id(identity: &ProcessIdentity, registered_at: DateTime<Utc>, attempt: u32) -> String {
    let source = format!(
        "{}:{}:{}:{}:{attempt}",
        identity.pid,
        identity.start_time.unwrap_or_default(),
        identity.name,
        registered_at.timestamp_nanos_opt().unwrap_or_default(),
    );
    let digest = format!("{:x}", md5::compute(source));
    digest[..GENERATED_ID_LEN].to_string()
}
